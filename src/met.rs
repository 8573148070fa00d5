//! Fetch collaborator for The Met collection object pages.

use std::time::Duration;

use scraper::{ElementRef, Html, Selector};

use crate::config::HarvestConfig;
use crate::fetch::{FetchError, Fetcher};
use crate::identifier::Identifier;
use crate::record::{FetchedItem, MissingCategory, MissingFlags, Record};

struct PageSelectors {
    description: Selector,
    details: Selector,
    detail_item: Selector,
    label: Selector,
    value: Selector,
    keywords: Selector,
}

impl PageSelectors {
    fn new() -> Result<Self, FetchError> {
        Ok(Self {
            description: parse_selector("div.artwork__intro__desc")?,
            details: parse_selector("div.show-more__body")?,
            detail_item: parse_selector("p.artwork-tombstone--item")?,
            label: parse_selector("span.artwork-tombstone--label")?,
            value: parse_selector("span.artwork-tombstone--value")?,
            keywords: parse_selector(r#"meta[name="keywords"]"#)?,
        })
    }
}

fn parse_selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|_| FetchError::Selector(css.to_string()))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

/// Turns a tombstone label such as `"Object Number:"` into a column name like `object_number`.
fn normalize_label(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let mut label: String = trimmed.chars().collect();
    label.pop()?;
    if label == "Classifications" {
        label = "Classification".to_string();
    }
    let label = label
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect::<String>()
        .to_lowercase();
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

/// Fetches object pages over HTTP and scrapes description, tombstone details and keywords.
pub struct MetPageFetcher {
    agent: ureq::Agent,
    base_url: String,
    id_column: String,
    selectors: PageSelectors,
}

impl MetPageFetcher {
    pub fn new(config: &HarvestConfig) -> Result<Self, FetchError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config.connect_timeout_secs))
            .timeout_read(Duration::from_secs(config.read_timeout_secs))
            .user_agent(&config.user_agent)
            .build();
        Ok(Self {
            agent,
            base_url: config.base_url.clone(),
            id_column: config.id_column.clone(),
            selectors: PageSelectors::new()?,
        })
    }

    pub fn url_for(&self, id: &Identifier) -> String {
        format!("{}{}", self.base_url, id)
    }

    /// Extracts a record from an already downloaded object page.
    pub fn parse_page(&self, id: &Identifier, html: &str) -> FetchedItem {
        let document = Html::parse_document(html);
        let selectors = &self.selectors;
        let mut record = Record::new(id.clone()).with_field(self.id_column.as_str(), id.to_string());
        let mut missing = MissingFlags::none();

        let description = match document.select(&selectors.description).next() {
            Some(element) => element_text(element).replace('\n', ""),
            None => {
                missing.set(MissingCategory::Description);
                String::new()
            }
        };
        record.insert("description", description);

        match document.select(&selectors.details).next() {
            Some(details) => {
                for item in details.select(&selectors.detail_item) {
                    let label = match item
                        .select(&selectors.label)
                        .next()
                        .and_then(|span| normalize_label(&element_text(span)))
                    {
                        Some(label) => label,
                        None => continue,
                    };
                    let value = item
                        .select(&selectors.value)
                        .next()
                        .map(|span| element_text(span).trim().to_string())
                        .unwrap_or_default();
                    record.insert(label, value);
                }
            }
            None => missing.set(MissingCategory::Details),
        }

        let keywords = match document
            .select(&selectors.keywords)
            .next()
            .and_then(|meta| meta.value().attr("content"))
        {
            Some(content) => content.to_string(),
            None => {
                missing.set(MissingCategory::Keywords);
                String::new()
            }
        };
        record.insert("keywords", keywords);

        FetchedItem { record, missing }
    }
}

impl Fetcher for MetPageFetcher {
    fn fetch(&self, id: &Identifier) -> Result<FetchedItem, FetchError> {
        let url = self.url_for(id);
        let response = self.agent.get(&url).call().map_err(|e| FetchError::Http {
            url: url.clone(),
            reason: match e {
                ureq::Error::Status(code, _) => format!("HTTP status {}", code),
                ureq::Error::Transport(transport) => transport.to_string(),
            },
        })?;
        let body = response
            .into_string()
            .map_err(|source| FetchError::Body { url: url.clone(), source })?;
        Ok(self.parse_page(id, &body))
    }
}
