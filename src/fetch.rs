use thiserror::Error;

use crate::identifier::Identifier;
use crate::record::FetchedItem;

/// Recoverable failure for a single identifier. The worker downgrades it to an empty record.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {url} failed: {reason}")]
    Http { url: String, reason: String },
    #[error("could not read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid selector '{0}'")]
    Selector(String),
}

/// Looks up one catalog item.
///
/// Implementations must be shareable across worker threads; each worker calls
/// `fetch` sequentially for its own partition.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, id: &Identifier) -> Result<FetchedItem, FetchError>;
}

impl<F> Fetcher for F
where
    F: Fn(&Identifier) -> Result<FetchedItem, FetchError> + Send + Sync,
{
    fn fetch(&self, id: &Identifier) -> Result<FetchedItem, FetchError> {
        self(id)
    }
}
