use std::fs::File;
use std::path::Path;

use serde::Deserialize;

use crate::error::{HarvestError, Result};

pub const DEFAULT_BASE_URL: &str = "https://www.metmuseum.org/art/collection/search/";
pub const DEFAULT_FLUSH_EVERY: usize = 10;
pub const DEFAULT_WORKERS: usize = 5;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HarvestConfig {
    pub base_url: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub delay: DelayConfig,
    pub flush_every: usize,
    pub workers: usize,
    pub id_column: String,
}

/// Bounds of the uniform pause taken after every fetch.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct DelayConfig {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self { min_secs: 0.0, max_secs: 2.0 }
    }
}

impl DelayConfig {
    pub fn none() -> Self {
        Self { min_secs: 0.0, max_secs: 0.0 }
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: format!("met-harvest/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 5,
            read_timeout_secs: 30,
            delay: DelayConfig::default(),
            flush_every: DEFAULT_FLUSH_EVERY,
            workers: DEFAULT_WORKERS,
            id_column: "met_id".to_string(),
        }
    }
}

impl HarvestConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: HarvestConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(HarvestError::InvalidWorkerCount);
        }
        if self.flush_every == 0 {
            return Err(HarvestError::Configuration("flush_every must be at least 1".into()));
        }
        let DelayConfig { min_secs, max_secs } = self.delay;
        if !(min_secs.is_finite() && max_secs.is_finite()) || min_secs < 0.0 || min_secs > max_secs {
            return Err(HarvestError::Configuration(format!(
                "delay bounds must satisfy 0 <= min <= max (got {} and {})",
                min_secs, max_secs
            )));
        }
        if self.id_column.trim().is_empty() {
            return Err(HarvestError::Configuration("id_column must not be empty".into()));
        }
        Ok(())
    }
}
