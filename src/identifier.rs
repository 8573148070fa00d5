use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use flate2::read::GzDecoder;
use log::{info, warn};
use serde_json::Value;

use crate::error::Result;

/// Key naming one catalog item.
///
/// Numeric identifiers order numerically and sort before textual ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Numeric(u64),
    Text(String),
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Identifier::Numeric(a), Identifier::Numeric(b)) => a.cmp(b),
            (Identifier::Numeric(_), Identifier::Text(_)) => Ordering::Less,
            (Identifier::Text(_), Identifier::Numeric(_)) => Ordering::Greater,
            (Identifier::Text(a), Identifier::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(n) => write!(f, "{}", n),
            Identifier::Text(s) => f.write_str(s),
        }
    }
}

impl FromStr for Identifier {
    type Err = std::convert::Infallible;

    // Only canonical decimal forms become numeric so "007" survives a round trip.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.parse::<u64>() {
            Ok(n) if n.to_string() == trimmed => Ok(Identifier::Numeric(n)),
            _ => Ok(Identifier::Text(trimmed.to_string())),
        }
    }
}

impl From<u64> for Identifier {
    fn from(n: u64) -> Self {
        Identifier::Numeric(n)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }
}

impl Identifier {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(
                n.as_u64()
                    .map(Identifier::Numeric)
                    .unwrap_or_else(|| Identifier::Text(n.to_string())),
            ),
            Value::String(s) if !s.trim().is_empty() => Some(Identifier::from(s.as_str())),
            _ => None,
        }
    }
}

/// Loads the item database and returns its identifiers sorted and de-duplicated.
///
/// Accepts a JSON array of objects or JSON Lines (`.jsonl`), either optionally
/// gzip-compressed (`.gz`). Every object is expected to carry an `id` field.
pub fn load_identifiers<P: AsRef<Path>>(path: P) -> Result<Vec<Identifier>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let name = path.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();
    let reader: Box<dyn Read> = if name.ends_with(".gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let stem = name.trim_end_matches(".gz");

    let entries: Vec<Value> = if stem.ends_with(".jsonl") {
        let mut entries = Vec::new();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        entries
    } else {
        serde_json::from_reader(BufReader::new(reader))?
    };

    let total = entries.len();
    let mut missing_id = 0;
    let mut ids: Vec<Identifier> = entries
        .iter()
        .filter_map(|entry| {
            let id = entry.get("id").and_then(Identifier::from_json);
            if id.is_none() {
                missing_id += 1;
            }
            id
        })
        .collect();
    if missing_id > 0 {
        warn!("Skipped {} entries in {} without a usable 'id' field", missing_id, path.display());
    }

    ids.sort();
    let before = ids.len();
    ids.dedup();
    if ids.len() < before {
        warn!("Dropped {} duplicate identifiers from {}", before - ids.len(), path.display());
    }
    info!("Loaded {} identifiers from {} entries in {}", ids.len(), total, path.display());
    Ok(ids)
}
