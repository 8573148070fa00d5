use std::collections::BTreeMap;
use std::fmt;

use crate::identifier::Identifier;

/// Diagnostic categories recorded when the catalog page lacks a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MissingCategory {
    Description,
    Details,
    Keywords,
}

impl MissingCategory {
    pub const ALL: [MissingCategory; 3] = [
        MissingCategory::Description,
        MissingCategory::Details,
        MissingCategory::Keywords,
    ];

    /// File suffix used for both partition-scoped and global missing files.
    pub fn as_str(self) -> &'static str {
        match self {
            MissingCategory::Description => "no_description",
            MissingCategory::Details => "no_details",
            MissingCategory::Keywords => "no_keywords",
        }
    }

    fn bit(self) -> u8 {
        match self {
            MissingCategory::Description => 0b001,
            MissingCategory::Details => 0b010,
            MissingCategory::Keywords => 0b100,
        }
    }
}

impl fmt::Display for MissingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of categories that could not be populated for one identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MissingFlags {
    bits: u8,
}

impl MissingFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        MissingCategory::ALL.iter().fold(Self::none(), |flags, &c| flags.with(c))
    }

    pub fn with(mut self, category: MissingCategory) -> Self {
        self.set(category);
        self
    }

    pub fn set(&mut self, category: MissingCategory) {
        self.bits |= category.bit();
    }

    pub fn contains(&self, category: MissingCategory) -> bool {
        self.bits & category.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = MissingCategory> + '_ {
        MissingCategory::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

/// Field values fetched for one identifier. Absent fields are blank cells downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: Identifier,
    pub fields: BTreeMap<String, String>,
}

impl Record {
    pub fn new(id: Identifier) -> Self {
        Self { id, fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// A successful fetch: the record plus whatever the page failed to provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedItem {
    pub record: Record,
    pub missing: MissingFlags,
}

impl FetchedItem {
    /// Stand-in for an item whose fetch failed: identifier only, every category flagged.
    pub fn unavailable(id: Identifier) -> Self {
        Self {
            record: Record::new(id),
            missing: MissingFlags::all(),
        }
    }
}
