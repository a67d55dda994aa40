//! Record types stored in and returned from the cache.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Divergence of a cached record from the remote source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineState {
    Synced,
    LocallyCreated,
    LocallyModified,
    LocallyDeleted,
}

impl OfflineState {
    pub(crate) fn to_db(self) -> i64 {
        match self {
            OfflineState::Synced => 0,
            OfflineState::LocallyCreated => 1,
            OfflineState::LocallyModified => 2,
            OfflineState::LocallyDeleted => 3,
        }
    }

    pub(crate) fn from_db(value: i64) -> Result<Self> {
        match value {
            0 => Ok(OfflineState::Synced),
            1 => Ok(OfflineState::LocallyCreated),
            2 => Ok(OfflineState::LocallyModified),
            3 => Ok(OfflineState::LocallyDeleted),
            other => Err(CacheError::Storage(rusqlite::Error::IntegralValueOutOfRange(
                3, other,
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineState::Synced => "synced",
            OfflineState::LocallyCreated => "locally-created",
            OfflineState::LocallyModified => "locally-modified",
            OfflineState::LocallyDeleted => "locally-deleted",
        }
    }
}

impl fmt::Display for OfflineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One indexed summary value of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaField {
    pub field: String,
    pub value: String,
}

/// Ordered, possibly multi-valued summary fields of a record.
///
/// Field names are stored lower-case; repeated fields keep their insertion
/// order, which becomes their `seq` in storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaFields(Vec<MetaField>);

impl MetaFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: &str) -> Self {
        self.push(field, value);
        self
    }

    pub fn push(&mut self, field: &str, value: &str) {
        self.0.push(MetaField {
            field: field.trim().to_ascii_lowercase(),
            value: value.to_string(),
        });
    }

    /// First value of `field`.
    pub fn first(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|m| m.field.eq_ignore_ascii_case(field))
            .map(|m| m.value.as_str())
    }

    pub fn values<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |m| m.field.eq_ignore_ascii_case(field))
            .map(|m| m.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetaField> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, String)> for MetaFields {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut meta = MetaFields::new();
        for (field, value) in iter {
            meta.push(&field, &value);
        }
        meta
    }
}

/// A record as handed to the cache by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub uid: String,
    /// Record revision; the cache stamps one when absent.
    pub revision: Option<String>,
    /// Serialized body (vCard / iCalendar text), opaque to the cache.
    pub body: String,
    pub meta: MetaFields,
    /// Backend-private locator, e.g. an ETag or remote href.
    pub extra: Option<String>,
}

impl Record {
    pub fn new(uid: &str, body: &str) -> Self {
        Self {
            uid: uid.to_string(),
            revision: None,
            body: body.to_string(),
            meta: MetaFields::new(),
            extra: None,
        }
    }

    pub fn with_meta(mut self, meta: MetaFields) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_extra(mut self, extra: &str) -> Self {
        self.extra = Some(extra.to_string());
        self
    }

    pub fn with_revision(mut self, revision: &str) -> Self {
        self.revision = Some(revision.to_string());
        self
    }
}

/// A record read back from the cache together with its offline state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub record: Record,
    pub state: OfflineState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SearchContent {
    Full(String),
    /// Only the indexed summary fields, for listings that skip the body.
    Meta(MetaFields),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchData {
    pub uid: String,
    pub extra: Option<String>,
    pub content: SearchContent,
}

impl SearchData {
    pub fn body(&self) -> Option<&str> {
        match &self.content {
            SearchContent::Full(body) => Some(body),
            SearchContent::Meta(_) => None,
        }
    }
}

/// Entry of the offline-change ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineChange {
    pub uid: String,
    pub revision: Option<String>,
    pub state: OfflineState,
}
