//! Core data models used throughout content-sync.
//!
//! These types represent the documents, counters, and version snapshots that
//! flow through reconciliation, embedding backfill, and the editing path.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A typed front-matter value.
///
/// Serialized untagged so JSON and YAML keep their natural shapes
/// (`"text"`, `3`, `true`, `["a", "b"]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
    StringArray(Vec<String>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Short type name used in validation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::StringArray(_) => "string array",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringArray(v)
    }
}

/// Arbitrary document metadata, ordered by key for stable serialization.
pub type Fields = BTreeMap<String, Value>;

/// The kind of content a document belongs to. Each kind has its own
/// collection in the store and its own directory in the content root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Post,
    Page,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::Post, EntityType::Page];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Post => "post",
            EntityType::Page => "page",
        }
    }

    /// Directory name under the content root.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Post => "posts",
            EntityType::Page => "pages",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "post" | "posts" => Ok(EntityType::Post),
            "page" | "pages" => Ok(EntityType::Page),
            other => bail!("Unknown entity type: '{}'. Available: post, page", other),
        }
    }
}

/// One synchronizable content unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier, unique within an entity type.
    pub slug: String,
    /// Markdown body.
    pub content: String,
    #[serde(default)]
    pub fields: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f64>>,
    /// Set only by the reconciler. `None` marks documents authored through
    /// another entry point; those are never deleted by reconciliation.
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(slug: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            content: content.into(),
            fields: Fields::new(),
            embedding: None,
            last_synced_at: None,
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.fields.get("title").and_then(Value::as_str)
    }

    pub fn is_sync_managed(&self) -> bool {
        self.last_synced_at.is_some()
    }

    /// Drafts and explicitly unpublished documents are not embedded.
    pub fn is_publishable(&self) -> bool {
        let draft = self.fields.get("draft").and_then(Value::as_bool) == Some(true);
        let unpublished = self.fields.get("published").and_then(Value::as_bool) == Some(false);
        !draft && !unpublished
    }

    /// Whether any tracked field differs. `embedding` and `last_synced_at`
    /// are derived and never take part in the comparison.
    pub fn differs_from(&self, other: &Document) -> bool {
        self.content != other.content || self.fields != other.fields
    }

    /// Whether the text used for the semantic representation differs.
    pub fn semantic_text_differs(&self, other: &Document) -> bool {
        self.content != other.content || self.title() != other.title()
    }
}

/// Counters reported by a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
}

impl Summary {
    pub fn merge(&mut self, other: Summary) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
    }

    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} deleted={} skipped={}",
            self.created, self.updated, self.deleted, self.skipped
        )
    }
}

/// Immutable copy of a document's editable state taken before an edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub id: String,
    pub content_type: String,
    pub content_id: String,
    pub title: Option<String>,
    pub content: String,
    pub fields: Fields,
    pub created_at: DateTime<Utc>,
}
