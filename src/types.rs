//! Core types for the knowledge store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Unique identifier for a record
pub type RecordId = String;

/// Importance bands for records
pub mod importance {
    /// Routine information
    pub const NONE: i32 = 0;
    /// Somewhat important, not critical
    pub const LOW: i32 = 25;
    /// Moderately important
    pub const MEDIUM: i32 = 50;
    /// Highly important
    pub const HIGH: i32 = 75;
    /// Must not be forgotten
    pub const CRITICAL: i32 = 100;
}

/// Common MIME types for record content
pub mod content_type {
    pub const JSON: &str = "application/json";
    pub const TEXT: &str = "text/plain";
    pub const YAML: &str = "application/yaml";
    pub const XML: &str = "application/xml";
    pub const CSV: &str = "text/csv";
    pub const BINARY: &str = "application/octet-stream";
    pub const HTML: &str = "text/html";
    pub const MARKDOWN: &str = "text/markdown";
}

/// High-level record category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Established truths: stack choices, policies, rules
    #[default]
    Fact,
    /// A single message in a conversation
    Message,
    /// A decision with its context and authority
    Decision,
    /// Something that was done
    Action,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Fact => "fact",
            Category::Message => "message",
            Category::Decision => "decision",
            Category::Action => "action",
        }
    }

    pub fn all() -> &'static [Category] {
        &[
            Category::Fact,
            Category::Message,
            Category::Decision,
            Category::Action,
        ]
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fact" => Ok(Category::Fact),
            "message" => Ok(Category::Message),
            "decision" => Ok(Category::Decision),
            "action" => Ok(Category::Action),
            _ => Err(format!("Unknown category: {}", s)),
        }
    }
}

/// Weak pointer to another record. Never validated for existence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    #[serde(alias = "ID")]
    pub id: RecordId,
    #[serde(rename = "type", alias = "Type", default)]
    pub ref_type: String,
}

impl Reference {
    pub fn new(id: impl Into<String>, ref_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ref_type: ref_type.into(),
        }
    }
}

/// A knowledge record
///
/// Deserialisation also accepts the PascalCase field names, `null` lists and
/// the `0001-01-01T00:00:00Z` zero time found in older store files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Record {
    /// Unique identifier
    #[serde(alias = "ID")]
    pub id: RecordId,
    #[serde(alias = "Category")]
    pub category: Category,
    /// MIME type of `content`
    #[serde(default, alias = "ContentType")]
    pub content_type: String,
    /// Opaque payload, base64 in JSON
    #[serde(default, alias = "Content", with = "base64_bytes")]
    pub content: Vec<u8>,
    /// See [`importance`] for the conventional bands
    #[serde(default, alias = "Importance")]
    pub importance: i32,
    /// `None` until the store stamps it
    #[serde(default, alias = "CreatedAt", deserialize_with = "zero_time::deserialize")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "UpdatedAt", deserialize_with = "zero_time::deserialize")]
    pub updated_at: Option<DateTime<Utc>>,
    /// `None` = never expires
    #[serde(default, alias = "ExpiresAt", deserialize_with = "zero_time::deserialize")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "SourceID")]
    pub source_id: String,
    /// e.g. "chat", "api", "observation"
    #[serde(default, alias = "SourceType")]
    pub source_type: String,
    #[serde(default, alias = "OwnerID")]
    pub owner_id: String,
    /// e.g. "agent", "human", "tool"
    #[serde(default, alias = "OwnerType")]
    pub owner_type: String,
    /// Who or what the record is about
    #[serde(default, alias = "SubjectIDs", deserialize_with = "null_default")]
    pub subject_ids: Vec<String>,
    #[serde(default, alias = "SubjectType")]
    pub subject_type: String,
    #[serde(default, alias = "Tags", deserialize_with = "null_default")]
    pub tags: Vec<String>,
    #[serde(default, alias = "References", deserialize_with = "null_default")]
    pub references: Vec<Reference>,
    #[serde(default, alias = "Metadata", deserialize_with = "null_default")]
    pub metadata: HashMap<String, String>,
}

impl Record {
    pub fn new(id: impl Into<String>, category: Category) -> Self {
        Self {
            id: id.into(),
            category,
            ..Default::default()
        }
    }

    /// Set UTF-8 text content along with its content type
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content = text.into().into_bytes();
        self.content_type = content_type::TEXT.to_string();
        self
    }

    pub fn with_content(mut self, content_type: impl Into<String>, content: Vec<u8>) -> Self {
        self.content_type = content_type.into();
        self.content = content;
        self
    }

    pub fn with_importance(mut self, importance: i32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_subjects<I, S>(mut self, subject_type: &str, subject_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subject_type = subject_type.to_string();
        self.subject_ids = subject_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source(mut self, source_type: &str, source_id: &str) -> Self {
        self.source_type = source_type.to_string();
        self.source_id = source_id.to_string();
        self
    }

    pub fn with_owner(mut self, owner_type: &str, owner_id: &str) -> Self {
        self.owner_type = owner_type.to_string();
        self.owner_id = owner_id.to_string();
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.references.push(reference);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Content as text, lossy for non UTF-8 payloads
    pub fn content_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    /// Equal to `other` when timestamps are ignored
    pub fn same_payload(&self, other: &Record) -> bool {
        let mut lhs = self.clone();
        lhs.created_at = other.created_at;
        lhs.updated_at = other.updated_at;
        lhs == *other
    }
}

/// Summary of a batch load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    /// Records that did not exist before
    pub inserted: usize,
    /// Existing records whose contents changed
    pub updated: usize,
    /// Existing records identical to the input
    pub unchanged: usize,
}

impl LoadSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Optional timestamps where year 1 (`0001-01-01T00:00:00Z`) means unset
mod zero_time {
    use chrono::{DateTime, Datelike, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let at = Option::<DateTime<Utc>>::deserialize(deserializer)?;
        Ok(at.filter(|t| t.year() > 1))
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
