use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record as delivered by a source adapter, before filtering and
/// persistence. Transient: only the accepted form (`PersistedRecord`)
/// ever reaches a sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateRecord {
    /// Which adapter produced this record ("moneycontrol", "bse_bulk", ...).
    pub source_id: String,
    /// Uniqueness key for deduplication. Adapters compose it from the
    /// fields that define identity for their record shape: a link URL
    /// for news, `source|date|security|counterparty|side|qty|price`
    /// for deals, and so on.
    pub natural_key: String,
    /// Raw category labels, in the order the source delivered them.
    /// Empty for stores that carry no taxonomy (deals, insider trades).
    pub categories: Vec<String>,
    /// Everything else the adapter extracted (headline, security name,
    /// quantities...). BTreeMap keeps serialization deterministic.
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Source-reported timestamp of the underlying fact.
    pub observed_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub fn new(
        source_id: impl Into<String>,
        natural_key: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            natural_key: natural_key.into(),
            categories: Vec::new(),
            fields: BTreeMap::new(),
            observed_at,
        }
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// The stored form of an accepted record. Never updated in place;
/// corrections are out of scope and pruning is a separate maintenance
/// concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedRecord {
    pub natural_key: String,
    pub source_id: String,
    pub categories: Vec<String>,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub observed_at: DateTime<Utc>,
}

impl From<CandidateRecord> for PersistedRecord {
    fn from(c: CandidateRecord) -> Self {
        Self {
            natural_key: c.natural_key,
            source_id: c.source_id,
            categories: c.categories,
            fields: c.fields,
            observed_at: c.observed_at,
        }
    }
}

/// Per-job synchronization state. Created on first run, mutated only by
/// the job scheduler, persisted across process restarts so the startup
/// staleness check has something to compare against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub enabled: bool,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            last_success_at: None,
            consecutive_failures: 0,
            enabled: true,
        }
    }
}
