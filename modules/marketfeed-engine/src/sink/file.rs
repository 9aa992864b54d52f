use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use marketfeed_common::{PersistedRecord, SyncError};

use super::Sink;
use crate::filter::TaxonomyMap;

/// File-backed sink: one JSON-Lines file per store, newest records
/// first.
///
/// The per-store lock map is constructed once from the configured
/// store list and never rebuilt; an unknown store name is a
/// configuration error. Writes go through a temp file in the same
/// directory followed by an atomic rename, so a crash mid-write never
/// corrupts previously committed records.
pub struct FileSink {
    dir: PathBuf,
    locks: HashMap<String, Mutex<()>>,
}

impl FileSink {
    pub fn new<S: Into<String>>(
        dir: impl Into<PathBuf>,
        stores: impl IntoIterator<Item = S>,
    ) -> Result<Self, SyncError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let locks = stores
            .into_iter()
            .map(|s| (s.into(), Mutex::new(())))
            .collect();
        Ok(Self { dir, locks })
    }

    fn lock_for(&self, store: &str) -> Result<&Mutex<()>, SyncError> {
        self.locks
            .get(store)
            .ok_or_else(|| SyncError::Config(format!("unknown store {store:?}")))
    }

    fn path_for(&self, store: &str) -> PathBuf {
        self.dir.join(format!("{store}.jsonl"))
    }

    /// Read every record in a store. Torn or malformed lines (for
    /// example the tail of an interrupted append from a pre-atomic
    /// deployment) are skipped with a warning rather than poisoning
    /// the store.
    fn read_records(path: &Path) -> Result<Vec<PersistedRecord>, SyncError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let mut records = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PersistedRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), line = line_no + 1, error = %err,
                        "Skipping malformed record line");
                }
            }
        }
        Ok(records)
    }

    /// Replace the store file in one atomic step.
    fn write_records(&self, path: &Path, records: &[PersistedRecord]) -> Result<(), SyncError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| SyncError::Storage(format!("temp file: {e}")))?;
        for record in records {
            serde_json::to_writer(&mut tmp, record)?;
            tmp.write_all(b"\n")?;
        }
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| SyncError::Storage(format!("atomic rename: {e}")))?;
        Ok(())
    }

    /// Cross-source normalization pass: re-home every stored record's
    /// categories through the taxonomy. Returns how many records
    /// changed.
    pub async fn normalize_categories(
        &self,
        store: &str,
        taxonomy: &TaxonomyMap,
    ) -> Result<u64, SyncError> {
        let _guard = self.lock_for(store)?.lock().await;
        let path = self.path_for(store);
        let mut records = Self::read_records(&path)?;

        let mut changed = 0u64;
        for record in &mut records {
            let normalized = taxonomy.normalize_all(&record.categories);
            if normalized != record.categories {
                record.categories = normalized;
                changed += 1;
            }
        }

        if changed > 0 {
            self.write_records(&path, &records)?;
            info!(store, changed, "Normalized store categories");
        }
        Ok(changed)
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn known_keys(&self, store: &str) -> Result<HashSet<String>, SyncError> {
        let _guard = self.lock_for(store)?.lock().await;
        let records = Self::read_records(&self.path_for(store))?;
        Ok(records.into_iter().map(|r| r.natural_key).collect())
    }

    async fn insert_if_absent(
        &self,
        store: &str,
        records: &[PersistedRecord],
    ) -> Result<u64, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock_for(store)?.lock().await;
        let path = self.path_for(store);
        let existing = Self::read_records(&path)?;
        let mut present: HashSet<&str> = existing.iter().map(|r| r.natural_key.as_str()).collect();

        let mut fresh: Vec<PersistedRecord> = Vec::new();
        for record in records {
            if present.contains(record.natural_key.as_str()) {
                continue;
            }
            // Also guards against a duplicate key within one batch.
            present.insert(record.natural_key.as_str());
            fresh.push(record.clone());
        }

        if fresh.is_empty() {
            debug!(store, batch = records.len(), "Batch fully deduplicated");
            return Ok(0);
        }

        let inserted = fresh.len() as u64;
        // Newest records first: the incoming batch ahead of what was
        // already on disk.
        fresh.extend(existing);
        self.write_records(&path, &fresh)?;
        debug!(store, inserted, "Inserted records");
        Ok(inserted)
    }

    async fn compact(&self, store: &str) -> Result<u64, SyncError> {
        let _guard = self.lock_for(store)?.lock().await;
        let path = self.path_for(store);
        let records = Self::read_records(&path)?;
        if records.is_empty() {
            return Ok(0);
        }

        let before = records.len();
        let mut seen: HashSet<String> = HashSet::new();
        let mut kept: Vec<PersistedRecord> = records
            .into_iter()
            .filter(|r| seen.insert(r.natural_key.clone()))
            .collect();

        let date_field = detect_date_field(&kept);
        kept.sort_by_key(|r| std::cmp::Reverse(record_sort_time(r, date_field.as_deref())));

        let removed = (before - kept.len()) as u64;
        self.write_records(&path, &kept)?;
        if removed > 0 {
            info!(store, removed, "Compacted store");
        }
        Ok(removed)
    }
}

/// Find a field whose name looks like a date/time column. Tabular
/// sources carry their own date column ("Deal Date", "BROADCAST
/// DATE/TIME"); news records rely on `observed_at`.
fn detect_date_field(records: &[PersistedRecord]) -> Option<String> {
    let first = records.first()?;
    first
        .fields
        .keys()
        .find(|name| {
            let lower = name.to_lowercase();
            lower.contains("date") || lower.contains("time")
        })
        .cloned()
}

/// Sort timestamp for one record: the detected date-like field when it
/// parses, otherwise the adapter-reported observation time.
fn record_sort_time(record: &PersistedRecord, date_field: Option<&str>) -> DateTime<Utc> {
    if let Some(name) = date_field {
        if let Some(serde_json::Value::String(raw)) = record.fields.get(name) {
            if let Some(parsed) = parse_date_lenient(raw) {
                return parsed;
            }
        }
    }
    record.observed_at
}

/// Accept the date shapes the sources actually emit.
fn parse_date_lenient(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d", "%d-%b-%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
        }
    }
    None
}
