use std::collections::BTreeMap;

/// How one source fared inside a group run.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: String,
    pub store: String,
    pub accepted: u64,
    pub inserted: u64,
    pub pages: u32,
    pub drained: bool,
    /// Present when the source produced zero records this run (retries
    /// exhausted, credentials expired, or the worker panicked).
    pub error: Option<String>,
}

impl SourceOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate report for one group run.
#[derive(Debug, Default)]
pub struct GroupReport {
    pub group: String,
    pub outcomes: Vec<SourceOutcome>,
    /// Records inserted per store across the whole run.
    pub inserted_by_store: BTreeMap<String, u64>,
    /// Duplicates removed by the post-run compaction, per store.
    pub compacted_by_store: BTreeMap<String, u64>,
}

impl GroupReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// True when every source in a non-empty run failed. The scheduler
    /// uses this to decide whether the run counts as a success.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.succeeded() == 0
    }

    pub fn total_inserted(&self) -> u64 {
        self.inserted_by_store.values().sum()
    }
}

impl std::fmt::Display for GroupReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Group '{}' Run Complete ===", self.group)?;
        writeln!(f, "Sources run:      {}", self.outcomes.len())?;
        writeln!(f, "Sources failed:   {}", self.failed())?;
        writeln!(f, "Records inserted: {}", self.total_inserted())?;
        writeln!(f, "\nBy source:")?;
        for outcome in &self.outcomes {
            match &outcome.error {
                None => writeln!(
                    f,
                    "  {}: {} inserted over {} pages{}",
                    outcome.source_id,
                    outcome.inserted,
                    outcome.pages,
                    if outcome.drained { " (drained)" } else { "" }
                )?,
                Some(err) => writeln!(f, "  {}: FAILED ({err})", outcome.source_id)?,
            }
        }
        if !self.compacted_by_store.is_empty() {
            writeln!(f, "\nCompaction:")?;
            for (store, removed) in &self.compacted_by_store {
                writeln!(f, "  {store}: {removed} duplicates removed")?;
            }
        }
        Ok(())
    }
}
