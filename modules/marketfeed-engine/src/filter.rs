use marketfeed_common::CandidateRecord;

/// Category policy applied to each candidate record before it is
/// accepted. Selectable per source.
#[derive(Debug, Clone)]
pub enum RecordFilter {
    /// No category policy. Deal/insider stores carry no taxonomy.
    All,
    /// Keep only categories present in the allow list; drop the record
    /// if none survive.
    IncludeOnly(Vec<String>),
    /// Re-home arbitrary source category strings onto the canonical
    /// prioritized set.
    Taxonomy(TaxonomyMap),
}

impl RecordFilter {
    pub fn include_only<S: Into<String>>(allowed: impl IntoIterator<Item = S>) -> Self {
        RecordFilter::IncludeOnly(allowed.into_iter().map(Into::into).collect())
    }

    /// Apply the policy. `None` means the record is dropped entirely;
    /// otherwise the record comes back with its categories rewritten
    /// (deduplicated, first-seen order preserved).
    pub fn apply(&self, mut record: CandidateRecord) -> Option<CandidateRecord> {
        match self {
            RecordFilter::All => Some(record),
            RecordFilter::IncludeOnly(allowed) => {
                let kept = dedup_preserving_order(
                    record
                        .categories
                        .iter()
                        .filter(|c| allowed.iter().any(|a| a.eq_ignore_ascii_case(c)))
                        .cloned(),
                );
                if kept.is_empty() {
                    return None;
                }
                record.categories = kept;
                Some(record)
            }
            RecordFilter::Taxonomy(map) => {
                record.categories = map.normalize_all(&record.categories);
                Some(record)
            }
        }
    }
}

/// Maps raw source category text onto a fixed, prioritized canonical
/// list. Matching order: special-word substring overrides, exact
/// singular/plural match, substring containment in priority order,
/// then the catch-all "Other" bucket.
#[derive(Debug, Clone)]
pub struct TaxonomyMap {
    /// Canonical categories in priority order. "Other" must be last.
    priority: Vec<String>,
    /// Substring overrides checked before anything else, in
    /// declaration order.
    special_words: Vec<(String, String)>,
}

impl Default for TaxonomyMap {
    /// The taxonomy the cross-source news normalization pass ships
    /// with.
    fn default() -> Self {
        Self::new(
            [
                "Stock",
                "IPOs",
                "Companies",
                "Markets",
                "Economy",
                "Finance",
                "Business",
                "Industry",
                "Technology",
                "Research",
                "Other",
            ],
            [
                ("money", "Finance"),
                ("banking", "Finance"),
                ("economic", "Economy"),
                ("equity", "Markets"),
                ("commodities", "Industry"),
                ("commodity", "Industry"),
                ("asset", "Business"),
            ],
        )
    }
}

impl TaxonomyMap {
    pub fn new<P, S, T>(
        priority: impl IntoIterator<Item = P>,
        special_words: impl IntoIterator<Item = (S, T)>,
    ) -> Self
    where
        P: Into<String>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            priority: priority.into_iter().map(Into::into).collect(),
            special_words: special_words
                .into_iter()
                .map(|(w, c)| (w.into(), c.into()))
                .collect(),
        }
    }

    /// Map one raw category string to its canonical form.
    pub fn map_category(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return "Other".to_string();
        }
        let lower = trimmed.to_lowercase();

        // 1. Special-word substring overrides.
        for (word, mapped) in &self.special_words {
            if lower.contains(word.as_str()) {
                return mapped.clone();
            }
        }

        // 2. Exact match after singular/plural normalization.
        let normalized = singularize(&lower);
        for allowed in &self.priority {
            if singularize(&allowed.to_lowercase()) == normalized {
                return allowed.clone();
            }
        }

        // 3. Substring containment in priority order.
        for allowed in &self.priority {
            if lower.contains(&allowed.to_lowercase()) {
                return allowed.clone();
            }
        }

        // 4. No match at all.
        "Other".to_string()
    }

    /// Normalize a list of raw categories: map each, then deduplicate
    /// preserving first-seen order.
    pub fn normalize_all(&self, raw: &[String]) -> Vec<String> {
        dedup_preserving_order(raw.iter().map(|c| self.map_category(c)))
    }

    /// Re-home a comma-joined category string, the form the file store
    /// carries. Used by the post-collection normalization pass.
    pub fn normalize_joined(&self, raw: &str) -> String {
        let parts: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if parts.is_empty() {
            return "Other".to_string();
        }
        self.normalize_all(&parts).join(", ")
    }
}

/// Plural-to-singular normalization for matching: "stocks" -> "stock",
/// but "business" stays intact.
fn singularize(word: &str) -> String {
    if word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

fn dedup_preserving_order(categories: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    for cat in categories {
        if seen.insert(cat.clone()) {
            result.push(cat);
        }
    }
    result
}
