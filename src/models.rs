use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use crate::error::{CategorizerError, Result};
use crate::rate_limiter::QuotaStats;

/// Fallback category, always a valid answer regardless of configuration
pub const OTHER_CATEGORY: &str = "Other";

/// Upper bound on the body text kept per message
pub const MAX_BODY_EXCERPT_CHARS: usize = 2000;

/// Confidence at or above which a classification counts as "high"
pub const HIGH_CONFIDENCE: f32 = 0.8;

/// Confidence below which a classification counts as "low"
pub const LOW_CONFIDENCE: f32 = 0.5;

/// Truncate to at most `max_chars` characters, marking the cut with "..."
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailMessage {
    pub id: String,
    pub thread_id: String,
    pub sender: String,
    pub subject: String,
    /// Bounded to [`MAX_BODY_EXCERPT_CHARS`]
    pub body_excerpt: String,
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

impl EmailMessage {
    /// Build a message, truncating the body to the excerpt bound
    pub fn new(
        id: impl Into<String>,
        thread_id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: &str,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            sender: sender.into(),
            subject: subject.into(),
            body_excerpt: truncate_chars(body.trim(), MAX_BODY_EXCERPT_CHARS),
            received_at: None,
            label_ids: Vec::new(),
        }
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn with_label_ids(mut self, label_ids: Vec<String>) -> Self {
        self.label_ids = label_ids;
        self
    }

    /// Text handed to the classifier: subject, sender and body lines, empty parts omitted
    pub fn content_for_categorization(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        if !self.subject.is_empty() {
            parts.push(format!("Subject: {}", self.subject));
        }
        if !self.sender.is_empty() {
            parts.push(format!("From: {}", self.sender));
        }
        if !self.body_excerpt.is_empty() {
            parts.push(format!("Content: {}", self.body_excerpt));
        }
        parts.join("\n")
    }
}

/// The closed set of category names a run may assign
///
/// Lookups are case-insensitive and return the configured spelling.
/// `"Other"` is always accepted even when not configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySet {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl CategorySet {
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self {
            names: Vec::new(),
            index: HashMap::new(),
        };

        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                return Err(CategorizerError::ConfigError(
                    "category names cannot be empty".to_string(),
                ));
            }
            let key = name.to_lowercase();
            if set.index.contains_key(&key) {
                return Err(CategorizerError::ConfigError(format!(
                    "duplicate category '{}'",
                    name
                )));
            }
            set.index.insert(key, set.names.len());
            set.names.push(name.to_string());
        }

        if set.names.is_empty() {
            return Err(CategorizerError::ConfigError(
                "at least one category must be configured".to_string(),
            ));
        }

        Ok(set)
    }

    /// Configured names in their configured order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Case-insensitive lookup returning the canonical spelling
    pub fn canonicalize(&self, name: &str) -> Option<&str> {
        let key = name.trim().to_lowercase();
        match self.index.get(&key) {
            Some(&i) => Some(self.names[i].as_str()),
            None if key == OTHER_CATEGORY.to_lowercase() => Some(OTHER_CATEGORY),
            None => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name) || name == OTHER_CATEGORY
    }

    /// Names offered to the model, with "Other" appended when not configured
    pub fn prompt_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.iter().map(String::as_str).collect();
        if !self.index.contains_key(&OTHER_CATEGORY.to_lowercase()) {
            names.push(OTHER_CATEGORY);
        }
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Category {
    pub name: String,
    /// Always within [0, 1]
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Category {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// The `Other`/0.0 sentinel
    pub fn fallback() -> Self {
        Self::new(OTHER_CATEGORY, 0.0)
    }

    pub fn is_fallback(&self) -> bool {
        self.name == OTHER_CATEGORY && self.confidence == 0.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LabelOutcome {
    Applied,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategorizationResult {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub category: Category,
    /// Configured category already labelled on the message before this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_category: Option<String>,
    pub outcome: LabelOutcome,
    /// Category is the fallback after a classification failure
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

impl CategorizationResult {
    /// A message that never reached classification
    pub fn failed(message_id: impl Into<String>, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            message_id: message_id.into(),
            thread_id: None,
            subject: None,
            category: Category::fallback(),
            previous_category: None,
            outcome: LabelOutcome::Failed,
            degraded: false,
            label_id: None,
            error: Some(error.into()),
            latency_ms,
        }
    }
}

/// Provider calls spent on a batch
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiUsage {
    /// Completion requests, retries included
    pub model_calls: u64,
    pub mailbox_calls: u64,
    pub quota_units: u64,
    /// Mailbox calls that waited for quota
    pub throttled_calls: u64,
}

impl ApiUsage {
    pub fn record_quota(&mut self, stats: QuotaStats) {
        self.mailbox_calls = stats.calls;
        self.quota_units = stats.units_consumed;
        self.throttled_calls = stats.throttled_calls;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProcessingResult {
    pub run_id: String,
    pub query: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub degraded: usize,
    /// Run stopped before every discovered message was processed
    pub cancelled: bool,
    #[serde(default)]
    pub labels_created: Vec<String>,
    #[serde(default)]
    pub api_usage: ApiUsage,
    pub results: Vec<CategorizationResult>,
}

impl BatchProcessingResult {
    /// Count per category, most frequent first, ties by name
    pub fn category_distribution(&self) -> Vec<(String, usize)> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for result in &self.results {
            *counts.entry(result.category.name.as_str()).or_insert(0) += 1;
        }
        let mut distribution: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect();
        distribution.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        distribution
    }

    pub fn average_confidence(&self) -> f32 {
        if self.results.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.results.iter().map(|r| r.category.confidence).sum();
        sum / self.results.len() as f32
    }

    pub fn high_confidence_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.category.confidence >= HIGH_CONFIDENCE)
            .count()
    }

    pub fn low_confidence_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.category.confidence < LOW_CONFIDENCE)
            .count()
    }

    /// Succeeded messages as a percentage of total
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64 * 100.0
    }

    pub fn failures(&self) -> impl Iterator<Item = &CategorizationResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == LabelOutcome::Failed)
    }

    pub async fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

/// Accumulates per-message results while a batch is running
///
/// Results may arrive in any order; each carries its discovery index and
/// the finished batch lists them in discovery order.
#[derive(Debug)]
pub struct BatchResultBuilder {
    run_id: String,
    query: String,
    started_at: DateTime<Utc>,
    started: Instant,
    entries: Vec<(usize, CategorizationResult)>,
    seen: HashSet<String>,
}

impl BatchResultBuilder {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            query: query.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Record one result. A second result for the same message id is ignored.
    pub fn push(&mut self, index: usize, result: CategorizationResult) -> bool {
        if !self.seen.insert(result.message_id.clone()) {
            tracing::warn!("Duplicate result for message {} ignored", result.message_id);
            return false;
        }
        self.entries.push((index, result));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(mut self, labels_created: Vec<String>, cancelled: bool) -> BatchProcessingResult {
        self.entries.sort_by_key(|(index, _)| *index);
        let results: Vec<CategorizationResult> =
            self.entries.into_iter().map(|(_, result)| result).collect();

        let count = |outcome: LabelOutcome| results.iter().filter(|r| r.outcome == outcome).count();
        let succeeded = count(LabelOutcome::Applied);
        let failed = count(LabelOutcome::Failed);
        let skipped = count(LabelOutcome::Skipped);
        let degraded = results.iter().filter(|r| r.degraded).count();

        BatchProcessingResult {
            run_id: self.run_id,
            query: self.query,
            started_at: self.started_at,
            completed_at: Utc::now(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            total: results.len(),
            succeeded,
            failed,
            skipped,
            degraded,
            cancelled,
            labels_created,
            api_usage: ApiUsage::default(),
            results,
        }
    }
}
