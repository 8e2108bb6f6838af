//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use gmail_categorizer::categorizer::{Categorizer, CategorizerSettings};
use gmail_categorizer::client::{LabelInfo, MailboxClient};
use gmail_categorizer::error::{CategorizerError, Result};
use gmail_categorizer::models::{CategorySet, EmailMessage};
use gmail_categorizer::orchestrator::{BatchOrchestrator, OrchestratorSettings};
use gmail_categorizer::provider::{ClassificationProvider, Prompt};
use gmail_categorizer::retry::{RetryExecutor, RetryPolicy};
use mockall::mock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CATEGORIES: [&str; 5] = ["Work", "Personal", "Finance", "Shopping", "Newsletter"];

/// Create a test message with default values
pub fn create_test_message(id: &str, subject: &str) -> EmailMessage {
    EmailMessage::new(
        id,
        format!("thread_{}", id),
        "Sender <sender@example.com>",
        subject,
        "Hello, this is the message body.",
    )
    .with_label_ids(vec!["INBOX".to_string()])
}

pub fn category_set() -> CategorySet {
    CategorySet::new(CATEGORIES).unwrap()
}

/// Retry policy with millisecond delays
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        attempt_timeout: Some(Duration::from_secs(2)),
    }
}

pub fn json_reply(category: &str, confidence: f32) -> String {
    format!(
        r#"{{"category": "{}", "confidence": {}, "reasoning": "test"}}"#,
        category, confidence
    )
}

pub fn build_orchestrator(
    mailbox: Arc<dyn MailboxClient>,
    provider: Arc<dyn ClassificationProvider>,
    settings: OrchestratorSettings,
) -> BatchOrchestrator {
    let categorizer = Categorizer::new(
        provider,
        category_set(),
        RetryExecutor::new(fast_retry()),
        CategorizerSettings::default(),
    )
    .unwrap();
    BatchOrchestrator::new(mailbox, categorizer, settings)
}

pub fn default_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        retry: fast_retry(),
        ..OrchestratorSettings::default()
    }
}

// Mock implementations for expectation-style tests
mock! {
    pub Mailbox {}

    #[async_trait]
    impl MailboxClient for Mailbox {
        async fn list_message_ids(&self, query: &str, limit: usize) -> Result<Vec<String>>;
        async fn get_message(&self, id: &str) -> Result<EmailMessage>;
        async fn list_labels(&self) -> Result<Vec<LabelInfo>>;
        async fn get_label(&self, id: &str) -> Result<LabelInfo>;
        async fn create_label(&self, name: &str) -> Result<String>;
        async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<()>;
    }
}

mock! {
    pub Provider {}

    #[async_trait]
    impl ClassificationProvider for Provider {
        async fn complete(&self, prompt: &Prompt, max_tokens: u16, temperature: f32) -> Result<String>;
    }
}

/// In-memory mailbox that records every call
///
/// Labels created through it become visible to later `list_labels` calls.
pub struct FakeMailbox {
    messages: Vec<EmailMessage>,
    extra_ids: Vec<String>,
    labels: Mutex<Vec<LabelInfo>>,
    applied: Mutex<Vec<(String, String)>>,
    failing_gets: HashSet<String>,
    list_error: Option<fn() -> CategorizerError>,
    create_failures: AtomicUsize,
    conflict_on_create: bool,
    create_delay: Duration,
    get_delay: Duration,
    gets_in_flight: AtomicUsize,
    next_label: AtomicUsize,
    /// Most `get_message` calls seen running at once
    pub peak_gets_in_flight: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub list_label_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub apply_calls: AtomicUsize,
}

impl FakeMailbox {
    pub fn new(messages: Vec<EmailMessage>) -> Self {
        Self {
            messages,
            extra_ids: Vec::new(),
            labels: Mutex::new(vec![
                LabelInfo::system("INBOX", "INBOX"),
                LabelInfo::system("SPAM", "SPAM"),
            ]),
            applied: Mutex::new(Vec::new()),
            failing_gets: HashSet::new(),
            list_error: None,
            create_failures: AtomicUsize::new(0),
            conflict_on_create: false,
            create_delay: Duration::ZERO,
            get_delay: Duration::ZERO,
            gets_in_flight: AtomicUsize::new(0),
            next_label: AtomicUsize::new(1),
            peak_gets_in_flight: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            list_label_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            apply_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_messages(subjects: &[&str]) -> Self {
        let messages = subjects
            .iter()
            .enumerate()
            .map(|(i, subject)| create_test_message(&format!("msg{}", i + 1), subject))
            .collect();
        Self::new(messages)
    }

    pub fn with_label(self, id: &str, name: &str) -> Self {
        self.labels.lock().unwrap().push(LabelInfo::user(id, name));
        self
    }

    /// Also list ids that have no message behind them
    pub fn with_listed_ids(mut self, ids: &[&str]) -> Self {
        self.extra_ids.extend(ids.iter().map(|s| s.to_string()));
        self
    }

    pub fn failing_get(mut self, id: &str) -> Self {
        self.failing_gets.insert(id.to_string());
        self
    }

    pub fn failing_list(mut self, error: fn() -> CategorizerError) -> Self {
        self.list_error = Some(error);
        self
    }

    /// Next `count` creations fail with a permanent error
    pub fn failing_creates(self, count: usize) -> Self {
        self.create_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Creation stores the label but reports a conflict, as when another client won the race
    pub fn conflicting_creates(mut self) -> Self {
        self.conflict_on_create = true;
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Hold every `get_message` call open for `delay`
    pub fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = delay;
        self
    }

    pub fn applied(&self) -> Vec<(String, String)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn label_id(&self, name: &str) -> Option<String> {
        self.labels
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.id.clone())
    }

    pub fn user_label_names(&self) -> Vec<String> {
        self.labels
            .lock()
            .unwrap()
            .iter()
            .filter(|l| !l.is_system())
            .map(|l| l.name.clone())
            .collect()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailboxClient for FakeMailbox {
    async fn list_message_ids(&self, _query: &str, limit: usize) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.list_error {
            return Err(error());
        }
        Ok(self
            .messages
            .iter()
            .map(|m| m.id.clone())
            .chain(self.extra_ids.iter().cloned())
            .take(limit)
            .collect())
    }

    async fn get_message(&self, id: &str) -> Result<EmailMessage> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.gets_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_gets_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.get_delay.is_zero() {
            tokio::time::sleep(self.get_delay).await;
        }
        self.gets_in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_gets.contains(id) {
            return Err(CategorizerError::NotFound(format!("message {}", id)));
        }
        self.messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| CategorizerError::NotFound(format!("message {}", id)))
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        self.list_label_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.labels.lock().unwrap().clone())
    }

    /// Counts come from the seeded messages carrying the label
    async fn get_label(&self, id: &str) -> Result<LabelInfo> {
        let label = self
            .labels
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.id == id)
            .cloned()
            .ok_or_else(|| CategorizerError::NotFound(format!("label {}", id)))?;

        let tagged: Vec<&EmailMessage> = self
            .messages
            .iter()
            .filter(|m| m.label_ids.iter().any(|l| l == id))
            .collect();
        let unread = tagged
            .iter()
            .filter(|m| m.label_ids.iter().any(|l| l == "UNREAD"))
            .count();
        Ok(label.with_counts(tagged.len() as u32, unread as u32))
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        let remaining = self.create_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.create_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CategorizerError::LabelError(format!(
                "could not create '{}'",
                name
            )));
        }

        let mut labels = self.labels.lock().unwrap();
        if labels.iter().any(|l| l.name.eq_ignore_ascii_case(name)) {
            return Err(CategorizerError::Conflict(format!("'{}' exists", name)));
        }
        let id = format!("Label_{}", self.next_label.fetch_add(1, Ordering::SeqCst));
        labels.push(LabelInfo::user(id.clone(), name));

        if self.conflict_on_create {
            return Err(CategorizerError::Conflict(format!("'{}' exists", name)));
        }
        Ok(id)
    }

    async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.applied
            .lock()
            .unwrap()
            .push((message_id.to_string(), label_id.to_string()));
        Ok(())
    }
}

/// Provider answering by keyword found in the prompt
pub struct KeywordProvider {
    rules: Vec<(String, String)>,
    fallback: String,
    pub calls: AtomicUsize,
}

impl KeywordProvider {
    pub fn new(rules: &[(&str, String)], fallback: String) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|(keyword, reply)| (keyword.to_string(), reply.clone()))
                .collect(),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    /// Reply with `category` at high confidence for every message
    pub fn always(category: &str) -> Self {
        Self::new(&[], json_reply(category, 0.9))
    }
}

#[async_trait]
impl ClassificationProvider for KeywordProvider {
    async fn complete(&self, prompt: &Prompt, _max_tokens: u16, _temperature: f32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rules
            .iter()
            .find(|(keyword, _)| prompt.user.contains(keyword.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Provider that fails every call
pub struct FailingProvider {
    error: fn() -> CategorizerError,
    pub calls: AtomicUsize,
}

impl FailingProvider {
    pub fn new(error: fn() -> CategorizerError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ClassificationProvider for FailingProvider {
    async fn complete(&self, _prompt: &Prompt, _max_tokens: u16, _temperature: f32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_message() {
        let msg = create_test_message("msg1", "Quarterly report");
        assert_eq!(msg.id, "msg1");
        assert_eq!(msg.thread_id, "thread_msg1");
        assert_eq!(msg.subject, "Quarterly report");
    }

    #[tokio::test]
    async fn test_fake_mailbox_created_labels_are_listed() {
        let mailbox = FakeMailbox::with_messages(&["a"]);
        let id = mailbox.create_label("Work").await.unwrap();

        let labels = mailbox.list_labels().await.unwrap();
        assert!(labels.iter().any(|l| l.id == id && l.name == "Work"));
        assert!(matches!(
            mailbox.create_label("work").await,
            Err(CategorizerError::Conflict(_))
        ));
    }
}
