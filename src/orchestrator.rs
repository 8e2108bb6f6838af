//! Batch pipeline: discover, classify, label, aggregate
//!
//! A run lists message ids for a query, then pushes each id through
//! fetch → classify → resolve label → apply label on a bounded pool of
//! concurrent workers. Every discovered message ends up with exactly one
//! [`CategorizationResult`]; only setup failures (bad arguments, listing
//! errors such as expired credentials) make the run itself fail.
//!
//! Results are reported in discovery order regardless of completion order.

use futures::future;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::categorizer::{Categorizer, Classification};
use crate::client::MailboxClient;
use crate::error::{CategorizerError, Result};
use crate::label_resolver::{category_label_coverage, LabelResolver};
use crate::models::{BatchProcessingResult, BatchResultBuilder, CategorizationResult, LabelOutcome};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Called once per finished message
pub type ProgressCallback = Arc<dyn Fn(&CategorizationResult) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Messages processed at the same time
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Classifications below this confidence are not labelled
    pub min_label_confidence: f32,
    pub label_prefix: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry: RetryPolicy::default(),
            min_label_confidence: 0.0,
            label_prefix: None,
        }
    }
}

/// What `check_setup` found
#[derive(Debug, Clone)]
pub struct SetupReport {
    pub labels_found: usize,
    /// Categories whose label already exists
    pub labelled_categories: Vec<String>,
    /// Categories whose label would be created on first use
    pub unlabelled_categories: Vec<String>,
    pub sample_classification: Classification,
}

pub struct BatchOrchestrator {
    mailbox: Arc<dyn MailboxClient>,
    categorizer: Categorizer,
    retry: RetryExecutor,
    settings: OrchestratorSettings,
    on_progress: Option<ProgressCallback>,
}

impl BatchOrchestrator {
    pub fn new(
        mailbox: Arc<dyn MailboxClient>,
        categorizer: Categorizer,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            mailbox,
            categorizer,
            retry: RetryExecutor::new(settings.retry.clone()),
            settings,
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Process up to `max_messages` messages matching `query`
    pub async fn run(
        &self,
        query: &str,
        max_messages: usize,
        apply_labels: bool,
    ) -> Result<BatchProcessingResult> {
        self.run_with_cancellation(query, max_messages, apply_labels, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), stopping early once `cancel` fires
    ///
    /// No new messages are started after cancellation; messages already in
    /// flight finish and the partial result is returned with `cancelled` set.
    pub async fn run_with_cancellation(
        &self,
        query: &str,
        max_messages: usize,
        apply_labels: bool,
        cancel: CancellationToken,
    ) -> Result<BatchProcessingResult> {
        if max_messages == 0 {
            return Err(CategorizerError::InvalidArgument(
                "max_messages must be at least 1".to_string(),
            ));
        }
        let query = query.trim();
        if query.is_empty() {
            return Err(CategorizerError::InvalidArgument(
                "query cannot be empty".to_string(),
            ));
        }

        let mut batch = BatchResultBuilder::new(query);
        info!(
            "Starting batch {}: query='{}', max_messages={}, apply_labels={}",
            batch.run_id(),
            query,
            max_messages,
            apply_labels
        );

        if cancel.is_cancelled() {
            info!("Batch cancelled before discovery");
            return Ok(batch.finish(Vec::new(), true));
        }

        let ids = self
            .retry
            .run("list_message_ids", || {
                self.mailbox.list_message_ids(query, max_messages)
            })
            .await
            .map_err(|e| {
                error!("Could not list messages for '{}': {}", query, e);
                e
            })?;
        let ids = unique_ids(ids, max_messages);

        if ids.is_empty() {
            info!("No messages matched query '{}'", query);
            return Ok(batch.finish(Vec::new(), false));
        }

        let discovered = ids.len();
        let workers = self.settings.concurrency.max(1);
        info!("Processing {} messages with {} workers", discovered, workers);

        let resolver = LabelResolver::new(
            Arc::clone(&self.mailbox),
            self.retry.clone(),
            self.settings.label_prefix.clone(),
        );
        let resolver = &resolver;
        let stop = cancel.clone();
        let model_calls_before = self.categorizer.provider_calls();

        let mut finished = stream::iter(ids.into_iter().enumerate())
            .take_while(move |_| future::ready(!stop.is_cancelled()))
            .map(|(index, id)| async move {
                let result = self.process_message(&id, resolver, apply_labels).await;
                (index, result)
            })
            .buffer_unordered(workers);

        while let Some((index, result)) = finished.next().await {
            if let Some(callback) = &self.on_progress {
                callback(&result);
            }
            batch.push(index, result);
        }

        let cancelled = batch.len() < discovered;
        if cancelled {
            warn!(
                "Batch cancelled after {} of {} messages",
                batch.len(),
                discovered
            );
        }

        let mut result = batch.finish(resolver.labels_created().await, cancelled);
        result.api_usage.model_calls = self
            .categorizer
            .provider_calls()
            .saturating_sub(model_calls_before);
        info!(
            "Batch {} finished in {:.2}s: {} applied, {} skipped, {} failed ({} degraded)",
            result.run_id,
            result.elapsed_secs,
            result.succeeded,
            result.skipped,
            result.failed,
            result.degraded
        );
        Ok(result)
    }

    /// Fetch, classify and label one message; never fails
    async fn process_message(
        &self,
        id: &str,
        resolver: &LabelResolver,
        apply_labels: bool,
    ) -> CategorizationResult {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let message = match self
            .retry
            .run("get_message", || self.mailbox.get_message(id))
            .await
        {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to fetch message {}: {}", id, e);
                return CategorizationResult::failed(id, format!("fetch failed: {}", e), elapsed_ms());
            }
        };

        let previous_category = resolver
            .category_for_labels(&message.label_ids, self.categorizer.categories())
            .await;
        let classification = self.categorizer.classify(&message).await;

        let mut result = CategorizationResult {
            message_id: id.to_string(),
            thread_id: Some(message.thread_id.clone()),
            subject: Some(message.subject.clone()),
            category: classification.category,
            previous_category,
            outcome: LabelOutcome::Skipped,
            degraded: classification.degraded,
            label_id: None,
            error: classification.error,
            latency_ms: 0,
        };

        if !apply_labels {
            result.latency_ms = elapsed_ms();
            return result;
        }

        if result.category.confidence < self.settings.min_label_confidence {
            debug!(
                "Not labelling {}: confidence {:.2} below {:.2}",
                id, result.category.confidence, self.settings.min_label_confidence
            );
            result.latency_ms = elapsed_ms();
            return result;
        }

        match resolver.resolve(&result.category.name).await {
            Ok(label_id) => {
                match self
                    .retry
                    .run("apply_label", || self.mailbox.apply_label(id, &label_id))
                    .await
                {
                    Ok(()) => {
                        debug!("Applied '{}' to {}", result.category.name, id);
                        result.outcome = LabelOutcome::Applied;
                    }
                    Err(e) => {
                        warn!("Failed to label message {}: {}", id, e);
                        result.outcome = LabelOutcome::Failed;
                        append_error(&mut result, format!("apply label failed: {}", e));
                    }
                }
                result.label_id = Some(label_id);
            }
            Err(e) => {
                result.outcome = LabelOutcome::Failed;
                let message = format!("label '{}' unavailable: {}", result.category.name, e);
                append_error(&mut result, message);
            }
        }

        result.latency_ms = elapsed_ms();
        result
    }

    /// Check mailbox access, label coverage and the classification provider
    pub async fn check_setup(&self) -> Result<SetupReport> {
        let labels = self
            .retry
            .run("list_labels", || self.mailbox.list_labels())
            .await?;

        let (labelled_categories, unlabelled_categories) = category_label_coverage(
            &labels,
            self.categorizer.categories(),
            self.settings.label_prefix.as_deref(),
        )?;

        let sample_classification = self
            .categorizer
            .classify_text(
                "Team meeting moved to Thursday",
                "Hi all, the weekly project sync is moving to Thursday at 3pm. Agenda attached.",
            )
            .await;

        Ok(SetupReport {
            labels_found: labels.len(),
            labelled_categories,
            unlabelled_categories,
            sample_classification,
        })
    }
}

/// Drop repeated ids, keeping first occurrence, and cap at `limit`
fn unique_ids(ids: Vec<String>, limit: usize) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    let mut unique = Vec::with_capacity(ids.len().min(limit));
    for id in ids {
        if unique.len() == limit {
            break;
        }
        if seen.insert(id.clone()) {
            unique.push(id);
        } else {
            warn!("Message {} listed twice, processing once", id);
        }
    }
    unique
}

fn append_error(result: &mut CategorizationResult, message: String) {
    result.error = Some(match result.error.take() {
        Some(previous) => format!("{}; {}", previous, message),
        None => message,
    });
}
