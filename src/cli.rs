//! Command-line interface

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, GmailHub};
use crate::categorizer::Categorizer;
use crate::client::{GmailMailboxClient, MailboxClient};
use crate::config::{Config, MAX_MESSAGES_LIMIT};
use crate::error::{CategorizerError, Result};
use crate::label_resolver::{category_label_counts, category_label_coverage, CategoryLabelCounts};
use crate::models::{BatchProcessingResult, CategorizationResult, LabelOutcome};
use crate::orchestrator::{BatchOrchestrator, SetupReport};
use crate::provider::{ClassificationProvider, OpenAiProvider};
use crate::rate_limiter::QuotaRateLimiter;
use crate::retry::RetryExecutor;

#[derive(Parser, Debug)]
#[command(name = "gmail-categorizer")]
#[command(version)]
#[command(about = "Categorize Gmail messages with a language model and label them", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Path to OAuth2 credentials file
    #[arg(long, default_value = "credentials.json")]
    pub credentials: PathBuf,

    /// Path to token cache file
    #[arg(long, default_value = ".gmail-categorizer/token.json")]
    pub token_cache: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with Gmail API
    Auth {
        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },

    /// Categorize a batch of messages and label them
    Process {
        /// Gmail search query (defaults to processing.query)
        #[arg(short, long)]
        query: Option<String>,

        /// Maximum messages to process (defaults to processing.max_messages_per_batch)
        #[arg(short = 'n', long)]
        max_messages: Option<usize>,

        /// Classify only, leave labels untouched
        #[arg(long)]
        no_apply_labels: bool,

        /// Messages processed at the same time
        #[arg(long)]
        concurrency: Option<usize>,

        /// Write the full result as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check configuration, Gmail access and the classification model
    Validate,

    /// Count matching messages and show which categories have labels
    Stats {
        /// Gmail search query (defaults to processing.query)
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    ConfigInfo,
}

/// Options for the `process` command after CLI parsing
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub query: Option<String>,
    pub max_messages: Option<usize>,
    pub apply_labels: bool,
    pub concurrency: Option<usize>,
    pub output: Option<PathBuf>,
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>4}/{len:4} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }
}

/// Authenticated Gmail hub for the paths given on the command line
pub async fn authenticate(cli: &Cli) -> Result<GmailHub> {
    auth::initialize_gmail_hub(&cli.credentials, &cli.token_cache).await
}

/// Gmail client sharing the configured quota budget
pub fn mailbox_client(hub: GmailHub, config: &Config) -> GmailMailboxClient {
    let quota = QuotaRateLimiter::new(
        config.rate_limit.quota_units_per_second as f64,
        config.rate_limit.burst_units as f64,
    );
    GmailMailboxClient::new(hub, quota)
}

/// Orchestrator backed by the configured OpenAI model
pub fn build_orchestrator(
    config: &Config,
    mailbox: Arc<dyn MailboxClient>,
) -> Result<BatchOrchestrator> {
    let api_key = config.classification.api_key.as_deref().ok_or_else(|| {
        CategorizerError::ConfigError(
            "No OpenAI API key: set classification.api_key or OPENAI_API_KEY".to_string(),
        )
    })?;
    let provider = Arc::new(OpenAiProvider::new(api_key, config.classification.model.clone()));
    build_orchestrator_with_provider(config, mailbox, provider)
}

pub fn build_orchestrator_with_provider(
    config: &Config,
    mailbox: Arc<dyn MailboxClient>,
    provider: Arc<dyn ClassificationProvider>,
) -> Result<BatchOrchestrator> {
    let categorizer = Categorizer::new(
        provider,
        config.category_set()?,
        RetryExecutor::new(config.retry_policy()),
        config.categorizer_settings(),
    )?;
    Ok(BatchOrchestrator::new(
        mailbox,
        categorizer,
        config.orchestrator_settings(),
    ))
}

/// Run one categorization batch with progress output
///
/// Cancelling `cancel` stops new work; the partial result is still returned.
pub async fn run_process(
    cli: &Cli,
    options: ProcessOptions,
    multi: MultiProgress,
    cancel: CancellationToken,
) -> Result<BatchProcessingResult> {
    let reporter = ProgressReporter::with_multi_progress(multi);

    // Step 1: Load configuration
    let config_spinner = reporter.add_spinner("Loading configuration...");
    let mut config = Config::load(&cli.config).await?;
    if let Some(concurrency) = options.concurrency {
        config.processing.concurrency = concurrency;
        config.validate()?;
    }
    let query = options
        .query
        .unwrap_or_else(|| config.processing.query.clone());
    let max_messages = options
        .max_messages
        .unwrap_or(config.processing.max_messages_per_batch);
    if max_messages > MAX_MESSAGES_LIMIT {
        return Err(CategorizerError::InvalidArgument(format!(
            "max_messages cannot exceed {}",
            MAX_MESSAGES_LIMIT
        )));
    }
    reporter.finish_spinner(
        &config_spinner,
        &format!("Configuration loaded from {:?}", cli.config),
    );

    // Step 2: Initialize Gmail API
    let auth_spinner = reporter.add_spinner("Authenticating with Gmail API...");
    let hub = authenticate(cli).await?;
    let gmail = Arc::new(mailbox_client(hub, &config));
    let mailbox: Arc<dyn MailboxClient> = gmail.clone();
    reporter.finish_spinner(&auth_spinner, "Gmail API authenticated");

    // Step 3: Categorize and label
    let bar = reporter.add_progress_bar(max_messages as u64, "Categorizing...");
    let progress = bar.clone();
    let orchestrator = build_orchestrator(&config, mailbox)?.with_progress(Arc::new(
        move |result: &CategorizationResult| {
            progress.inc(1);
            let subject = result.subject.as_deref().unwrap_or(&result.message_id);
            progress.set_message(format!(
                "{} → {}",
                truncate_string(subject, 40),
                result.category.name
            ));
        },
    ));

    let outcome = orchestrator
        .run_with_cancellation(&query, max_messages, options.apply_labels, cancel)
        .await;
    bar.finish_and_clear();
    let mut result = outcome?;
    result.api_usage.record_quota(gmail.quota().stats().await);

    let _ = reporter.multi_progress().println(format!(
        "  ✓ Processed {} messages in {:.1}s",
        result.total, result.elapsed_secs
    ));

    // Step 4: Save full result
    if let Some(path) = &options.output {
        result.save_json(path).await?;
        let _ = reporter
            .multi_progress()
            .println(format!("  ✓ Results written to {:?}", path));
    }

    Ok(result)
}

/// Validate configuration, Gmail access and the classification model
pub async fn run_validate(cli: &Cli, multi: MultiProgress) -> Result<SetupReport> {
    let reporter = ProgressReporter::with_multi_progress(multi);

    let config_spinner = reporter.add_spinner("Validating configuration...");
    let config = Config::load(&cli.config).await?;
    reporter.finish_spinner(&config_spinner, "Configuration is valid");

    let auth_spinner = reporter.add_spinner("Authenticating with Gmail API...");
    let hub = authenticate(cli).await?;
    let mailbox: Arc<dyn MailboxClient> = Arc::new(mailbox_client(hub, &config));
    reporter.finish_spinner(&auth_spinner, "Gmail API authenticated");

    let check_spinner = reporter.add_spinner("Checking labels and classification model...");
    let report = build_orchestrator(&config, mailbox)?.check_setup().await?;
    reporter.finish_spinner(&check_spinner, "Setup check complete");

    Ok(report)
}

/// What `stats` reports about the mailbox
#[derive(Debug, Clone)]
pub struct MailboxStats {
    pub address: String,
    pub query: String,
    pub matching: usize,
    /// Listing stopped at the batch limit, so `matching` is a lower bound
    pub capped: bool,
    pub labelled_categories: Vec<String>,
    pub unlabelled_categories: Vec<String>,
    pub label_counts: Vec<CategoryLabelCounts>,
}

pub async fn run_stats(
    cli: &Cli,
    query: Option<String>,
    multi: MultiProgress,
) -> Result<MailboxStats> {
    let reporter = ProgressReporter::with_multi_progress(multi);
    let config = Config::load(&cli.config).await?;
    let query = query.unwrap_or_else(|| config.processing.query.clone());

    let auth_spinner = reporter.add_spinner("Authenticating with Gmail API...");
    let hub = authenticate(cli).await?;
    let address = auth::connected_address(&hub).await?;
    let mailbox = mailbox_client(hub, &config);
    reporter.finish_spinner(&auth_spinner, &format!("Connected to {}", address));

    let scan_spinner = reporter.add_spinner("Counting messages and labels...");
    let (ids, labels) = tokio::join!(
        mailbox.list_message_ids(&query, MAX_MESSAGES_LIMIT),
        mailbox.list_labels()
    );
    let matching = ids?.len();
    let labels = labels?;
    let categories = config.category_set()?;
    let prefix = config.labels.prefix.as_deref();
    let (labelled_categories, unlabelled_categories) =
        category_label_coverage(&labels, &categories, prefix)?;
    let label_counts = category_label_counts(&mailbox, &labels, &categories, prefix).await?;
    reporter.finish_spinner(&scan_spinner, "Mailbox scanned");

    Ok(MailboxStats {
        address,
        query,
        matching,
        capped: matching >= MAX_MESSAGES_LIMIT,
        labelled_categories,
        unlabelled_categories,
        label_counts,
    })
}

/// Human-readable summary of a finished batch
pub fn format_summary(result: &BatchProcessingResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n========================================");
    let _ = writeln!(out, "Categorization Summary");
    let _ = writeln!(out, "========================================");
    let _ = writeln!(out, "Run ID: {}", result.run_id);
    let _ = writeln!(out, "Query: {}", result.query);
    let _ = writeln!(out, "Duration: {:.1} seconds", result.elapsed_secs);
    let _ = writeln!(out, "Messages: {}", result.total);
    let _ = writeln!(
        out,
        "Labelled: {} ({:.1}%)",
        result.succeeded,
        result.success_rate()
    );
    let _ = writeln!(out, "Skipped: {}", result.skipped);
    let _ = writeln!(out, "Failed: {}", result.failed);
    if result.degraded > 0 {
        let _ = writeln!(out, "Fell back to Other: {}", result.degraded);
    }
    if result.cancelled {
        let _ = writeln!(out, "Run was cancelled before all messages were processed");
    }

    if !result.results.is_empty() {
        let _ = writeln!(out, "\nCategories:");
        for (category, count) in result.category_distribution() {
            let _ = writeln!(
                out,
                "  {:<16} {:>4} ({:.1}%)",
                category,
                count,
                count as f64 / result.results.len() as f64 * 100.0
            );
        }
        let _ = writeln!(
            out,
            "\nAverage confidence: {:.2} ({} high, {} low)",
            result.average_confidence(),
            result.high_confidence_count(),
            result.low_confidence_count()
        );
    }

    if !result.labels_created.is_empty() {
        let _ = writeln!(out, "\nLabels created: {}", result.labels_created.join(", "));
    }

    let usage = &result.api_usage;
    let _ = writeln!(
        out,
        "\nAPI usage: {} model calls, {} Gmail calls ({} quota units, {} throttled)",
        usage.model_calls, usage.mailbox_calls, usage.quota_units, usage.throttled_calls
    );

    let failures: Vec<&CategorizationResult> = result.failures().take(10).collect();
    if !failures.is_empty() {
        let _ = writeln!(out, "\nFailures:");
        for failure in failures {
            let _ = writeln!(
                out,
                "  - {}: {}",
                failure.message_id,
                failure.error.as_deref().unwrap_or("unknown error")
            );
        }
        if result.failed > 10 {
            let _ = writeln!(out, "  ... and {} more", result.failed - 10);
        }
    }

    let _ = write!(out, "========================================");
    out
}

pub fn format_setup_report(report: &SetupReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Labels in mailbox: {}", report.labels_found);
    if !report.labelled_categories.is_empty() {
        let _ = writeln!(
            out,
            "Categories with labels: {}",
            report.labelled_categories.join(", ")
        );
    }
    if !report.unlabelled_categories.is_empty() {
        let _ = writeln!(
            out,
            "Labels created on first use: {}",
            report.unlabelled_categories.join(", ")
        );
    }
    if report.sample_classification.degraded {
        let _ = write!(
            out,
            "Classification check FAILED: {}",
            report.sample_classification.error.as_deref().unwrap_or("unknown error")
        );
    } else {
        let _ = write!(
            out,
            "Classification check passed: sample email → {} ({:.2})",
            report.sample_classification.category.name,
            report.sample_classification.category.confidence
        );
    }
    out
}

pub fn format_stats(stats: &MailboxStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Account: {}", stats.address);
    let _ = writeln!(
        out,
        "Messages matching '{}': {}{}",
        stats.query,
        stats.matching,
        if stats.capped { "+" } else { "" }
    );
    let _ = writeln!(
        out,
        "Categories with labels: {}",
        list_or_none(&stats.labelled_categories)
    );
    for counts in &stats.label_counts {
        let _ = writeln!(
            out,
            "  {} ({}): {} messages, {} unread",
            counts.category, counts.label_name, counts.total, counts.unread
        );
    }
    let _ = write!(
        out,
        "Categories without labels: {}",
        list_or_none(&stats.unlabelled_categories)
    );
    out
}

/// Effective configuration with secrets masked
pub fn format_config_info(config: &Config) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[processing]");
    let _ = writeln!(out, "  query = {}", config.processing.query);
    let _ = writeln!(
        out,
        "  max_messages_per_batch = {}",
        config.processing.max_messages_per_batch
    );
    let _ = writeln!(out, "  concurrency = {}", config.processing.concurrency);
    let _ = writeln!(
        out,
        "  min_label_confidence = {:.2}",
        config.processing.min_label_confidence
    );
    let _ = writeln!(out, "[classification]");
    let _ = writeln!(
        out,
        "  categories = {}",
        config.classification.categories.join(", ")
    );
    let _ = writeln!(out, "  model = {}", config.classification.model);
    let _ = writeln!(
        out,
        "  max_tokens = {}, temperature = {:.2}",
        config.classification.max_tokens, config.classification.temperature
    );
    let _ = writeln!(
        out,
        "  api_key = {}",
        config
            .classification
            .api_key
            .as_deref()
            .map(mask_secret)
            .unwrap_or_else(|| "<not set>".to_string())
    );
    let _ = writeln!(out, "[labels]");
    let _ = writeln!(
        out,
        "  prefix = {}",
        config.labels.prefix.as_deref().unwrap_or("<none>")
    );
    let _ = writeln!(out, "[retry]");
    let _ = writeln!(
        out,
        "  max_attempts = {}, base_delay_ms = {}, max_delay_ms = {}, call_timeout_secs = {}",
        config.retry.max_attempts,
        config.retry.base_delay_ms,
        config.retry.max_delay_ms,
        config.retry.call_timeout_secs
    );
    let _ = writeln!(out, "[rate_limit]");
    let _ = writeln!(
        out,
        "  quota_units_per_second = {}, burst_units = {}",
        config.rate_limit.quota_units_per_second, config.rate_limit.burst_units
    );
    let _ = writeln!(out, "[logging]");
    let _ = write!(
        out,
        "  level = {}, json = {}, file = {}",
        config.logging.level,
        config.logging.json,
        config
            .logging
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<terminal>".to_string())
    );
    out
}

/// Keep the first and last four characters of a secret
fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// Cancel `cancel` on the first interrupt and call `force_exit` on the second
///
/// `next_signal` resolves once per interrupt; an error stops listening.
pub async fn handle_interrupts<S, Fut, E>(
    mut next_signal: S,
    cancel: CancellationToken,
    force_exit: E,
) where
    S: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
    E: FnOnce(),
{
    if next_signal().await.is_err() {
        return;
    }
    tracing::warn!("Interrupted, finishing messages already in progress (Ctrl-C again to quit)...");
    cancel.cancel();

    if next_signal().await.is_ok() {
        force_exit();
    }
}

/// Whether every processed message ended up labelled or deliberately skipped
pub fn all_succeeded(result: &BatchProcessingResult) -> bool {
    result
        .results
        .iter()
        .all(|r| r.outcome != LabelOutcome::Failed)
}
