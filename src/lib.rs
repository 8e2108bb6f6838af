//! Gmail Categorizer
//!
//! Sorts Gmail messages into a fixed set of categories with a language model
//! and applies one label per category.
//!
//! # Overview
//!
//! - **Authentication**: OAuth2 with token caching
//! - **Mailbox access**: quota-aware Gmail client behind the [`client::MailboxClient`] trait
//! - **Classification**: prompt building and tolerant parsing of model replies
//! - **Labels**: create-once label resolution, safe under concurrency
//! - **Batches**: bounded concurrent processing with per-message outcomes
//!
//! # Example Usage
//!
//! ```no_run
//! use gmail_categorizer::{auth, cli, config::Config};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!
//!     let hub = auth::initialize_gmail_hub(
//!         "credentials.json".as_ref(),
//!         ".gmail-categorizer/token.json".as_ref(),
//!     )
//!     .await?;
//!     let mailbox = Arc::new(cli::mailbox_client(hub, &config));
//!
//!     let orchestrator = cli::build_orchestrator(&config, mailbox)?;
//!     let result = orchestrator.run("in:inbox", 25, true).await?;
//!     println!("{} labelled, {} failed", result.succeeded, result.failed);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth2 authentication and Gmail API initialization
//! - [`client`] - Mailbox trait and the Gmail implementation
//! - [`rate_limiter`] - Gmail quota-unit token bucket
//! - [`retry`] - Bounded retry with exponential backoff
//! - [`provider`] - Language-model completion providers
//! - [`categorizer`] - Email classification
//! - [`label_resolver`] - Category label lookup and creation
//! - [`orchestrator`] - Batch pipeline
//! - [`cli`] - Command-line interface
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`models`] - Core data structures

pub mod auth;
pub mod categorizer;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod label_resolver;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod rate_limiter;
pub mod retry;

pub use error::{CategorizerError, ErrorKind, Result};

pub use models::{
    ApiUsage, BatchProcessingResult, CategorizationResult, Category, CategorySet, EmailMessage,
    LabelOutcome,
};

pub use categorizer::{Categorizer, CategorizerSettings, Classification};
pub use client::{GmailMailboxClient, LabelInfo, MailboxClient};
pub use config::Config;
pub use label_resolver::LabelResolver;
pub use orchestrator::{BatchOrchestrator, OrchestratorSettings, ProgressCallback, SetupReport};
pub use provider::{ClassificationProvider, OpenAiProvider, Prompt};
pub use rate_limiter::{QuotaCost, QuotaRateLimiter};
pub use retry::{RetryExecutor, RetryPolicy};

pub use cli::{Cli, Commands, ProgressReporter};
