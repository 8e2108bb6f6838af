use anyhow::{Context, Result};
use clap::Parser;
use gmail_categorizer::cli::{self, Cli, Commands, ProcessOptions};
use gmail_categorizer::config::{Config, LoggingConfig};
use gmail_categorizer::error::CategorizerError;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut buffer) = self.buffer.lock() {
            if !buffer.is_empty() {
                let msg = String::from_utf8_lossy(&buffer);
                let msg = msg.trim_end_matches('\n');
                if !msg.is_empty() {
                    let _ = self.multi.println(msg);
                }
                buffer.clear();
            }
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        display_error(&e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Dependencies pull in different rustls crypto backends, so pick one explicitly.
    // aws-lc-rs needs NASM/CMake on Windows; ring builds everywhere.
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    // Logging settings come from the config file when it parses; commands report
    // config errors themselves once logging is up.
    let logging = Config::load(&cli.config)
        .await
        .map(|c| c.logging)
        .unwrap_or_default();
    let multi_progress = Arc::new(MultiProgress::new());
    init_logging(&cli, &logging, &multi_progress)?;

    tracing::debug!("gmail-categorizer {} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Auth { force } => {
            if force && cli.token_cache.exists() {
                tokio::fs::remove_file(&cli.token_cache).await?;
                tracing::info!("Removed existing token cache");
            }

            let hub = cli::authenticate(&cli).await?;
            println!("Successfully authenticated with Gmail API");
            println!("Token cached at: {:?}", cli.token_cache);

            let address = gmail_categorizer::auth::connected_address(&hub).await?;
            println!("Connected to account: {}", address);
            Ok(())
        }

        Commands::Process {
            ref query,
            max_messages,
            no_apply_labels,
            concurrency,
            ref output,
        } => {
            if no_apply_labels {
                println!("Labels will NOT be applied - classification only");
            }

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(cli::handle_interrupts(
                tokio::signal::ctrl_c,
                interrupt,
                || {
                    eprintln!("\nInterrupted again, exiting without waiting for in-flight messages");
                    process::exit(130);
                },
            ));

            let options = ProcessOptions {
                query: query.clone(),
                max_messages,
                apply_labels: !no_apply_labels,
                concurrency,
                output: output.clone(),
            };
            let result =
                cli::run_process(&cli, options, (*multi_progress).clone(), cancel).await?;

            println!("{}", cli::format_summary(&result));
            if !cli::all_succeeded(&result) {
                println!("Some messages failed; rerun the same query to retry them.");
            }
            Ok(())
        }

        Commands::Validate => {
            let report = cli::run_validate(&cli, (*multi_progress).clone()).await?;
            println!("{}", cli::format_setup_report(&report));

            if report.sample_classification.degraded {
                anyhow::bail!("classification model check failed");
            }
            Ok(())
        }

        Commands::Stats { ref query } => {
            let stats = cli::run_stats(&cli, query.clone(), (*multi_progress).clone()).await?;
            println!("{}", cli::format_stats(&stats));
            Ok(())
        }

        Commands::InitConfig { ref output, force } => {
            if output.exists() && !force {
                return Err(CategorizerError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nKey settings to review:");
            println!("  - processing.query: Gmail search for messages to categorize");
            println!("  - classification.categories: Categories offered to the model");
            println!("  - classification.model: OpenAI model name");
            println!("  - labels.prefix: Optional parent label, e.g. \"AI\" gives AI/Work");
            println!("\nSet OPENAI_API_KEY or classification.api_key before running 'process'.");
            Ok(())
        }

        Commands::ConfigInfo => {
            let config = Config::load(&cli.config).await?;
            println!("Configuration file: {:?}", cli.config);
            println!("{}", cli::format_config_info(&config));
            Ok(())
        }
    }
}

fn init_logging(cli: &Cli, logging: &LoggingConfig, multi: &Arc<MultiProgress>) -> Result<()> {
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gmail_categorizer={},warn", level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {:?}", parent))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            let writer = std::sync::Mutex::new(file);

            if logging.json {
                builder.json().with_writer(writer).init();
            } else {
                builder.with_ansi(false).with_writer(writer).init();
            }
        }
        None => {
            let writer = MultiProgressMakeWriter {
                multi: Arc::clone(multi),
            };
            if logging.json {
                builder.json().with_writer(writer).init();
            } else {
                builder.with_writer(writer).init();
            }
        }
    }

    Ok(())
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(err) = error.downcast_ref::<CategorizerError>() {
        match err {
            CategorizerError::AuthError(_) | CategorizerError::Forbidden(_) => {
                eprintln!("\nHint: Make sure your credentials.json file is valid and the");
                eprintln!("      OpenAI API key is correct.");
                eprintln!("      Try running: gmail-categorizer auth --force");
            }
            CategorizerError::RateLimitExceeded { .. } => {
                eprintln!("\nHint: You've hit an API rate limit.");
                eprintln!("      Wait a minute or lower processing.concurrency in config.");
            }
            CategorizerError::NetworkError(_) | CategorizerError::ServerError { .. } => {
                eprintln!("\nHint: This may be a temporary outage.");
                eprintln!("      Try running the command again.");
            }
            CategorizerError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: gmail-categorizer init-config --force");
            }
            _ => {}
        }
    }

    eprintln!("\nFor help, run: gmail-categorizer --help");
}
