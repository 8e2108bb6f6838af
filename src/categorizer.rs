//! Language-model email categorization
//!
//! The categorizer frames a prompt listing the allowed categories, sends it
//! through a [`ClassificationProvider`], and maps whatever comes back onto the
//! configured [`CategorySet`]. Parsing is deliberately forgiving:
//!
//! 1. A JSON object `{"category", "confidence", "reasoning"}` anywhere in the
//!    reply (code fences and chatter around it are ignored)
//! 2. Otherwise the first whole-word mention of a category, at confidence 0.3
//! 3. Otherwise `Other` at confidence 0.0
//!
//! Unknown category names always become `Other` at confidence 0.0, and a
//! provider failure yields the same sentinel flagged as degraded.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::{CategorizerError, Result};
use crate::models::{truncate_chars, Category, CategorySet, EmailMessage};
use crate::provider::{ClassificationProvider, Prompt};
use crate::retry::RetryExecutor;

/// Confidence assigned when the category was found in free text
const TEXT_MATCH_CONFIDENCE: f32 = 0.3;

/// Confidence assigned when the model's own value is missing or out of range
const DEFAULT_CONFIDENCE: f32 = 0.5;

static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct CategorizerSettings {
    pub max_tokens: u16,
    pub temperature: f32,
    /// Bound on the email content placed in the user prompt
    pub max_prompt_chars: usize,
}

impl Default for CategorizerSettings {
    fn default() -> Self {
        Self {
            max_tokens: 150,
            temperature: 0.3,
            max_prompt_chars: 3000,
        }
    }
}

/// Outcome of one classification
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: Category,
    /// The provider failed and `category` is the fallback
    pub degraded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelReply {
    category: Option<String>,
    confidence: Option<serde_json::Value>,
    reasoning: Option<String>,
}

pub struct Categorizer {
    provider: Arc<dyn ClassificationProvider>,
    categories: CategorySet,
    retry: RetryExecutor,
    settings: CategorizerSettings,
    system_prompt: String,
    mention: Regex,
    provider_calls: AtomicU64,
}

impl Categorizer {
    pub fn new(
        provider: Arc<dyn ClassificationProvider>,
        categories: CategorySet,
        retry: RetryExecutor,
        settings: CategorizerSettings,
    ) -> Result<Self> {
        let names = categories.prompt_names();
        let alternatives: Vec<String> = names.iter().map(|n| regex::escape(n)).collect();
        let mention = Regex::new(&format!(r"(?i)\b({})\b", alternatives.join("|")))
            .map_err(|e| CategorizerError::ConfigError(format!("Invalid category names: {}", e)))?;
        let system_prompt = build_system_prompt(&names);

        Ok(Self {
            provider,
            categories,
            retry,
            settings,
            system_prompt,
            mention,
            provider_calls: AtomicU64::new(0),
        })
    }

    pub fn categories(&self) -> &CategorySet {
        &self.categories
    }

    /// Provider requests made so far, one per attempt
    pub fn provider_calls(&self) -> u64 {
        self.provider_calls.load(Ordering::Relaxed)
    }

    /// Classify a fetched message
    pub async fn classify(&self, message: &EmailMessage) -> Classification {
        let outcome = self.classify_content(&message.content_for_categorization()).await;
        debug!(
            "Message {} classified as '{}' ({:.2})",
            message.id, outcome.category.name, outcome.category.confidence
        );
        outcome
    }

    /// Classify from a bare subject and body excerpt
    pub async fn classify_text(&self, subject: &str, body_excerpt: &str) -> Classification {
        let message = EmailMessage::new("", "", "", subject, body_excerpt);
        self.classify_content(&message.content_for_categorization()).await
    }

    async fn classify_content(&self, content: &str) -> Classification {
        let prompt = self.build_prompt(content);
        let started = Instant::now();

        let reply = self
            .retry
            .run("classify", || {
                self.provider_calls.fetch_add(1, Ordering::Relaxed);
                self.provider
                    .complete(&prompt, self.settings.max_tokens, self.settings.temperature)
            })
            .await;

        match reply {
            Ok(text) => {
                debug!("Completion received in {:?}", started.elapsed());
                Classification {
                    category: self.parse_response(&text),
                    degraded: false,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Classification failed, falling back to Other: {}", e);
                Classification {
                    category: Category::fallback()
                        .with_reasoning(format!("Categorization failed: {}", e)),
                    degraded: true,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn build_prompt(&self, content: &str) -> Prompt {
        Prompt {
            system: self.system_prompt.clone(),
            user: format!(
                "Please categorize this email:\n\n{}",
                truncate_chars(content, self.settings.max_prompt_chars)
            ),
        }
    }

    /// Map raw model output onto the category set
    pub fn parse_response(&self, text: &str) -> Category {
        let trimmed = text.trim();

        if let Some(object) = JSON_OBJECT.find(trimmed) {
            if let Ok(reply) = serde_json::from_str::<ModelReply>(object.as_str()) {
                return self.validate_reply(reply);
            }
        }

        debug!("Model reply was not JSON: {}", truncate_chars(trimmed, 200));
        match self
            .mention
            .find(trimmed)
            .and_then(|m| self.categories.canonicalize(m.as_str()))
        {
            Some(name) => Category::new(name, TEXT_MATCH_CONFIDENCE)
                .with_reasoning("Extracted from non-JSON response"),
            None => Category::fallback().with_reasoning("Could not parse response"),
        }
    }

    fn validate_reply(&self, reply: ModelReply) -> Category {
        let answered = reply.category.unwrap_or_default();
        let Some(name) = self.categories.canonicalize(&answered) else {
            warn!("Model answered unknown category '{}', using Other", answered);
            return Category::fallback()
                .with_reasoning(format!("Unrecognized category '{}'", answered));
        };

        let confidence = match reply.confidence.as_ref().and_then(|v| v.as_f64()) {
            Some(c) if (0.0..=1.0).contains(&c) => c as f32,
            other => {
                warn!("Invalid confidence {:?}, using {}", other, DEFAULT_CONFIDENCE);
                DEFAULT_CONFIDENCE
            }
        };

        let category = Category::new(name, confidence);
        match reply.reasoning {
            Some(reasoning) if !reasoning.trim().is_empty() => category.with_reasoning(reasoning),
            _ => category,
        }
    }
}

fn build_system_prompt(names: &[&str]) -> String {
    format!(
        "You sort emails into categories.\n\n\
         Categories: {}\n\n\
         Read the subject, sender and content, then pick the single category that best \
         fits the email's main purpose. Use a category name exactly as listed. If none \
         fits, use \"Other\" with a low confidence.\n\n\
         Answer with one JSON object and nothing else:\n\
         {{\"category\": \"<name>\", \"confidence\": <number between 0 and 1>, \
         \"reasoning\": \"<one sentence>\"}}",
        names.join(", ")
    )
}
