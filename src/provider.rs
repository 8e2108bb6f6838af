//! Language-model completion providers

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{CategorizerError, Result};

/// A system/user prompt pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Text completion used by the categorizer
///
/// Implementations do not retry; the categorizer wraps calls in a `RetryExecutor`.
#[async_trait]
pub trait ClassificationProvider: Send + Sync {
    async fn complete(&self, prompt: &Prompt, max_tokens: u16, temperature: f32) -> Result<String>;
}

/// OpenAI chat-completions provider
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, model: impl Into<String>) -> Self {
        // Retries are owned by the caller, so the client's own backoff gives up at once
        let no_retry = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();

        let client = Client::with_config(OpenAIConfig::new().with_api_key(api_key)).with_backoff(no_retry);

        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ClassificationProvider for OpenAiProvider {
    async fn complete(&self, prompt: &Prompt, max_tokens: u16, temperature: f32) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_tokens(max_tokens)
            .temperature(temperature)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(prompt.system.as_str())
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt.user.as_str())
                    .build()?
                    .into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;
        if let Some(usage) = response.usage.as_ref() {
            debug!(
                "Completion used {} prompt + {} completion tokens",
                usage.prompt_tokens, usage.completion_tokens
            );
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| {
                CategorizerError::ClassificationError("Model returned an empty completion".to_string())
            })
    }
}
