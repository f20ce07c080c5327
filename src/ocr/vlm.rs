//! OCR through a vision LLM.
//!
//! Each page is sent as a base64 PNG with a transcription prompt. Rate
//! limiting surfaces as [`PipelineError::Throttled`] so the orchestrator
//! backs off; other provider failures are retried here first.

use super::{cleanup::clean_text, prompts, OcrEngine, OcrOutput};
use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

pub struct VlmOcrEngine {
    provider: Arc<dyn LLMProvider>,
    identifier: String,
    max_retries: u32,
    retry_backoff_ms: u64,
    max_tokens: usize,
}

impl std::fmt::Debug for VlmOcrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VlmOcrEngine")
            .field("identifier", &self.identifier)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl VlmOcrEngine {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            identifier: "vlm".to_string(),
            max_retries: 3,
            retry_backoff_ms: 500,
            max_tokens: 4096,
        }
    }

    /// Identifier recorded against pages this engine transcribes.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = retry_backoff_ms;
        self
    }

    /// Resolve a provider from a name/model pair or from the environment.
    ///
    /// Order: explicit `provider`; `EDGEQUAKE_LLM_PROVIDER` with
    /// `EDGEQUAKE_MODEL`; OpenAI when `OPENAI_API_KEY` is set; then
    /// whatever `ProviderFactory::from_env` detects.
    pub fn resolve(provider: Option<&str>, model: Option<&str>) -> Result<Self, PipelineError> {
        if let Some(name) = provider {
            let model = model.unwrap_or(DEFAULT_MODEL);
            return create_provider(name, model)
                .map(|p| Self::new(p).with_identifier(format!("vlm:{model}")));
        }

        if let (Ok(prov), Ok(model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !model.is_empty() {
                return create_provider(&prov, &model)
                    .map(|p| Self::new(p).with_identifier(format!("vlm:{model}")));
            }
        }

        if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
            let model = model.unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model)
                .map(|p| Self::new(p).with_identifier(format!("vlm:{model}")));
        }

        let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| {
            PipelineError::InvalidConfig(format!(
                "No vision provider could be detected from the environment: {e}"
            ))
        })?;
        Ok(Self::new(llm))
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        PipelineError::InvalidConfig(format!("Provider '{name}' is not configured: {e}"))
    })
}

/// Encode a page as a base64 PNG attachment.
fn encode_page(image: &DynamicImage) -> Result<ImageData, PipelineError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(ImageData::new(STANDARD.encode(&buf), "image/png").with_detail("high"))
}

fn is_rate_limited(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
}

#[async_trait::async_trait]
impl OcrEngine for VlmOcrEngine {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    async fn recognize(
        &self,
        image: &DynamicImage,
        language: &str,
    ) -> Result<OcrOutput, PipelineError> {
        let messages = vec![
            ChatMessage::system(prompts::TRANSCRIBE_PROMPT),
            ChatMessage::system(prompts::language_hint(language)),
            ChatMessage::user_with_images("", vec![encode_page(image)?]),
        ];
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let mut last_err = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "VLM OCR: retry {}/{} after {}ms",
                    attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }
            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "VLM OCR: {} input tokens, {} output tokens",
                        response.prompt_tokens, response.completion_tokens
                    );
                    return Ok(OcrOutput {
                        text: clean_text(&response.content),
                        words: Vec::new(),
                    });
                }
                Err(e) => {
                    last_err = e.to_string();
                    warn!("VLM OCR: attempt {} failed: {}", attempt + 1, last_err);
                }
            }
        }

        if is_rate_limited(&last_err) {
            return Err(PipelineError::Throttled {
                service: self.identifier(),
            });
        }
        Err(PipelineError::OcrFailed {
            page: 0,
            detail: last_err,
        })
    }
}
