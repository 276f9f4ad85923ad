use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Returned to callers when every candidate tier is exhausted. Callers must
/// never receive an empty response.
pub const APOLOGY_RESPONSE: &str =
    "I apologize, but I'm experiencing technical difficulties. Please try again.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl GenerateOptions {
    pub const CLASSIFY: GenerateOptions = GenerateOptions {
        temperature: 0.0,
        max_tokens: 10,
    };
    pub const DECOMPOSE: GenerateOptions = GenerateOptions {
        temperature: 0.1,
        max_tokens: 1000,
    };
    pub const RESPOND: GenerateOptions = GenerateOptions {
        temperature: 0.7,
        max_tokens: 1024,
    };
    pub const GROUNDED: GenerateOptions = GenerateOptions {
        temperature: 0.1,
        max_tokens: 2048,
    };
}

/// Failure classification is the collaborator's job: the policy never
/// inspects error prose to decide whether a candidate is worth skipping.
#[derive(Debug, Clone, Error)]
pub enum GenerateFailure {
    /// The candidate model is withdrawn, unknown, or unsupported. Skip it and
    /// continue with the next candidate.
    #[error("model unavailable: {reason}")]
    Unavailable { reason: String },
    /// Anything else. Abort the current candidate list.
    #[error("generation failed: {reason}")]
    Failed { reason: String },
}

#[async_trait]
pub trait GenerateService: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: GenerateOptions,
    ) -> Result<String, GenerateFailure>;
}

/// Ordered candidate lists per task tier. Defaults follow the production
/// Groq deployment; all lists are profile-configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTiers {
    pub primary: Vec<String>,
    pub fast: Vec<String>,
    pub classification: Vec<String>,
    pub planning: Vec<String>,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            primary: vec![
                "llama-3.3-70b-versatile".to_string(),
                "llama-3.3-70b-specdec".to_string(),
                "llama-3.1-8b-instant".to_string(),
                "mixtral-8x7b-32768".to_string(),
            ],
            fast: vec![
                "llama-3.1-8b-instant".to_string(),
                "gemma2-9b-it".to_string(),
                "mixtral-8x7b-32768".to_string(),
            ],
            classification: vec![
                "llama-3.3-8b-instant".to_string(),
                "llama-3.1-8b-instant".to_string(),
                "gemma2-9b-it".to_string(),
            ],
            planning: vec![
                "llama-3.3-70b-versatile".to_string(),
                "llama-3.3-70b-specdec".to_string(),
                "mixtral-8x7b-32768".to_string(),
            ],
        }
    }
}

/// Walks candidate lists in declared order: skip-and-continue on
/// `Unavailable`, abort the list on any other failure, return on the first
/// non-empty output. A candidate is attempted at most once per invocation,
/// even when it appears in both the requested tier and the fast tier.
#[derive(Clone)]
pub struct ModelPolicy {
    service: Arc<dyn GenerateService>,
    pub tiers: ModelTiers,
}

impl ModelPolicy {
    pub fn new(service: Arc<dyn GenerateService>, tiers: ModelTiers) -> Self {
        Self { service, tiers }
    }

    /// One pass over a candidate list. `None` means the list was exhausted or
    /// aborted; the caller decides the fallback.
    pub async fn try_candidates(
        &self,
        candidates: &[String],
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> Option<String> {
        let mut attempted = HashSet::new();
        self.walk(candidates, messages, options, &mut attempted).await
    }

    /// Requested tier first, then the fast tier, then the fixed apology.
    pub async fn generate_or_apology(
        &self,
        candidates: &[String],
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> String {
        let mut attempted = HashSet::new();
        if let Some(text) = self.walk(candidates, messages, options, &mut attempted).await {
            return text;
        }

        tracing::warn!("candidate tier exhausted, retrying with fast tier");
        match self
            .walk(&self.tiers.fast, messages, GenerateOptions::RESPOND, &mut attempted)
            .await
        {
            Some(text) => text,
            None => APOLOGY_RESPONSE.to_string(),
        }
    }

    async fn walk(
        &self,
        candidates: &[String],
        messages: &[ChatMessage],
        options: GenerateOptions,
        attempted: &mut HashSet<String>,
    ) -> Option<String> {
        for model in candidates {
            if !attempted.insert(model.clone()) {
                continue;
            }

            match self.service.generate(messages, model, options).await {
                Ok(text) if !text.trim().is_empty() => {
                    tracing::debug!(model = %model, "model candidate succeeded");
                    return Some(text);
                }
                Ok(_) => {
                    tracing::debug!(model = %model, "model candidate returned empty output");
                    continue;
                }
                Err(GenerateFailure::Unavailable { reason }) => {
                    tracing::info!(model = %model, reason = %reason, "model unavailable, trying next candidate");
                    continue;
                }
                Err(GenerateFailure::Failed { reason }) => {
                    tracing::warn!(model = %model, reason = %reason, "model call failed, aborting candidate list");
                    return None;
                }
            }
        }
        None
    }
}

pub const DEFAULT_GENERATE_ENDPOINT: &str = "https://api.groq.com/openai/v1";

/// Chat-completions client for Groq-compatible endpoints. Model-withdrawn
/// responses map to `Unavailable`; everything else is abort-class.
pub struct GroqGenerateService {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GroqGenerateService {
    pub fn new(api_key: String, endpoint: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .context("failed to build generation http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_env(endpoint: Option<String>, timeout_secs: u64) -> Result<Self> {
        let api_key = std::env::var("GROQ_API_KEY")
            .context("GROQ_API_KEY is required for the generation backend")?;
        Self::new(
            api_key,
            endpoint.unwrap_or_else(|| DEFAULT_GENERATE_ENDPOINT.to_string()),
            timeout_secs,
        )
    }

    fn classify_error_body(status: reqwest::StatusCode, body: &Value) -> GenerateFailure {
        let code = body
            .pointer("/error/code")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let message = body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("unknown provider error");

        if status == reqwest::StatusCode::NOT_FOUND
            || matches!(code, "model_decommissioned" | "model_not_found")
        {
            GenerateFailure::Unavailable {
                reason: format!("{code}: {message}"),
            }
        } else {
            GenerateFailure::Failed {
                reason: format!("http {status}: {message}"),
            }
        }
    }
}

#[async_trait]
impl GenerateService for GroqGenerateService {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: GenerateOptions,
    ) -> Result<String, GenerateFailure> {
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| GenerateFailure::Failed {
                reason: format!("request error: {err}"),
            })?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|err| GenerateFailure::Failed {
                reason: format!("invalid provider response: {err}"),
            })?;

        if !status.is_success() {
            return Err(Self::classify_error_body(status, &payload));
        }

        Ok(payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}
