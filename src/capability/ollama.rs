//! Ollama-backed capabilities.
//!
//! Each capability renders its typed request into a chat prompt, asks the
//! model for a JSON object, and deserializes the answer into the typed
//! response. Schema checks happen in the pipeline, not here.

use super::{AnalysisCapability, DiagnosisRequest, IntegrationRequest, RelapseRequest, SummaryRequest};
use crate::error::CapabilityError;
use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Connection settings for the Ollama API.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.1,
            timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    format: &'static str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Thin HTTP client for the Ollama chat endpoint.
pub struct OllamaClient {
    config: OllamaConfig,
    http_client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Send one system + user exchange and return the raw JSON content.
    pub async fn chat_json(&self, system: &str, prompt: &str) -> Result<String, CapabilityError> {
        let url = format!("{}/api/chat", self.config.ollama_url);

        let request = OllamaChatRequest {
            model: self.config.model_name.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            format: "json",
            stream: false,
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        };

        debug!(model = %self.config.model_name, "Sending chat request");

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CapabilityError::Timeout(self.config.timeout_seconds)
                } else if e.is_connect() {
                    CapabilityError::Unavailable(format!(
                        "cannot connect to Ollama at {}",
                        self.config.ollama_url
                    ))
                } else {
                    CapabilityError::Unavailable(format!("failed to send request: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Api { status, body });
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Schema(format!("invalid Ollama response: {}", e)))?;

        Ok(chat_response.message.content)
    }
}

/// How a request is presented to the model.
pub trait PromptTemplate: Serialize {
    /// System instructions for this analysis kind.
    const SYSTEM_PROMPT: &'static str;
    /// Example of the JSON object the model must return.
    const RESPONSE_SHAPE: &'static str;

    fn render(&self) -> String {
        let payload = serde_json::to_string_pretty(self).unwrap_or_default();
        format!(
            "Input:\n{}\n\nRespond with a single JSON object shaped like:\n{}",
            payload,
            Self::RESPONSE_SHAPE
        )
    }
}

impl PromptTemplate for DiagnosisRequest {
    const SYSTEM_PROMPT: &'static str = "You are a psychiatric diagnostic assistant. \
        Propose ranked diagnosis hypotheses supported by the session notes and history.";
    const RESPONSE_SHAPE: &'static str = r#"{"hypotheses": [{"diagnosis": "", "confidence": 0.0, "reasoning": "", "evidence": [""]}]}"#;
}

impl PromptTemplate for RelapseRequest {
    const SYSTEM_PROMPT: &'static str = "You are a clinical risk assistant. \
        Estimate the probability of relapse from the behavior, history and risk factors.";
    const RESPONSE_SHAPE: &'static str = r#"{"risk_percentage": 0, "risk_level": "low|moderate|high", "risk_factors": [""], "protective_factors": [""], "recommendations": [""]}"#;
}

impl PromptTemplate for SummaryRequest {
    const SYSTEM_PROMPT: &'static str = "You are a clinical documentation assistant. \
        Summarize the case and list the conditions it suggests, most likely first.";
    const RESPONSE_SHAPE: &'static str =
        r#"{"summary": "", "key_points": [""], "suspected_conditions": [""]}"#;
}

impl PromptTemplate for IntegrationRequest {
    const SYSTEM_PROMPT: &'static str = "You are a senior psychiatrist integrating several \
        independent analyses into one report. When a doctor_override is present it is \
        authoritative and must be reflected in the diagnosis and treatment plan.";
    const RESPONSE_SHAPE: &'static str = r#"{"primary": {"diagnosis": "", "confidence": 0.0, "reasoning": "", "evidence": [""]}, "secondary": [], "confidence": 0.0, "consensus": "full|partial|conflicting", "treatment_plan": {"pharmacological": {"first_line": [""], "second_line": [""], "contraindicated": [""]}, "psychotherapeutic": {"recommended": [""], "duration": "", "frequency": ""}}, "clinical_discussion": "", "references": [""]}"#;
}

/// Extract and deserialize the JSON object from a model reply.
pub fn parse_json_response<T: DeserializeOwned>(content: &str) -> Result<T, CapabilityError> {
    let trimmed = content.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(CapabilityError::Schema(
                "response contains no JSON object".to_string(),
            ))
        }
    };

    serde_json::from_str(body).map_err(|e| CapabilityError::Schema(e.to_string()))
}

/// A capability answered by an Ollama model.
pub struct OllamaCapability<Req, Resp> {
    name: &'static str,
    client: Arc<OllamaClient>,
    _marker: PhantomData<fn(&Req) -> Resp>,
}

impl<Req, Resp> OllamaCapability<Req, Resp> {
    pub fn new(name: &'static str, client: Arc<OllamaClient>) -> Self {
        Self {
            name,
            client,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<Req, Resp> AnalysisCapability<Req, Resp> for OllamaCapability<Req, Resp>
where
    Req: PromptTemplate + Sync,
    Resp: DeserializeOwned + Send,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn invoke(&self, request: &Req) -> Result<Resp, CapabilityError> {
        let content = self
            .client
            .chat_json(Req::SYSTEM_PROMPT, &request.render())
            .await?;
        debug!(capability = self.name, bytes = content.len(), "Model replied");
        parse_json_response(&content)
    }
}
