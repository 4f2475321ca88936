//! Model backends.
//!
//! The controller talks to models through one async trait so the whole
//! pipeline runs against a scripted backend in tests. The production
//! backend is a local Ollama daemon.

use async_trait::async_trait;
use otto_common::error::KernelError;
use otto_common::proposal::ParamMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// An action the model wants taken, parsed from its structured reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub skill: String,
    #[serde(default)]
    pub params: ParamMap,
}

#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    pub action: Option<ProposedAction>,
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(&self, model: &str, prompt: &str) -> Result<ModelReply, KernelError>;
}

/// Structured reply format the deliberation prompt asks for.
#[derive(Deserialize)]
struct StructuredReply {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    action: Option<ProposedAction>,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    async fn complete(&self, model: &str, prompt: &str) -> Result<ModelReply, KernelError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&OllamaRequest {
                model,
                prompt,
                stream: false,
                format: "json",
            })
            .send()
            .await
            .map_err(|e| KernelError::ModelUnavailable(format!("ollama unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(KernelError::ModelUnavailable(format!(
                "ollama returned {}",
                response.status()
            )));
        }

        let body: OllamaResponse = response
            .json()
            .await
            .map_err(|e| KernelError::ExecutionFailure(format!("bad ollama response: {}", e)))?;

        // The model was asked for JSON; a malformed reply degrades to
        // plain text instead of failing the request.
        match serde_json::from_str::<StructuredReply>(&body.response) {
            Ok(reply) => Ok(ModelReply {
                text: reply.answer,
                action: reply.action,
            }),
            Err(_) => {
                debug!("Model {} returned unstructured text", model);
                Ok(ModelReply {
                    text: body.response,
                    action: None,
                })
            }
        }
    }
}

/// Scripted backend: pops pre-loaded replies in order. Used by the
/// pipeline tests; an empty script means unavailable.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<ModelReply, KernelError>>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes this long before returning.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_text(&self, text: &str) {
        self.replies.lock().unwrap().push_back(Ok(ModelReply {
            text: text.to_string(),
            action: None,
        }));
    }

    pub fn push_action(&self, text: &str, skill: &str, params: ParamMap) {
        self.replies.lock().unwrap().push_back(Ok(ModelReply {
            text: text.to_string(),
            action: Some(ProposedAction {
                skill: skill.to_string(),
                params,
            }),
        }));
    }

    pub fn push_error(&self, err: KernelError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn complete(&self, model: &str, _prompt: &str) -> Result<ModelReply, KernelError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(KernelError::ModelUnavailable(format!(
                "no scripted reply for {}",
                model
            )))
        })
    }
}
