//! Generic JSON-over-HTTP adapters for backends and judges.
//!
//! Edit request body:
//! `{ "model", "instruction", "seed", "image": <base64 or null> }`,
//! answered with `{ "status": "success"|"refused"|"error", "image", "message" }`.
//!
//! Judge request body:
//! `{ "model", "question", "source_image", "output_image" }`, answered with the
//! dimension object (optionally wrapped as `{ "answer": { .. } }`).

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::{EditBackend, EditRequest, EditResponse, EditStatus};
use crate::config::{BackendConfig, EvaluatorConfig};
use crate::ensemble::judge::{Judge, JudgeRequest};
use crate::error::{BackendError, ConfigError, JudgeError};

fn build_client(timeout_secs: u64) -> Result<Client, ConfigError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ConfigError::Invalid {
            message: format!("Failed to build HTTP client: {e}"),
        })
}

fn resolve_key(name: &str, api_key_env: Option<&str>) -> Result<Option<String>, ConfigError> {
    match api_key_env {
        None => Ok(None),
        Some(var) => std::env::var(var).map(Some).map_err(|_| ConfigError::Invalid {
            message: format!("'{name}' expects an API key in ${var}, which is not set"),
        }),
    }
}

fn require_endpoint(name: &str, endpoint: Option<&String>) -> Result<String, ConfigError> {
    endpoint
        .map(|e| e.trim_end_matches('/').to_string())
        .ok_or_else(|| ConfigError::Invalid {
            message: format!("'{name}' is an http adapter but has no endpoint"),
        })
}

/// Image-editing backend reached over HTTP.
pub struct HttpEditBackend {
    name: String,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: u64,
}

impl HttpEditBackend {
    pub fn from_config(config: &BackendConfig, timeout_secs: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            name: config.name.clone(),
            client: build_client(timeout_secs)?,
            endpoint: require_endpoint(&config.name, config.endpoint.as_ref())?,
            api_key: resolve_key(&config.name, config.api_key_env.as_deref())?,
            model: config.model.clone(),
            timeout_secs,
        })
    }

    fn request_body(&self, request: &EditRequest) -> Value {
        json!({
            "model": self.model,
            "instruction": request.instruction,
            "seed": request.seed,
            "image": request.source_image.as_deref().map(|bytes| STANDARD.encode(bytes)),
        })
    }

    /// Map an HTTP failure status to a backend error.
    fn map_http_error(
        status: reqwest::StatusCode,
        retry_after: Option<u64>,
        body: &str,
    ) -> BackendError {
        match status.as_u16() {
            429 => BackendError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(5),
            },
            408 | 504 => BackendError::Timeout { timeout_secs: 0 },
            code if code >= 500 => BackendError::Server {
                status: code,
                message: body.chars().take(500).collect(),
            },
            code => BackendError::Terminal {
                message: format!("HTTP {code}: {}", body.chars().take(500).collect::<String>()),
            },
        }
    }

    fn parse_response(body: &Value) -> Result<EditResponse, BackendError> {
        let status = match body.get("status").and_then(Value::as_str) {
            Some("success") => EditStatus::Success,
            Some("refused") => EditStatus::Refused,
            Some("error") => EditStatus::Error,
            other => {
                return Err(BackendError::Terminal {
                    message: format!("unknown response status {other:?}"),
                });
            }
        };
        let image = match body.get("image").and_then(Value::as_str) {
            // Undecodable payloads are kept so the refusal detector can flag them.
            Some(encoded) => Some(
                STANDARD
                    .decode(encoded)
                    .unwrap_or_else(|_| encoded.as_bytes().to_vec()),
            ),
            None => None,
        };
        Ok(EditResponse {
            image,
            status,
            message: body
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else {
            BackendError::Connection {
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl EditBackend for HttpEditBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn edit(&self, request: EditRequest) -> Result<EditResponse, BackendError> {
        debug!(backend = %self.name, key = %request.key, "Sending edit request");

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&self.request_body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, retry_after, &text));
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| BackendError::Terminal {
            message: format!("Invalid JSON: {e}"),
        })?;
        Self::parse_response(&body)
    }
}

/// Vision-language judge reached over HTTP.
pub struct HttpJudge {
    name: String,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: u64,
}

impl HttpJudge {
    pub fn from_config(config: &EvaluatorConfig, timeout_secs: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            name: config.name.clone(),
            client: build_client(timeout_secs)?,
            endpoint: require_endpoint(&config.name, config.endpoint.as_ref())?,
            api_key: resolve_key(&config.name, config.api_key_env.as_deref())?,
            model: config.model.clone(),
            timeout_secs,
        })
    }

    fn unwrap_answer(body: Value) -> Value {
        match body {
            Value::Object(mut map) if map.get("answer").is_some_and(Value::is_object) => {
                map.remove("answer").unwrap_or(Value::Null)
            }
            other => other,
        }
    }
}

#[async_trait]
impl Judge for HttpJudge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn judge(&self, request: JudgeRequest) -> Result<Value, JudgeError> {
        let body = json!({
            "model": self.model,
            "question": request.question,
            "source_image": request.source_image.as_deref().map(|b| STANDARD.encode(b)),
            "output_image": STANDARD.encode(&*request.output_image),
        });

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                JudgeError::Timeout {
                    name: self.name.clone(),
                    timeout_secs: self.timeout_secs,
                }
            } else {
                JudgeError::Request {
                    name: self.name.clone(),
                    message: e.to_string(),
                }
            }
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| JudgeError::Request {
            name: self.name.clone(),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(JudgeError::Request {
                name: self.name.clone(),
                message: format!("HTTP {}: {}", status.as_u16(), text),
            });
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| JudgeError::Malformed {
            name: self.name.clone(),
            message: e.to_string(),
        })?;
        Ok(Self::unwrap_answer(value))
    }
}
