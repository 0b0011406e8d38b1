//! One generation call: request assembly, the primary request, and the fallback retrieval
//! that some backends offer after a timeout.
//!
//! The primary request is sent exactly once. A timeout on a backend with a retrieval
//! endpoint costs one extra call; every other failure is final.

use crate::backend::{params, Backend, FallbackRequest};
use crate::error::BenchError;
use crate::model::{GenerationOutcome, Params, PromptTemplate};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Inputs of a single generate call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub model_name: &'a str,
    pub prompt: &'a str,
    /// Backend-neutral parameters resolved for the model.
    pub params: &'a Params,
    pub template: &'a PromptTemplate,
}

/// Request body and endpoints, ready to send.
#[derive(Debug, Clone)]
pub(crate) struct PreparedRequest {
    pub endpoint: &'static str,
    pub payload: Value,
    pub fallback: Option<FallbackRequest>,
}

pub struct GenerationDispatcher {
    http: reqwest::Client,
    base_url: String,
    primary_timeout: Duration,
    fallback_timeout: Duration,
}

impl GenerationDispatcher {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        primary_timeout: Duration,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            primary_timeout,
            fallback_timeout,
        }
    }

    pub(crate) fn prepare(&self, backend: Backend, req: &GenerationRequest<'_>) -> PreparedRequest {
        let prompt = backend.apply_prompt_filter(req.model_name, req.prompt.to_string());

        let mut payload = backend.default_generation_params();
        params::merge(&mut payload, backend.map_params(req.params));
        backend.apply_template(&mut payload, prompt, req.template);
        let applied = backend.apply_payload_filter(req.model_name, &mut payload);
        if !applied.is_empty() {
            tracing::debug!(model = req.model_name, rules = ?applied, "model payload rules applied");
        }
        let fallback = backend.attach_request_key(req.model_name, &mut payload);

        PreparedRequest {
            endpoint: backend.generate_path(),
            payload: Value::Object(payload),
            fallback,
        }
    }

    pub async fn generate(&self, backend: Backend, req: &GenerationRequest<'_>) -> GenerationOutcome {
        let prepared = self.prepare(backend, req);

        let start = Instant::now();
        let primary = self
            .post_json(prepared.endpoint, &prepared.payload, self.primary_timeout)
            .await;
        let elapsed = start.elapsed();

        match primary {
            Ok(body) => extract(backend, prepared.endpoint, &body, elapsed, false),
            Err(e) if e.is_timeout() => match prepared.fallback {
                Some(fb) => {
                    tracing::warn!(
                        backend = backend.name(),
                        waited = ?elapsed,
                        "primary request timed out, trying fallback retrieval"
                    );
                    // Elapsed stays pinned at the primary request's duration.
                    match self.post_json(fb.endpoint, &fb.payload, self.fallback_timeout).await {
                        Ok(body) => extract(backend, fb.endpoint, &body, elapsed, true),
                        Err(fb_err) => GenerationOutcome::failed(
                            BenchError::Fallback(fb_err.to_string()),
                            elapsed,
                            true,
                        ),
                    }
                }
                None => GenerationOutcome::failed(e, elapsed, false),
            },
            Err(e) => GenerationOutcome::failed(e, elapsed, false),
        }
    }

    async fn post_json(
        &self,
        endpoint: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, BenchError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), endpoint);
        let resp = self
            .http
            .post(&url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BenchError::GenerationRequest(format!(
                "HTTP {status} from {endpoint}: {}",
                error_detail(&body)
            )));
        }

        let bytes = resp.bytes().await.map_err(|e| classify(e, timeout))?;
        serde_json::from_slice(&bytes).map_err(|e| BenchError::ResponseParse {
            endpoint: endpoint.to_string(),
            reason: format!("invalid JSON: {e}"),
        })
    }
}

fn extract(
    backend: Backend,
    endpoint: &str,
    body: &Value,
    elapsed: Duration,
    fallback: bool,
) -> GenerationOutcome {
    match backend.extract_text(body) {
        Ok(text) => GenerationOutcome::succeeded(text, elapsed, fallback),
        Err(reason) => GenerationOutcome::failed(
            BenchError::ResponseParse {
                endpoint: endpoint.to_string(),
                reason,
            },
            elapsed,
            fallback,
        ),
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> BenchError {
    if e.is_timeout() {
        BenchError::GenerationTimeout { after: timeout }
    } else {
        BenchError::GenerationRequest(e.to_string())
    }
}

/// OpenAI-style `error.message` when present, otherwise the start of the body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}
