// Fractal Memory Engine — Remote Embedding Client
//
// Calls Ollama or OpenAI-compatible embedding APIs. Every call is bounded by
// the configured timeout. In `auto` mode a one-time readiness check decides
// for the whole process whether the service is worth trying at all; `remote`
// mode skips that gate and attempts the service on every call.

use super::vector::l2_normalize;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::{EmbeddingConfig, EmbeddingMode};
use log::{info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Embedding client — calls Ollama or OpenAI-compatible embedding API.
pub struct RemoteEmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
    ready_timeout: Duration,
    ready: OnceCell<bool>,
    /// Consult the cached readiness check before each call.
    gated: bool,
}

impl RemoteEmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> EngineResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(RemoteEmbeddingClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            ready_timeout: Duration::from_secs(config.ready_timeout_secs),
            ready: OnceCell::new(),
            gated: config.mode != EmbeddingMode::Remote,
        })
    }

    /// One-time readiness check. The answer is cached for the process lifetime.
    pub async fn is_ready(&self) -> bool {
        *self
            .ready
            .get_or_init(|| async {
                let first = tokio::time::timeout(
                    self.ready_timeout,
                    self.embed_ollama(&["ping".to_string()]),
                )
                .await;
                match first {
                    Ok(Ok(_)) => {
                        info!("[embed] Remote embeddings ready at {} (model {})", self.base_url, self.model);
                        true
                    }
                    Ok(Err(e)) => match tokio::time::timeout(
                        self.ready_timeout,
                        self.embed_openai(&["ping".to_string()]),
                    )
                    .await
                    {
                        Ok(Ok(_)) => {
                            info!("[embed] OpenAI-compatible embeddings ready at {}", self.base_url);
                            true
                        }
                        _ => {
                            warn!("[embed] Remote embeddings unavailable at {}: {}", self.base_url, e);
                            false
                        }
                    },
                    Err(_) => {
                        warn!("[embed] Remote embedding readiness check timed out after {:?}", self.ready_timeout);
                        false
                    }
                }
            })
            .await
    }

    /// Embed a batch, returning one normalized vector per input.
    /// Tries Ollama first, then the OpenAI-compatible endpoint. A gated client
    /// that found the service down at startup fails fast without a request.
    pub async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if self.gated && !self.is_ready().await {
            return Err(EngineError::Embedding(format!("{} not reachable", self.base_url)));
        }

        let ollama_result = self.embed_ollama(texts).await;
        let ollama_err = match ollama_result {
            Ok(vecs) => return Ok(normalize_all(vecs)),
            Err(e) => e,
        };

        match self.embed_openai(texts).await {
            Ok(vecs) => Ok(normalize_all(vecs)),
            Err(openai_err) => Err(EngineError::Embedding(format!(
                "Ollama: {} | OpenAI: {}",
                ollama_err, openai_err
            ))),
        }
    }

    /// Ollama current API: POST /api/embed { model, input: [..] } → { embeddings: [[f32...]] }
    /// Falls back to legacy: POST /api/embeddings { model, prompt } → { embedding: [f32...] }, one call per text.
    async fn embed_ollama(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let body = json!({ "model": self.model, "input": texts });

        if let Ok(resp) = self.client.post(&url).json(&body).send().await {
            if resp.status().is_success() {
                let v: Value = resp.json().await?;
                if let Some(rows) = v["embeddings"].as_array() {
                    let vecs: Vec<Vec<f32>> = rows.iter().map(parse_vector).collect();
                    if vecs.len() == texts.len() && vecs.iter().all(|r| !r.is_empty()) {
                        return Ok(vecs);
                    }
                }
            } else {
                info!("[embed] /api/embed returned {} — trying legacy endpoint", resp.status());
            }
        }

        let legacy_url = format!("{}/api/embeddings", self.base_url);
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let resp = self
                .client
                .post(&legacy_url)
                .json(&json!({ "model": self.model, "prompt": text }))
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(EngineError::Embedding(format!("Ollama embed {} — {}", status, body)));
            }
            let v: Value = resp.json().await?;
            let vec = parse_vector(&v["embedding"]);
            if vec.is_empty() {
                return Err(EngineError::Embedding("No 'embedding' array in Ollama response".into()));
            }
            out.push(vec);
        }
        Ok(out)
    }

    /// OpenAI-compatible format: POST /v1/embeddings { model, input } → { data: [{ embedding }] }
    async fn embed_openai(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Embedding(format!("OpenAI embed {} — {}", status, text)));
        }

        let v: Value = resp.json().await?;
        let data = v["data"]
            .as_array()
            .ok_or_else(|| EngineError::Embedding("No 'data' array in OpenAI response".into()))?;
        let vecs: Vec<Vec<f32>> = data.iter().map(|d| parse_vector(&d["embedding"])).collect();
        if vecs.len() != texts.len() || vecs.iter().any(|r| r.is_empty()) {
            return Err(EngineError::Embedding(format!(
                "OpenAI returned {} vectors for {} inputs",
                vecs.len(),
                texts.len()
            )));
        }
        Ok(vecs)
    }
}

fn parse_vector(v: &Value) -> Vec<f32> {
    v.as_array()
        .map(|arr| arr.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect())
        .unwrap_or_default()
}

fn normalize_all(mut vecs: Vec<Vec<f32>>) -> Vec<Vec<f32>> {
    for v in vecs.iter_mut() {
        l2_normalize(v);
    }
    vecs
}
