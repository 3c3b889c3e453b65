// COCO Engine — Embedding Backends
//
// A small capability behind the semantic index: embed(text) → vector, plus
// the dimensionality and a backend name stored alongside every vector so
// accidental mixing is detectable. Two implementations:
//
//   ApiEmbeddingBackend  — OpenAI-compatible POST /v1/embeddings
//   HashEmbeddingBackend — deterministic feature hashing, no network, used
//                          whenever no embedding API key is configured
//
// Dimensionality must stay constant per store; switching backends requires
// a rebuild of the index.

use crate::atoms::error::{CoreError, CoreResult};
use crate::engine::config::EmbeddingConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use zeroize::Zeroizing;

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>>;
    fn dim(&self) -> usize;
    fn name(&self) -> &str;
}

/// Pick the backend for a configuration: the API backend when a key is
/// present, the hash fallback otherwise.
pub fn backend_from_config(config: &EmbeddingConfig) -> Arc<dyn EmbeddingBackend> {
    match &config.api_key {
        Some(key) => Arc::new(ApiEmbeddingBackend::new(config, key)),
        None => {
            log::info!("[rag] No embedding API key — using deterministic hash backend");
            Arc::new(HashEmbeddingBackend::default())
        }
    }
}

// ── API backend ────────────────────────────────────────────────────────────

pub struct ApiEmbeddingBackend {
    client: Client,
    base_url: String,
    model: String,
    /// API key wrapped in Zeroizing<> — zeroed from RAM on drop.
    api_key: Zeroizing<String>,
    dim: usize,
}

impl ApiEmbeddingBackend {
    pub fn new(config: &EmbeddingConfig, api_key: &str) -> Self {
        ApiEmbeddingBackend {
            client: Client::new(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key: Zeroizing::new(api_key.to_string()),
            dim: config.dim,
        }
    }
}

#[async_trait]
impl EmbeddingBackend for ApiEmbeddingBackend {
    /// OpenAI-compatible format: POST /v1/embeddings { model, input }.
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "input": text,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.as_str())
            .json(&body)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| CoreError::EmbeddingFailed(format!("request: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::EmbeddingFailed(format!(
                "API {} — {}",
                status,
                crate::atoms::types::truncate_utf8(&text, 200)
            )));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::EmbeddingFailed(format!("decode: {}", e)))?;

        let embedding = v["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| CoreError::EmbeddingFailed("no data[0].embedding array".into()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if vec.is_empty() {
            return Err(CoreError::EmbeddingFailed("empty embedding vector".into()));
        }
        Ok(vec)
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &str {
        "api"
    }
}

// ── Hash fallback ──────────────────────────────────────────────────────────

/// Deterministic feature-hashing embedder. Each lowercased alphanumeric token
/// hashes to a bucket with a hash-derived sign; the accumulated vector is
/// L2-normalized. Same text always produces the same vector, related texts
/// share buckets through shared tokens.
pub struct HashEmbeddingBackend {
    dim: usize,
}

pub const HASH_BACKEND_DIM: usize = 256;

impl Default for HashEmbeddingBackend {
    fn default() -> Self {
        HashEmbeddingBackend {
            dim: HASH_BACKEND_DIM,
        }
    }
}

impl HashEmbeddingBackend {
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dim];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dim as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 1e-12 {
            for x in &mut vec {
                *x /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl EmbeddingBackend for HashEmbeddingBackend {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &str {
        "hash"
    }
}

// ── Vector math + blob codec ───────────────────────────────────────────────

/// Convert a byte slice (from SQLite BLOB) to a Vec<f32>.
pub(crate) fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Convert a Vec<f32> to bytes for SQLite BLOB storage.
pub(crate) fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Cosine similarity between two vectors. Returns 0.0 on length mismatch.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}
