//! Semantic embeddings.
//!
//! Vectors come from a local embedding runtime reached over its native HTTP
//! API; nothing leaves the machine. The engine treats the runtime as
//! optional: when it is down or slow, writes persist without a vector and
//! recall falls back to keyword search. Missing vectors are backfilled by
//! the consolidation sweep once the runtime returns.

use std::time::Duration;

use serde::Deserialize;

use crate::config::EmbedderConfig;
use crate::error::{MemoryError, Result};

// ============================================================================
// EMBEDDING TYPE
// ============================================================================

/// A semantic embedding vector
#[derive(Debug, Clone)]
pub struct Embedding {
    /// The embedding vector
    pub vector: Vec<f32>,
    /// Dimensions of the vector
    pub dimensions: usize,
}

impl Embedding {
    /// Create a new embedding from a vector
    pub fn new(vector: Vec<f32>) -> Self {
        let dimensions = vector.len();
        Self { vector, dimensions }
    }

    /// Convert to bytes for storage (little-endian f32)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Create from stored bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }

    /// Cosine similarity with another embedding; 0.0 on dimension mismatch
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.dimensions != other.dimensions {
            return 0.0;
        }
        cosine_similarity(&self.vector, &other.vector)
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// EMBEDDER CLIENT
// ============================================================================

/// Maximum text length sent to the runtime (truncated beyond this)
const MAX_TEXT_LENGTH: usize = 8192;

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

/// Async client for the local embedding runtime
pub struct Embedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    timeout: Duration,
}

impl Embedder {
    /// Create a new embedder client. Does not touch the network.
    pub fn new(config: &EmbedderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MemoryError::Config(format!("embedder client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            timeout: config.timeout,
        })
    }

    /// Model identifier
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Configured vector dimension
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Non-blocking availability probe.
    pub async fn is_available(&self) -> bool {
        let probe = self
            .client
            .get(format!("{}/api/tags", self.endpoint))
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        matches!(probe, Ok(resp) if resp.status().is_success())
    }

    /// Embed a text. Transport failures and timeouts come back as
    /// `EmbeddingUnavailable` so callers can persist without a vector; a
    /// dimension mismatch is a fatal `SchemaMismatch`.
    pub async fn embed(&self, text: &str) -> Result<Embedding> {
        let truncated = if text.len() > MAX_TEXT_LENGTH {
            // Truncate on a char boundary
            let mut end = MAX_TEXT_LENGTH;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            &text[..end]
        } else {
            text
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.endpoint))
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": truncated,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MemoryError::EmbeddingUnavailable(format!(
                        "timed out after {:?}",
                        self.timeout
                    ))
                } else {
                    MemoryError::EmbeddingUnavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(MemoryError::EmbeddingUnavailable(format!(
                "runtime returned {}",
                response.status()
            )));
        }

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::EmbeddingUnavailable(e.to_string()))?;

        if body.embedding.len() != self.dimensions {
            return Err(MemoryError::SchemaMismatch {
                expected: self.dimensions,
                actual: body.embedding.len(),
            });
        }

        Ok(Embedding::new(body.embedding))
    }

    /// Startup dimension check. When the runtime is reachable, embeds a
    /// probe string and fails fast on a dimension mismatch; an unreachable
    /// runtime is fine (degraded mode).
    pub async fn verify_dimensions(&self) -> Result<()> {
        if !self.is_available().await {
            tracing::warn!(
                model = %self.model,
                "embedding runtime unreachable at startup; running degraded"
            );
            return Ok(());
        }
        match self.embed("dimension probe").await {
            Ok(_) => Ok(()),
            Err(e @ MemoryError::SchemaMismatch { .. }) => Err(e),
            Err(e) => {
                tracing::warn!("embedding probe failed: {}", e);
                Ok(())
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_roundtrip() {
        let embedding = Embedding::new(vec![0.1, -0.5, 2.0, 0.0]);
        let restored = Embedding::from_bytes(&embedding.to_bytes()).unwrap();
        assert_eq!(restored.dimensions, 4);
        assert_eq!(restored.vector, embedding.vector);
    }

    #[test]
    fn from_bytes_rejects_ragged_input() {
        assert!(Embedding::from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn cosine_basics() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert!((cosine_similarity(&a, &[-1.0, 0.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn unreachable_runtime_degrades() {
        let config = EmbedderConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            model: "all-minilm".to_string(),
            dimensions: 384,
            timeout: Duration::from_millis(250),
        };
        let embedder = Embedder::new(&config).unwrap();

        assert!(!embedder.is_available().await);
        match embedder.embed("hello").await {
            Err(MemoryError::EmbeddingUnavailable(_)) => {}
            other => panic!("expected EmbeddingUnavailable, got {:?}", other.map(|e| e.dimensions)),
        }
        // Startup check tolerates an unreachable runtime
        embedder.verify_dimensions().await.unwrap();
    }
}
