//! Language model client.
//!
//! Talks to a local generative runtime over its native HTTP API, always with
//! `"format": "json"` so responses parse into structured extractions. The
//! runtime is optional: every caller has a degraded path (regex extraction,
//! or simply skipping summaries).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::LanguageModelConfig;
use crate::error::{MemoryError, Result};

// ============================================================================
// EXTRACTION TYPES
// ============================================================================

/// An entity candidate pulled out of source text
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A memory candidate pulled out of source text
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedMemory {
    pub content: String,
    #[serde(rename = "type", default)]
    pub memory_type: Option<String>,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub about: Vec<String>,
}

/// A relationship candidate pulled out of source text
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub relationship_type: String,
    #[serde(default)]
    pub strength: Option<f64>,
}

/// A commitment candidate, optionally with a deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedCommitment {
    pub content: String,
    #[serde(default)]
    pub deadline: Option<String>,
}

/// Full structured extraction returned to the tool caller for approval
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub memories: Vec<ExtractedMemory>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
    #[serde(default)]
    pub commitments: Vec<ExtractedCommitment>,
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Async client for the local generative runtime
pub struct LanguageModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl LanguageModel {
    /// Create a new client. Does not touch the network.
    pub fn new(config: &LanguageModelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MemoryError::Config(format!("language model client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: config.timeout,
        })
    }

    /// Model identifier
    pub fn model(&self) -> &str {
        &self.model
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

    /// Run one generation with JSON output forced, returning the raw JSON
    /// text. Failures map to `LanguageModelUnavailable`.
    async fn generate_json(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "format": "json",
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MemoryError::LanguageModelUnavailable(format!(
                        "timed out after {:?}",
                        self.timeout
                    ))
                } else {
                    MemoryError::LanguageModelUnavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(MemoryError::LanguageModelUnavailable(format!(
                "runtime returned {}",
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::LanguageModelUnavailable(e.to_string()))?;
        Ok(body.response)
    }

    /// Extract structured entities / memories / relationships / commitments
    /// from free text using a mode-specific prompt.
    pub async fn extract(&self, text: &str, mode_hint: &str) -> Result<Extraction> {
        let prompt = format!(
            "You are an information extraction engine reading a {mode}.\n\
             Extract the important content as JSON with this exact shape:\n\
             {{\"entities\":[{{\"name\":\"\",\"type\":\"person|organization|project|concept|location\",\"description\":\"\"}}],\n \
             \"memories\":[{{\"content\":\"\",\"type\":\"fact|commitment|learning|observation|preference\",\"importance\":0.5,\"about\":[\"entity name\"]}}],\n \
             \"relationships\":[{{\"source\":\"\",\"target\":\"\",\"relationshipType\":\"works_at|works_with|knows|...\",\"strength\":0.5}}],\n \
             \"commitments\":[{{\"content\":\"\",\"deadline\":\"YYYY-MM-DD or null\"}}]}}\n\
             Only include things actually stated in the text. Text follows:\n\n{text}",
            mode = mode_hint,
            text = text,
        );

        let raw = self.generate_json(&prompt).await?;
        let extraction: Extraction = serde_json::from_str(&raw).map_err(|e| {
            MemoryError::LanguageModelUnavailable(format!("unparseable extraction: {}", e))
        })?;
        Ok(extraction)
    }

    /// Summarize a document in a few sentences. Returns plain text.
    pub async fn summarize(&self, text: &str) -> Result<String> {
        let prompt = format!(
            "Summarize the following document in at most three sentences. \
             Respond as JSON: {{\"summary\": \"...\"}}\n\n{}",
            text
        );
        let raw = self.generate_json(&prompt).await?;

        #[derive(Deserialize)]
        struct SummaryResponse {
            summary: String,
        }
        let parsed: SummaryResponse = serde_json::from_str(&raw).map_err(|e| {
            MemoryError::LanguageModelUnavailable(format!("unparseable summary: {}", e))
        })?;
        Ok(parsed.summary)
    }
}
