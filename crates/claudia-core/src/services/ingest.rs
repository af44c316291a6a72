//! Ingest service: LLM-backed extraction over source material.
//!
//! Extraction is a two-step contract with the host: `extract` returns the
//! structured candidates for approval, and `commit` persists an approved
//! extraction through the remember cores in one transaction. When the
//! language model is down, extraction degrades to regex entities only.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::embed::{Embedder, Embedding};
use crate::error::{MemoryError, Result};
use crate::extract::EntityExtractor;
use crate::llm::{Extraction, LanguageModel};
use crate::model::{EntityType, MemoryType};
use crate::services::remember::{
    apply_document, apply_entity, apply_fact, apply_relation, RelateInput, RememberInput,
};
use crate::store::Store;

/// Kind of source text being ingested; steers the extraction prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Transcript,
    Email,
    Document,
    #[default]
    General,
}

impl SourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::Transcript => "transcript",
            SourceMode::Email => "email",
            SourceMode::Document => "document",
            SourceMode::General => "general",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "transcript" => SourceMode::Transcript,
            "email" => SourceMode::Email,
            "document" => SourceMode::Document,
            _ => SourceMode::General,
        }
    }
}

/// What `extract` hands back for approval
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionProposal {
    pub mode: SourceMode,
    /// True when the language model was down and only regex entities exist
    pub degraded: bool,
    #[serde(flatten)]
    pub extraction: Extraction,
}

/// Counts of what a committed extraction persisted
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub memories: usize,
    pub entities: usize,
    pub relationships: usize,
    pub commitments: usize,
    pub document_id: Option<i64>,
}

/// Extraction orchestrator over transcripts, emails, and documents
pub struct IngestService {
    store: Arc<Store>,
    embedder: Arc<Embedder>,
    language_model: Arc<LanguageModel>,
    extractor: EntityExtractor,
    #[allow(dead_code)]
    config: Config,
}

impl IngestService {
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<Embedder>,
        language_model: Arc<LanguageModel>,
        config: Config,
    ) -> Self {
        Self {
            store,
            embedder,
            language_model,
            extractor: EntityExtractor::new(),
            config,
        }
    }

    /// Run extraction over source text. Nothing is persisted; the host
    /// decides what to keep and calls `commit`.
    pub async fn extract(&self, text: &str, mode: SourceMode) -> Result<ExtractionProposal> {
        if text.trim().is_empty() {
            return Err(MemoryError::InvalidInput("source text is empty".into()));
        }

        match self.language_model.extract(text, mode.as_str()).await {
            Ok(extraction) => Ok(ExtractionProposal {
                mode,
                degraded: false,
                extraction,
            }),
            Err(MemoryError::LanguageModelUnavailable(reason)) => {
                tracing::warn!("extraction degraded to regex entities: {}", reason);
                let entities = self.extractor.extract(text);
                Ok(ExtractionProposal {
                    mode,
                    degraded: true,
                    extraction: Extraction {
                        entities,
                        ..Default::default()
                    },
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Persist an approved extraction in one transaction. When `file_as` is
    /// given, the source text is filed as a document linked to the
    /// extracted entities.
    pub async fn commit(
        &self,
        extraction: &Extraction,
        source_text: Option<&str>,
        file_as: Option<(&str, Option<&str>)>,
    ) -> Result<CommitSummary> {
        // Embeddings happen before the write lock is taken
        let mut memory_inputs: Vec<(RememberInput, Option<Embedding>)> = Vec::new();
        for memory in &extraction.memories {
            let input = RememberInput {
                content: memory.content.clone(),
                memory_type: memory
                    .memory_type
                    .as_deref()
                    .map(MemoryType::parse_name)
                    .unwrap_or_default(),
                importance: memory.importance.unwrap_or(0.5).clamp(0.0, 1.0),
                about_entities: memory.about.clone(),
                ..Default::default()
            };
            let embedding = self.embed_or_none(&input.content).await?;
            memory_inputs.push((input, embedding));
        }
        for commitment in &extraction.commitments {
            let mut content = commitment.content.clone();
            if let Some(deadline) = &commitment.deadline {
                if !content.contains(deadline.as_str()) {
                    content = format!("{} (due {})", content, deadline);
                }
            }
            let embedding = self.embed_or_none(&content).await?;
            memory_inputs.push((
                RememberInput {
                    content,
                    memory_type: MemoryType::Commitment,
                    importance: 0.7,
                    ..Default::default()
                },
                embedding,
            ));
        }

        let model = self.embedder.model().to_string();
        let commitments = extraction.commitments.len();
        let memories = extraction.memories.len();

        self.store.with_tx(|tx| {
            let mut summary = CommitSummary {
                memories,
                commitments,
                ..Default::default()
            };

            for entity in &extraction.entities {
                apply_entity(
                    tx,
                    &entity.name,
                    entity
                        .entity_type
                        .as_deref()
                        .map(EntityType::parse_name)
                        .unwrap_or_default(),
                    entity.description.as_deref(),
                    None,
                    &model,
                )?;
                summary.entities += 1;
            }

            for (input, embedding) in &memory_inputs {
                apply_fact(tx, input, embedding.as_ref(), &model)?;
            }

            for relationship in &extraction.relationships {
                apply_relation(
                    tx,
                    &RelateInput {
                        source: relationship.source.clone(),
                        target: relationship.target.clone(),
                        relationship_type: relationship.relationship_type.clone(),
                        strength: relationship.strength.unwrap_or(0.5).clamp(0.0, 1.0),
                        valid_at: None,
                    },
                )?;
                summary.relationships += 1;
            }

            if let (Some(text), Some((source_type, filename))) = (source_text, file_as) {
                let entity_names: Vec<String> = extraction
                    .entities
                    .iter()
                    .map(|e| e.name.clone())
                    .collect();
                let id = apply_document(tx, source_type, filename, text, None, &entity_names)?;
                summary.document_id = Some(id);
            }

            Ok(summary)
        })
    }

    async fn embed_or_none(&self, text: &str) -> Result<Option<Embedding>> {
        match self.embedder.embed(text).await {
            Ok(embedding) => Ok(Some(embedding)),
            Err(e @ MemoryError::SchemaMismatch { .. }) => Err(e),
            Err(_) => Ok(None),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbedderConfig, LanguageModelConfig};
    use crate::llm::{ExtractedCommitment, ExtractedEntity, ExtractedMemory, ExtractedRelationship};
    use tempfile::TempDir;

    fn test_service() -> (IngestService, Arc<Store>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("store.db")).unwrap());
        let embedder = Arc::new(
            Embedder::new(&EmbedderConfig {
                endpoint: "http://127.0.0.1:1".to_string(),
                model: "all-minilm".to_string(),
                dimensions: 384,
                timeout: std::time::Duration::from_millis(100),
            })
            .unwrap(),
        );
        let language_model = Arc::new(
            LanguageModel::new(&LanguageModelConfig {
                endpoint: "http://127.0.0.1:1".to_string(),
                model: "llama3.2".to_string(),
                timeout: std::time::Duration::from_millis(100),
            })
            .unwrap(),
        );
        let service = IngestService::new(
            store.clone(),
            embedder,
            language_model,
            Config::from_env().unwrap(),
        );
        (service, store, dir)
    }

    #[tokio::test]
    async fn extraction_degrades_to_regex_entities() {
        let (service, _store, _dir) = test_service();
        let proposal = service
            .extract(
                "Sarah Chen from Acme Corp wants a follow-up.",
                SourceMode::Email,
            )
            .await
            .unwrap();
        assert!(proposal.degraded);
        assert!(proposal
            .extraction
            .entities
            .iter()
            .any(|e| e.name == "Sarah Chen"));
        assert!(proposal.extraction.memories.is_empty());
    }

    #[tokio::test]
    async fn commit_persists_everything_atomically() {
        let (service, store, _dir) = test_service();
        let extraction = Extraction {
            entities: vec![
                ExtractedEntity {
                    name: "Sarah Chen".into(),
                    entity_type: Some("person".into()),
                    description: None,
                },
                ExtractedEntity {
                    name: "Acme Corp".into(),
                    entity_type: Some("organization".into()),
                    description: Some("client".into()),
                },
            ],
            memories: vec![ExtractedMemory {
                content: "Sarah Chen is moving to the platform team".into(),
                memory_type: Some("fact".into()),
                importance: Some(0.8),
                about: vec!["Sarah Chen".into()],
            }],
            relationships: vec![ExtractedRelationship {
                source: "Sarah Chen".into(),
                target: "Acme Corp".into(),
                relationship_type: "works_at".into(),
                strength: Some(0.9),
            }],
            commitments: vec![ExtractedCommitment {
                content: "Send revised proposal".into(),
                deadline: Some("2026-09-01".into()),
            }],
        };

        let summary = service
            .commit(
                &extraction,
                Some("full email body"),
                Some(("email", Some("proposal.eml"))),
            )
            .await
            .unwrap();
        assert_eq!(summary.entities, 2);
        assert_eq!(summary.memories, 1);
        assert_eq!(summary.relationships, 1);
        assert_eq!(summary.commitments, 1);
        assert!(summary.document_id.is_some());

        let (memory_count, commitment_count, doc_count): (i64, i64, i64) = store
            .with_read(|conn| {
                Ok((
                    conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?,
                    conn.query_row(
                        "SELECT COUNT(*) FROM memories WHERE type = 'commitment'",
                        [],
                        |r| r.get(0),
                    )?,
                    conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?,
                ))
            })
            .unwrap();
        assert_eq!(memory_count, 2);
        assert_eq!(commitment_count, 1);
        assert_eq!(doc_count, 1);

        // The commitment picked up its deadline for later pattern scans
        let commitment: String = store
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT content FROM memories WHERE type = 'commitment'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert!(commitment.contains("2026-09-01"));
    }

    #[tokio::test]
    async fn empty_source_is_rejected() {
        let (service, _store, _dir) = test_service();
        assert!(matches!(
            service.extract("   ", SourceMode::General).await,
            Err(MemoryError::InvalidInput(_))
        ));
    }
}
