//! # Claudia Core
//!
//! Persistent memory engine for a local conversational assistant. Gives the
//! assistant semantically-searchable long-term memory across sessions:
//!
//! - **Entities**: people, organizations, projects, concepts, locations
//! - **Memories**: facts, commitments, learnings, observations, preferences,
//!   patterns, deduplicated by normalized content hash
//! - **Bi-temporal relationships**: typed edges with fact-time validity
//! - **Semantic recall**: embedding-backed search with multi-factor ranking
//!   and a rehearsal effect on every hit
//! - **Consolidation**: importance decay, similarity merging, pattern
//!   detection
//! - **Episodes**: buffered session turns summarized into narratives
//!
//! Storage is a single SQLite file per workspace (WAL mode, forward-only
//! migration ladder with schema integrity verification). Embeddings and
//! structured extraction come from local model runtimes reached over HTTP;
//! both are optional at runtime and every path degrades gracefully when they
//! are down.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use claudia_core::{Config, Store, RememberService, RecallService};
//!
//! let config = Config::from_env()?;
//! let store = Arc::new(Store::open(&config.db_path)?);
//! let embedder = Arc::new(Embedder::new(&config.embedding)?);
//!
//! let remember = RememberService::new(store.clone(), embedder.clone(), config.clone());
//! remember.remember_fact(RememberInput {
//!     content: "Sarah Chen works at Acme Corp".into(),
//!     memory_type: MemoryType::Fact,
//!     importance: 0.9,
//!     ..Default::default()
//! }).await?;
//!
//! let recall = RecallService::new(store, embedder, config);
//! let hits = recall.recall("who works at acme?", 10, None).await?;
//! ```

pub mod config;
pub mod embed;
pub mod error;
pub mod extract;
pub mod llm;
pub mod model;
pub mod services;
pub mod store;
pub mod text;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{Config, ConsolidationConfig, EmbedderConfig, LanguageModelConfig, RecallConfig};
pub use embed::{cosine_similarity, Embedder, Embedding};
pub use error::{MemoryError, Result};
pub use extract::EntityExtractor;
pub use llm::{Extraction, LanguageModel};
pub use model::{
    Document, Entity, EntityRef, EntityType, Episode, Memory, MemoryType, Pattern, PatternType,
    Reflection, ReflectionType, Relationship, Turn, VerificationStatus, WELL_KNOWN_RELATIONSHIPS,
};
pub use services::consolidate::{ConsolidateService, ConsolidationReport};
pub use services::ingest::{CommitSummary, ExtractionProposal, IngestService, SourceMode};
pub use services::recall::{
    AboutReport, RecallFilter, RecallHit, RecallService, RelationshipView, TraceReport,
};
pub use services::reflect::{ReflectService, ReflectionInput, ReflectionUpdate};
pub use services::remember::{
    RelateInput, RememberInput, RememberOutcome, RememberService, RememberedEntity,
};
pub use services::session::{
    EntitySpec, EpisodeSummary, SessionBuffer, SessionSummaryInput, TurnReceipt,
    UnsummarizedSession,
};
pub use services::{ChangeEvent, EventSender};
pub use store::{Store, StoreCounts};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
