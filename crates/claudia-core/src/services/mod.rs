//! Service layer: remember, recall, consolidate, ingest, session buffering,
//! reflections.
//!
//! Services hold `Arc` handles to the store and the model-runtime clients;
//! nothing here is a global. Every write path is split into an async outer
//! method (which may call the embedder) and a transaction-scoped `apply_*`
//! core over a `&Connection`, so the `batch` tool can compose arbitrary
//! operations into one atomic write.

pub mod consolidate;
pub mod ingest;
pub mod recall;
pub mod reflect;
pub mod remember;
pub mod session;

use serde::Serialize;

/// Change events emitted after committed writes, consumed by the scheduler
/// and any attached visualizer. Best effort: no subscriber, no cost.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    MemoryStored { id: i64 },
    EntityStored { id: i64 },
    RelationshipChanged { id: i64 },
    EpisodeCreated { id: i64 },
}

/// Shared broadcast sender type for change events
pub type EventSender = tokio::sync::broadcast::Sender<ChangeEvent>;
