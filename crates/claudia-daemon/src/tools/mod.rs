//! Tool handlers.
//!
//! Each tool parses its arguments into a typed input (unknown fields are
//! rejected), calls one service, and returns a JSON result. Dispatch is a
//! plain match on the tool name; no reflection.

pub mod admin;
pub mod entity;
pub mod memory;
pub mod session;

use std::sync::Arc;

use claudia_core::{MemoryError, Result};
use serde_json::Value;

use crate::context::AppContext;
use crate::scheduler::SchedulerStatus;

/// Tools exposed over the line protocol
pub const TOOLS: &[&str] = &[
    "remember",
    "recall",
    "about",
    "relate",
    "entity",
    "search_entities",
    "buffer_turn",
    "end_session",
    "unsummarized",
    "batch",
    "trace",
    "consolidate",
    "system_health",
    "reflections",
    "ingest",
];

/// Route one request to its handler.
pub async fn dispatch(
    ctx: &Arc<AppContext>,
    scheduler: &SchedulerStatus,
    tool: &str,
    args: Value,
) -> Result<Value> {
    match tool {
        "remember" => memory::remember(ctx, args).await,
        "recall" => memory::recall(ctx, args).await,
        "trace" => memory::trace(ctx, args),
        "about" => entity::about(ctx, args),
        "relate" => entity::relate(ctx, args).await,
        "entity" => entity::entity(ctx, args).await,
        "search_entities" => entity::search_entities(ctx, args),
        "buffer_turn" => session::buffer_turn(ctx, args),
        "end_session" => session::end_session(ctx, args).await,
        "unsummarized" => session::unsummarized(ctx),
        "batch" => admin::batch(ctx, args).await,
        "consolidate" => admin::consolidate(ctx).await,
        "system_health" => admin::system_health(ctx, scheduler).await,
        "reflections" => admin::reflections(ctx, args),
        "ingest" => admin::ingest(ctx, args).await,
        unknown => Err(MemoryError::InvalidInput(format!(
            "unknown tool '{}' (available: {})",
            unknown,
            TOOLS.join(", ")
        ))),
    }
}

/// Parse tool arguments into a typed input.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| MemoryError::InvalidInput(e.to_string()))
}

pub(crate) fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| MemoryError::Internal(e.to_string()))
}
