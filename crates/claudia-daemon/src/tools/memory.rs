//! Memory tools: `remember`, `recall`, `trace`.

use std::sync::Arc;

use claudia_core::{RecallFilter, RememberInput, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, to_value};
use crate::context::AppContext;

/// Store a fact or memory with optional entity links.
pub async fn remember(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: RememberInput = parse_args(args)?;
    let outcome = ctx.remember.remember_fact(input).await?;
    to_value(&outcome)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RecallArgs {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    filter: Option<RecallFilter>,
}

fn default_limit() -> usize {
    10
}

/// Semantic search; returns ranked memories.
pub async fn recall(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: RecallArgs = parse_args(args)?;
    let hits = ctx.recall.recall(&input.query, input.limit, input.filter).await?;
    let count = hits.len();
    Ok(json!({ "memories": hits, "count": count }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TraceArgs {
    memory_id: i64,
}

/// Provenance chain of one memory.
pub fn trace(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: TraceArgs = parse_args(args)?;
    let report = ctx.recall.trace(input.memory_id)?;
    to_value(&report)
}
