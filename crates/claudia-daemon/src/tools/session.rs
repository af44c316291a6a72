//! Session tools: `buffer_turn`, `end_session`, `unsummarized`.

use std::sync::Arc;

use claudia_core::{Result, SessionSummaryInput};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, to_value};
use crate::context::AppContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BufferTurnArgs {
    session_id: String,
    role: String,
    content: String,
}

/// Append a conversation turn.
pub fn buffer_turn(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: BufferTurnArgs = parse_args(args)?;
    let receipt = ctx
        .session
        .buffer_turn(&input.session_id, &input.role, &input.content)?;
    to_value(&receipt)
}

/// Create an episode summary for a session.
pub async fn end_session(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: SessionSummaryInput = parse_args(args)?;
    let summary = ctx.session.end_session(input).await?;
    to_value(&summary)
}

/// List sessions still needing summaries.
pub fn unsummarized(ctx: &Arc<AppContext>) -> Result<Value> {
    let sessions = ctx.session.unsummarized()?;
    Ok(json!({ "sessions": sessions }))
}
