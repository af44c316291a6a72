//! Administrative tools: `batch`, `consolidate`, `system_health`,
//! `reflections`, `ingest`.

use std::sync::Arc;

use claudia_core::services::reflect::apply_reflection;
use claudia_core::services::remember::{apply_entity, apply_fact, apply_relation};
use claudia_core::services::session::apply_turn;
use claudia_core::{
    Embedding, EntityType, Extraction, MemoryError, ReflectionInput, ReflectionUpdate,
    RelateInput, RememberInput, Result, SourceMode,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, to_value};
use crate::context::AppContext;
use crate::health::status_report;
use crate::scheduler::SchedulerStatus;

// ============================================================================
// BATCH
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BatchArgs {
    operations: Vec<BatchOp>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BatchOp {
    tool: String,
    #[serde(default)]
    args: Value,
}

/// One parsed sub-operation with its pre-computed embedding
enum Prepared {
    Remember(RememberInput, Option<Embedding>),
    Entity {
        name: String,
        entity_type: EntityType,
        description: Option<String>,
        embedding: Option<Embedding>,
    },
    Relate(RelateInput),
    BufferTurn {
        session_id: String,
        role: String,
        content: String,
    },
    Reflect(ReflectionInput),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BatchEntityArgs {
    name: String,
    #[serde(rename = "type", default)]
    entity_type: EntityType,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BatchTurnArgs {
    session_id: String,
    role: String,
    content: String,
}

/// Execute up to `max_batch_ops` write operations in a single transaction:
/// either every sub-operation commits or none do. Embeddings are computed
/// before the transaction opens.
pub async fn batch(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: BatchArgs = parse_args(args)?;
    let max = ctx.config.limits.max_batch_ops;
    if input.operations.is_empty() {
        return Err(MemoryError::InvalidInput("batch has no operations".into()));
    }
    if input.operations.len() > max {
        return Err(MemoryError::InvalidInput(format!(
            "batch of {} exceeds the {}-operation limit",
            input.operations.len(),
            max
        )));
    }

    let mut prepared = Vec::with_capacity(input.operations.len());
    for op in input.operations {
        let item = match op.tool.as_str() {
            "remember" => {
                let remember: RememberInput = parse_args(op.args)?;
                let embedding = embed_or_none(ctx, &remember.content).await?;
                Prepared::Remember(remember, embedding)
            }
            "entity" => {
                let entity: BatchEntityArgs = parse_args(op.args)?;
                let embed_text = match &entity.description {
                    Some(d) if !d.is_empty() => format!("{}\n{}", entity.name, d),
                    _ => entity.name.clone(),
                };
                let embedding = embed_or_none(ctx, &embed_text).await?;
                Prepared::Entity {
                    name: entity.name,
                    entity_type: entity.entity_type,
                    description: entity.description,
                    embedding,
                }
            }
            "relate" => Prepared::Relate(parse_args(op.args)?),
            "buffer_turn" => {
                let turn: BatchTurnArgs = parse_args(op.args)?;
                Prepared::BufferTurn {
                    session_id: turn.session_id,
                    role: turn.role,
                    content: turn.content,
                }
            }
            "reflections" => Prepared::Reflect(parse_args(op.args)?),
            other => {
                return Err(MemoryError::InvalidInput(format!(
                    "tool '{}' cannot run inside a batch",
                    other
                )))
            }
        };
        prepared.push(item);
    }

    let model = ctx.embedder.model().to_string();
    let soft_cap = ctx.config.limits.turn_soft_cap;
    let results = ctx.store.with_tx(|tx| {
        let mut results = Vec::with_capacity(prepared.len());
        for item in &prepared {
            let value = match item {
                Prepared::Remember(input, embedding) => {
                    let outcome = apply_fact(tx, input, embedding.as_ref(), &model)?;
                    serde_json::to_value(&outcome)
                }
                Prepared::Entity {
                    name,
                    entity_type,
                    description,
                    embedding,
                } => {
                    let entity = apply_entity(
                        tx,
                        name,
                        *entity_type,
                        description.as_deref(),
                        embedding.as_ref(),
                        &model,
                    )?;
                    serde_json::to_value(&entity)
                }
                Prepared::Relate(input) => {
                    let relationship = apply_relation(tx, input)?;
                    serde_json::to_value(&relationship)
                }
                Prepared::BufferTurn {
                    session_id,
                    role,
                    content,
                } => {
                    let receipt = apply_turn(tx, session_id, role, content, soft_cap)?;
                    serde_json::to_value(&receipt)
                }
                Prepared::Reflect(input) => {
                    let id = apply_reflection(tx, input)?;
                    Ok(json!({ "id": id }))
                }
            };
            results.push(value.map_err(|e| MemoryError::Internal(e.to_string()))?);
        }
        Ok(results)
    })?;

    let count = results.len();
    Ok(json!({ "results": results, "count": count }))
}

async fn embed_or_none(ctx: &AppContext, text: &str) -> Result<Option<Embedding>> {
    match ctx.embedder.embed(text).await {
        Ok(embedding) => Ok(Some(embedding)),
        Err(e @ MemoryError::SchemaMismatch { .. }) => Err(e),
        Err(_) => Ok(None),
    }
}

// ============================================================================
// CONSOLIDATE / HEALTH
// ============================================================================

/// Manually run full consolidation.
pub async fn consolidate(ctx: &Arc<AppContext>) -> Result<Value> {
    let report = ctx.consolidate.consolidate().await?;
    to_value(&report)
}

/// Comprehensive diagnostics, same document as `GET /status`.
pub async fn system_health(ctx: &Arc<AppContext>, scheduler: &SchedulerStatus) -> Result<Value> {
    Ok(status_report(ctx, scheduler).await)
}

// ============================================================================
// REFLECTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReflectionAction {
    #[default]
    List,
    Add,
    Update,
    Delete,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReflectionsArgs {
    #[serde(default)]
    action: ReflectionAction,
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    reflection: Option<ReflectionInput>,
    #[serde(default)]
    update: Option<ReflectionUpdate>,
}

/// List, add, update, or delete reflections.
pub fn reflections(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: ReflectionsArgs = parse_args(args)?;
    match input.action {
        ReflectionAction::List => {
            let reflections = ctx.reflect.list()?;
            Ok(json!({ "reflections": reflections }))
        }
        ReflectionAction::Add => {
            let reflection = input.reflection.ok_or_else(|| {
                MemoryError::InvalidInput("action 'add' requires a reflection".into())
            })?;
            let id = ctx.reflect.insert(&reflection)?;
            Ok(json!({ "id": id }))
        }
        ReflectionAction::Update => {
            let id = input.id.ok_or_else(|| {
                MemoryError::InvalidInput("action 'update' requires an id".into())
            })?;
            let update = input.update.ok_or_else(|| {
                MemoryError::InvalidInput("action 'update' requires update fields".into())
            })?;
            let reflection = ctx.reflect.update(id, &update)?;
            to_value(&reflection)
        }
        ReflectionAction::Delete => {
            let id = input.id.ok_or_else(|| {
                MemoryError::InvalidInput("action 'delete' requires an id".into())
            })?;
            ctx.reflect.delete(id)?;
            Ok(json!({ "deleted": id }))
        }
    }
}

// ============================================================================
// INGEST
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum IngestAction {
    #[default]
    Extract,
    Commit,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileSpec {
    source_type: String,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct IngestArgs {
    #[serde(default)]
    action: IngestAction,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    mode: SourceMode,
    #[serde(default)]
    extraction: Option<Extraction>,
    /// When present on commit, file the source text as a document
    #[serde(default)]
    file: Option<FileSpec>,
}

/// Extract structured content from source text, or commit an approved
/// extraction.
pub async fn ingest(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: IngestArgs = parse_args(args)?;
    match input.action {
        IngestAction::Extract => {
            let text = input.text.ok_or_else(|| {
                MemoryError::InvalidInput("action 'extract' requires text".into())
            })?;
            let proposal = ctx.ingest.extract(&text, input.mode).await?;
            to_value(&proposal)
        }
        IngestAction::Commit => {
            let extraction = input.extraction.ok_or_else(|| {
                MemoryError::InvalidInput("action 'commit' requires an extraction".into())
            })?;
            let file_as = input
                .file
                .as_ref()
                .map(|f| (f.source_type.as_str(), f.filename.as_deref()));
            let summary = ctx
                .ingest
                .commit(&extraction, input.text.as_deref(), file_as)
                .await?;
            to_value(&summary)
        }
    }
}
