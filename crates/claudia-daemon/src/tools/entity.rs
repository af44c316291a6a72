//! Entity tools: `about`, `relate`, `entity`, `search_entities`.

use std::sync::Arc;

use claudia_core::{EntityType, RelateInput, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, to_value};
use crate::context::AppContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AboutArgs {
    name: String,
}

/// All context about one entity.
pub fn about(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: AboutArgs = parse_args(args)?;
    let report = ctx.recall.about(&input.name)?;
    to_value(&report)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RelateArgs {
    source: String,
    target: String,
    relationship_type: String,
    #[serde(default = "default_strength")]
    strength: f64,
    #[serde(default)]
    valid_at: Option<chrono::DateTime<chrono::Utc>>,
    /// When set, supersede this relationship id instead of strengthening
    #[serde(default)]
    supersede: Option<i64>,
}

fn default_strength() -> f64 {
    0.5
}

/// Create, strengthen, or supersede a relationship.
pub async fn relate(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: RelateArgs = parse_args(args)?;
    let relate = RelateInput {
        source: input.source,
        target: input.target,
        relationship_type: input.relationship_type,
        strength: input.strength,
        valid_at: input.valid_at,
    };
    let relationship = match input.supersede {
        Some(id) => ctx.remember.supersede_relationship(id, relate).await?,
        None => ctx.remember.relate_entities(relate).await?,
    };
    to_value(&relationship)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EntityArgs {
    name: String,
    #[serde(rename = "type", default)]
    entity_type: EntityType,
    #[serde(default)]
    description: Option<String>,
}

/// Create or update an entity.
pub async fn entity(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: EntityArgs = parse_args(args)?;
    let entity = ctx
        .remember
        .remember_entity(&input.name, input.entity_type, input.description.as_deref())
        .await?;
    to_value(&entity)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SearchEntitiesArgs {
    query: String,
    #[serde(default)]
    types: Option<Vec<EntityType>>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

/// Find entities by name or alias.
pub fn search_entities(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let input: SearchEntitiesArgs = parse_args(args)?;
    let found = ctx
        .recall
        .search_entities(&input.query, input.types.as_deref(), input.limit)?;
    Ok(json!({ "entities": found }))
}
