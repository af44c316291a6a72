//! Remember service: ingest facts, entities, relationships, and documents.
//!
//! Dedup is by normalized content hash; re-asserting an invalidated memory
//! revives it. Embeddings are generated when the runtime is up and
//! backfilled by consolidation otherwise.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::embed::{Embedder, Embedding};
use crate::error::{MemoryError, Result};
use crate::llm::LanguageModel;
use crate::model::{Entity, EntityType, Memory, MemoryType, Relationship};
use crate::services::{ChangeEvent, EventSender};
use crate::store::Store;
use crate::text::content_hash;

// ============================================================================
// INPUTS / OUTPUTS
// ============================================================================

fn default_importance() -> f64 {
    0.5
}

fn default_confidence() -> f64 {
    0.8
}

fn default_strength() -> f64 {
    0.5
}

/// Input for storing a fact or other memory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RememberInput {
    /// The content to remember
    pub content: String,
    /// Memory type (fact, commitment, learning, observation, preference, pattern)
    #[serde(rename = "type", default)]
    pub memory_type: MemoryType,
    /// Importance in [0, 1]
    #[serde(default = "default_importance")]
    pub importance: f64,
    /// Confidence in [0, 1]
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Entity names this memory is about; resolved or created as needed
    #[serde(default)]
    pub about_entities: Vec<String>,
}

impl Default for RememberInput {
    fn default() -> Self {
        Self {
            content: String::new(),
            memory_type: MemoryType::Fact,
            importance: default_importance(),
            confidence: default_confidence(),
            about_entities: Vec::new(),
        }
    }
}

/// Result of a remember call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RememberOutcome {
    /// Memory row id (existing id when deduplicated)
    pub id: i64,
    /// True when an existing memory with the same content hash was returned
    pub deduplicated: bool,
    /// True when a vector was persisted alongside the memory
    pub embedded: bool,
    /// Ids of the entities linked to this memory
    pub linked_entities: Vec<i64>,
}

/// Result of an entity upsert
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RememberedEntity {
    pub id: i64,
    pub name: String,
    pub created: bool,
}

/// Input for creating or strengthening a relationship
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelateInput {
    pub source: String,
    pub target: String,
    pub relationship_type: String,
    #[serde(default = "default_strength")]
    pub strength: f64,
    /// Fact-time begin; defaults to now
    #[serde(default)]
    pub valid_at: Option<DateTime<Utc>>,
}

// ============================================================================
// ENTITY RESOLUTION
// ============================================================================

/// All live entities matching a name, case-insensitively, canonical names
/// first, then aliases. Importance-descending so the strongest match leads.
pub fn entities_matching(conn: &Connection, name: &str) -> Result<Vec<Entity>> {
    let needle = name.trim();
    let sql = format!(
        "SELECT {cols} FROM entities
         WHERE deleted_at IS NULL AND lower(name) = lower(?1)
         UNION
         SELECT {cols_e} FROM entities e
         JOIN entity_aliases a ON a.entity_id = e.id
         WHERE e.deleted_at IS NULL AND lower(a.alias) = lower(?1)
         ORDER BY importance DESC, id ASC",
        cols = Entity::COLUMNS,
        cols_e = Entity::COLUMNS
            .split(", ")
            .map(|c| format!("e.{}", c))
            .collect::<Vec<_>>()
            .join(", "),
    );
    let mut stmt = conn.prepare(&sql)?;
    let found = stmt
        .query_map([needle], Entity::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(found)
}

/// Resolve a name to exactly one live entity. More than one match is an
/// `Ambiguous` error the caller must disambiguate.
pub fn resolve_entity_strict(conn: &Connection, name: &str) -> Result<Option<Entity>> {
    let mut found = entities_matching(conn, name)?;
    match found.len() {
        0 => Ok(None),
        1 => Ok(Some(found.remove(0))),
        _ => Err(MemoryError::Ambiguous {
            name: name.to_string(),
            candidates: found.into_iter().map(|e| e.name).collect(),
        }),
    }
}

/// Resolve a name or create a concept-typed entity for it.
pub fn resolve_or_create_entity(conn: &Connection, name: &str) -> Result<i64> {
    if let Some(entity) = resolve_entity_strict(conn, name)? {
        return Ok(entity.id);
    }
    insert_entity(conn, name.trim(), EntityType::Concept, None)
}

fn insert_entity(
    conn: &Connection,
    name: &str,
    entity_type: EntityType,
    description: Option<&str>,
) -> Result<i64> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO entities (name, type, description, importance, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0.5, ?4, ?4)",
        params![name, entity_type.as_str(), description, now],
    )?;
    Ok(conn.last_insert_rowid())
}

// ============================================================================
// TRANSACTION-SCOPED CORES
// ============================================================================

fn validate_unit(value: f64, what: &str) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || !value.is_finite() {
        return Err(MemoryError::InvalidInput(format!(
            "{} must be in [0, 1], got {}",
            what, value
        )));
    }
    Ok(())
}

/// Store a memory inside an open transaction. `embedding` was computed
/// before the transaction began (embedding is async, the write is not).
pub fn apply_fact(
    conn: &Connection,
    input: &RememberInput,
    embedding: Option<&Embedding>,
    model: &str,
) -> Result<RememberOutcome> {
    if input.content.trim().is_empty() {
        return Err(MemoryError::InvalidInput("content is empty".into()));
    }
    validate_unit(input.importance, "importance")?;
    validate_unit(input.confidence, "confidence")?;

    let hash = content_hash(&input.content);
    let now = Utc::now();

    // Dedup by content hash. A hit on an invalidated row revives it: the
    // caller is re-asserting something consolidation had retired.
    let existing: Option<(i64, Option<DateTime<Utc>>)> = conn
        .query_row(
            "SELECT id, invalidated_at FROM memories WHERE content_hash = ?1",
            [&hash],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((id, invalidated_at)) = existing {
        if invalidated_at.is_some() {
            conn.execute(
                "UPDATE memories
                 SET invalidated_at = NULL, superseded_by = NULL, updated_at = ?2
                 WHERE id = ?1",
                params![id, now],
            )?;
        }
        let linked = link_entities(conn, id, &input.about_entities)?;
        return Ok(RememberOutcome {
            id,
            deduplicated: true,
            embedded: false,
            linked_entities: linked,
        });
    }

    conn.execute(
        "INSERT INTO memories
         (content, type, importance, confidence, content_hash,
          created_at, updated_at, last_accessed, access_count, verification_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6, 0, 'pending')",
        params![
            input.content,
            input.memory_type.as_str(),
            input.importance,
            input.confidence,
            hash,
            now,
        ],
    )?;
    let id = conn.last_insert_rowid();

    let embedded = if let Some(embedding) = embedding {
        conn.execute(
            "INSERT INTO memory_embeddings (memory_id, embedding, dimensions, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, embedding.to_bytes(), embedding.dimensions as i64, model, now],
        )?;
        true
    } else {
        false
    };

    let linked = link_entities(conn, id, &input.about_entities)?;

    Ok(RememberOutcome {
        id,
        deduplicated: false,
        embedded,
        linked_entities: linked,
    })
}

fn link_entities(conn: &Connection, memory_id: i64, names: &[String]) -> Result<Vec<i64>> {
    let mut linked = Vec::with_capacity(names.len());
    for name in names {
        if name.trim().is_empty() {
            continue;
        }
        let entity_id = resolve_or_create_entity(conn, name)?;
        conn.execute(
            "INSERT OR IGNORE INTO memory_entities (memory_id, entity_id, relationship)
             VALUES (?1, ?2, 'about')",
            params![memory_id, entity_id],
        )?;
        linked.push(entity_id);
    }
    Ok(linked)
}

/// Upsert an entity inside an open transaction. A new description wins only
/// when the stored one is empty.
pub fn apply_entity(
    conn: &Connection,
    name: &str,
    entity_type: EntityType,
    description: Option<&str>,
    embedding: Option<&Embedding>,
    model: &str,
) -> Result<RememberedEntity> {
    let name = name.trim();
    if name.is_empty() {
        return Err(MemoryError::InvalidInput("entity name is empty".into()));
    }
    let now = Utc::now();

    // (type, lower(name)) is the canonical identity, so prefer the
    // exact-typed row before falling back to alias resolution.
    let exact: Option<Entity> = conn
        .query_row(
            &format!(
                "SELECT {} FROM entities
                 WHERE deleted_at IS NULL AND type = ?1 AND lower(name) = lower(?2)",
                Entity::COLUMNS
            ),
            params![entity_type.as_str(), name],
            Entity::from_row,
        )
        .optional()?;

    // Fall back to alias resolution only: a same-named entity of another
    // type is a different entity, not an update target.
    let resolved = match exact {
        Some(entity) => Some(entity),
        None => conn
            .query_row(
                &format!(
                    "SELECT {} FROM entities e
                     JOIN entity_aliases a ON a.entity_id = e.id
                     WHERE e.deleted_at IS NULL AND lower(a.alias) = lower(?1)
                     LIMIT 1",
                    Entity::COLUMNS
                        .split(", ")
                        .map(|c| format!("e.{}", c))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                params![name],
                Entity::from_row,
            )
            .optional()?,
    };

    let (id, created) = match resolved {
        Some(entity) => {
            let merged_description = match (&entity.description, description) {
                (Some(old), _) if !old.is_empty() => entity.description.clone(),
                (_, Some(new)) if !new.is_empty() => Some(new.to_string()),
                _ => entity.description.clone(),
            };
            conn.execute(
                "UPDATE entities SET description = ?2, updated_at = ?3 WHERE id = ?1",
                params![entity.id, merged_description, now],
            )?;
            (entity.id, false)
        }
        None => (insert_entity(conn, name, entity_type, description)?, true),
    };

    if let Some(embedding) = embedding {
        conn.execute(
            "INSERT OR REPLACE INTO entity_embeddings
             (entity_id, embedding, dimensions, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, embedding.to_bytes(), embedding.dimensions as i64, model, now],
        )?;
    }

    let canonical: String =
        conn.query_row("SELECT name FROM entities WHERE id = ?1", [id], |row| {
            row.get(0)
        })?;

    Ok(RememberedEntity {
        id,
        name: canonical,
        created,
    })
}

/// Create or strengthen a relationship inside an open transaction.
pub fn apply_relation(conn: &Connection, input: &RelateInput) -> Result<Relationship> {
    validate_unit(input.strength, "strength")?;
    if input.relationship_type.trim().is_empty() {
        return Err(MemoryError::InvalidInput("relationship type is empty".into()));
    }

    let source_id = resolve_or_create_entity(conn, &input.source)?;
    let target_id = resolve_or_create_entity(conn, &input.target)?;
    if source_id == target_id {
        return Err(MemoryError::InvalidInput(format!(
            "self-edge rejected: '{}' and '{}' resolve to the same entity",
            input.source, input.target
        )));
    }

    let now = Utc::now();
    let relationship_type = input.relationship_type.trim().to_lowercase();

    let current: Option<(i64, f64)> = conn
        .query_row(
            "SELECT id, strength FROM relationships
             WHERE source_entity_id = ?1 AND target_entity_id = ?2
               AND relationship_type = ?3 AND invalid_at IS NULL",
            params![source_id, target_id, relationship_type],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let id = match current {
        Some((id, strength)) => {
            if input.strength > strength {
                conn.execute(
                    "UPDATE relationships SET strength = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, input.strength, now],
                )?;
            }
            id
        }
        None => {
            let valid_at = input.valid_at.unwrap_or(now);
            conn.execute(
                "INSERT INTO relationships
                 (source_entity_id, target_entity_id, relationship_type, strength,
                  valid_at, invalid_at, direction, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'outbound', ?6, ?6)",
                params![source_id, target_id, relationship_type, input.strength, valid_at, now],
            )?;
            conn.last_insert_rowid()
        }
    };

    fetch_relationship(conn, id)
}

/// Close a relationship's validity interval and insert its replacement, as
/// one unit. The closed row becomes immutable history.
pub fn apply_supersede(
    conn: &Connection,
    relationship_id: i64,
    replacement: &RelateInput,
) -> Result<Relationship> {
    let old = fetch_relationship(conn, relationship_id)?;
    if old.invalid_at.is_some() {
        return Err(MemoryError::InvalidInput(format!(
            "relationship {} is already superseded",
            relationship_id
        )));
    }

    let now = Utc::now();
    let cutover = replacement.valid_at.unwrap_or(now);

    // Close before inserting: the partial unique index allows only one
    // currently-valid row per triple.
    conn.execute(
        "UPDATE relationships SET invalid_at = ?2, updated_at = ?3 WHERE id = ?1",
        params![relationship_id, cutover, now],
    )?;

    let source_id = resolve_or_create_entity(conn, &replacement.source)?;
    let target_id = resolve_or_create_entity(conn, &replacement.target)?;
    if source_id == target_id {
        return Err(MemoryError::InvalidInput(
            "self-edge rejected in replacement".into(),
        ));
    }
    validate_unit(replacement.strength, "strength")?;

    conn.execute(
        "INSERT INTO relationships
         (source_entity_id, target_entity_id, relationship_type, strength,
          valid_at, invalid_at, direction, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'outbound', ?6, ?6)",
        params![
            source_id,
            target_id,
            replacement.relationship_type.trim().to_lowercase(),
            replacement.strength,
            cutover,
            now,
        ],
    )?;

    fetch_relationship(conn, conn.last_insert_rowid())
}

pub(crate) fn fetch_relationship(conn: &Connection, id: i64) -> Result<Relationship> {
    conn.query_row(
        &format!(
            "SELECT {} FROM relationships WHERE id = ?1",
            Relationship::COLUMNS
        ),
        [id],
        Relationship::from_row,
    )
    .optional()?
    .ok_or_else(|| MemoryError::NotFound(format!("relationship {}", id)))
}

/// File a source document and link its entities inside an open transaction.
pub fn apply_document(
    conn: &Connection,
    source_type: &str,
    filename: Option<&str>,
    content: &str,
    summary: Option<&str>,
    entities: &[String],
) -> Result<i64> {
    if content.trim().is_empty() {
        return Err(MemoryError::InvalidInput("document content is empty".into()));
    }
    let now = Utc::now();
    conn.execute(
        "INSERT INTO documents (source_type, filename, content, summary, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![source_type, filename, content, summary, now],
    )?;
    let id = conn.last_insert_rowid();

    for name in entities {
        if name.trim().is_empty() {
            continue;
        }
        let entity_id = resolve_or_create_entity(conn, name)?;
        conn.execute(
            "INSERT OR IGNORE INTO entity_documents (entity_id, document_id) VALUES (?1, ?2)",
            params![entity_id, id],
        )?;
    }

    Ok(id)
}

// ============================================================================
// SERVICE
// ============================================================================

/// Ingest service for facts, entities, relationships, and documents
pub struct RememberService {
    store: Arc<Store>,
    embedder: Arc<Embedder>,
    language_model: Arc<LanguageModel>,
    events: Option<EventSender>,
    #[allow(dead_code)]
    config: Config,
}

impl RememberService {
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
            events: None,
            config,
        }
    }

    /// Attach a change-event channel (scheduler / visualizer).
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: ChangeEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Best-effort embedding: a down runtime degrades to `None`, a
    /// dimension mismatch stays fatal.
    async fn embed_or_degrade(&self, text: &str) -> Result<Option<Embedding>> {
        match self.embedder.embed(text).await {
            Ok(embedding) => Ok(Some(embedding)),
            Err(e @ MemoryError::SchemaMismatch { .. }) => Err(e),
            Err(e) => {
                tracing::debug!("persisting without embedding: {}", e);
                Ok(None)
            }
        }
    }

    /// Store a fact or other memory. Duplicate content returns the existing
    /// id without writing a new row or vector.
    pub async fn remember_fact(&self, input: RememberInput) -> Result<RememberOutcome> {
        let embedding = self.embed_or_degrade(&input.content).await?;
        let model = self.embedder.model().to_string();
        let outcome = self
            .store
            .with_tx(|tx| apply_fact(tx, &input, embedding.as_ref(), &model))?;
        self.emit(ChangeEvent::MemoryStored { id: outcome.id });
        Ok(outcome)
    }

    /// Create or update an entity; embedding covers `name + description`.
    pub async fn remember_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        description: Option<&str>,
    ) -> Result<RememberedEntity> {
        let embed_text = match description {
            Some(d) if !d.is_empty() => format!("{}\n{}", name, d),
            _ => name.to_string(),
        };
        let embedding = self.embed_or_degrade(&embed_text).await?;
        let model = self.embedder.model().to_string();
        let entity = self.store.with_tx(|tx| {
            apply_entity(tx, name, entity_type, description, embedding.as_ref(), &model)
        })?;
        self.emit(ChangeEvent::EntityStored { id: entity.id });
        Ok(entity)
    }

    /// Create or strengthen a relationship between two entities.
    pub async fn relate_entities(&self, input: RelateInput) -> Result<Relationship> {
        let relationship = self.store.with_tx(|tx| apply_relation(tx, &input))?;
        self.emit(ChangeEvent::RelationshipChanged {
            id: relationship.id,
        });
        Ok(relationship)
    }

    /// Supersede a relationship: close the old interval, insert the new row.
    pub async fn supersede_relationship(
        &self,
        relationship_id: i64,
        replacement: RelateInput,
    ) -> Result<Relationship> {
        let relationship = self
            .store
            .with_tx(|tx| apply_supersede(tx, relationship_id, &replacement))?;
        self.emit(ChangeEvent::RelationshipChanged {
            id: relationship.id,
        });
        Ok(relationship)
    }

    /// File a source document. The summary is LLM-backed and skipped when
    /// the language model is down.
    pub async fn file_document(
        &self,
        source_type: &str,
        filename: Option<&str>,
        content: &str,
        entities: &[String],
    ) -> Result<i64> {
        let summary = match self.language_model.summarize(content).await {
            Ok(s) => Some(s),
            Err(MemoryError::LanguageModelUnavailable(reason)) => {
                tracing::debug!("filing document without summary: {}", reason);
                None
            }
            Err(e) => return Err(e),
        };
        self.store.with_tx(|tx| {
            apply_document(tx, source_type, filename, content, summary.as_deref(), entities)
        })
    }

    /// Look up a memory by id.
    pub fn get_memory(&self, id: i64) -> Result<Option<Memory>> {
        self.store.with_read(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM memories WHERE id = ?1", Memory::COLUMNS),
                    [id],
                    Memory::from_row,
                )
                .optional()?)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tempfile::TempDir;

    fn open_store() -> (Arc<Store>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("store.db")).unwrap());
        (store, dir)
    }

    fn fact(content: &str, importance: f64) -> RememberInput {
        RememberInput {
            content: content.to_string(),
            importance,
            ..Default::default()
        }
    }

    #[test]
    fn dedup_returns_same_id() {
        let (store, _dir) = open_store();
        let input = fact("Sarah Chen works at Acme Corp", 0.9);

        let first = store
            .with_tx(|tx| apply_fact(tx, &input, None, "all-minilm"))
            .unwrap();
        let second = store
            .with_tx(|tx| apply_fact(tx, &input, None, "all-minilm"))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(!first.deduplicated);
        assert!(second.deduplicated);

        let count: i64 = store
            .with_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn dedup_is_normalization_insensitive() {
        let (store, _dir) = open_store();
        let first = store
            .with_tx(|tx| apply_fact(tx, &fact("Likes  espresso", 0.5), None, "m"))
            .unwrap();
        let second = store
            .with_tx(|tx| apply_fact(tx, &fact("likes espresso", 0.5), None, "m"))
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn reasserting_invalidated_memory_revives_it() {
        let (store, _dir) = open_store();
        let input = fact("Old but true again", 0.5);
        let first = store
            .with_tx(|tx| apply_fact(tx, &input, None, "m"))
            .unwrap();

        store
            .with_write(|conn| {
                conn.execute(
                    "UPDATE memories SET invalidated_at = datetime('now') WHERE id = ?1",
                    [first.id],
                )?;
                Ok(())
            })
            .unwrap();

        let second = store
            .with_tx(|tx| apply_fact(tx, &input, None, "m"))
            .unwrap();
        assert_eq!(second.id, first.id);

        let invalidated: Option<String> = store
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT invalidated_at FROM memories WHERE id = ?1",
                    [first.id],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert!(invalidated.is_none());
    }

    #[test]
    fn about_entities_resolve_case_insensitively() {
        let (store, _dir) = open_store();
        let first = store
            .with_tx(|tx| {
                apply_fact(
                    tx,
                    &RememberInput {
                        content: "Met Sarah".into(),
                        about_entities: vec!["Sarah Chen".into()],
                        ..Default::default()
                    },
                    None,
                    "m",
                )
            })
            .unwrap();
        let second = store
            .with_tx(|tx| {
                apply_fact(
                    tx,
                    &RememberInput {
                        content: "Sarah pinged again".into(),
                        about_entities: vec!["sarah chen".into()],
                        ..Default::default()
                    },
                    None,
                    "m",
                )
            })
            .unwrap();
        assert_eq!(first.linked_entities, second.linked_entities);

        let entity_count: i64 = store
            .with_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(entity_count, 1);
    }

    #[test]
    fn entity_description_merge_keeps_existing() {
        let (store, _dir) = open_store();
        store
            .with_tx(|tx| {
                apply_entity(tx, "Acme Corp", EntityType::Organization, Some("a client"), None, "m")
            })
            .unwrap();
        let updated = store
            .with_tx(|tx| {
                apply_entity(tx, "Acme Corp", EntityType::Organization, Some("something else"), None, "m")
            })
            .unwrap();
        assert!(!updated.created);

        let description: String = store
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT description FROM entities WHERE id = ?1",
                    [updated.id],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(description, "a client");
    }

    #[test]
    fn relate_strengthens_in_place() {
        let (store, _dir) = open_store();
        let weak = store
            .with_tx(|tx| {
                apply_relation(
                    tx,
                    &RelateInput {
                        source: "Sarah Chen".into(),
                        target: "Acme Corp".into(),
                        relationship_type: "works_at".into(),
                        strength: 0.4,
                        valid_at: None,
                    },
                )
            })
            .unwrap();
        let strong = store
            .with_tx(|tx| {
                apply_relation(
                    tx,
                    &RelateInput {
                        source: "Sarah Chen".into(),
                        target: "Acme Corp".into(),
                        relationship_type: "works_at".into(),
                        strength: 0.8,
                        valid_at: None,
                    },
                )
            })
            .unwrap();
        assert_eq!(weak.id, strong.id);
        assert_eq!(strong.strength, 0.8);

        // Lower strength does not weaken the edge
        let unchanged = store
            .with_tx(|tx| {
                apply_relation(
                    tx,
                    &RelateInput {
                        source: "Sarah Chen".into(),
                        target: "Acme Corp".into(),
                        relationship_type: "works_at".into(),
                        strength: 0.2,
                        valid_at: None,
                    },
                )
            })
            .unwrap();
        assert_eq!(unchanged.strength, 0.8);
    }

    #[test]
    fn self_edges_are_rejected() {
        let (store, _dir) = open_store();
        let result = store.with_tx(|tx| {
            apply_relation(
                tx,
                &RelateInput {
                    source: "Sarah Chen".into(),
                    target: "sarah chen".into(),
                    relationship_type: "knows".into(),
                    strength: 0.5,
                    valid_at: None,
                },
            )
        });
        assert!(matches!(result, Err(MemoryError::InvalidInput(_))));
    }

    #[test]
    fn supersede_closes_and_replaces() {
        let (store, _dir) = open_store();
        let cutover: DateTime<Utc> = "2023-01-01T00:00:00Z".parse().unwrap();

        let original = store
            .with_tx(|tx| {
                apply_relation(
                    tx,
                    &RelateInput {
                        source: "Sarah Chen".into(),
                        target: "Acme Corp".into(),
                        relationship_type: "works_at".into(),
                        strength: 0.7,
                        valid_at: Some("2020-01-01T00:00:00Z".parse().unwrap()),
                    },
                )
            })
            .unwrap();

        let replacement = store
            .with_tx(|tx| {
                apply_supersede(
                    tx,
                    original.id,
                    &RelateInput {
                        source: "Sarah Chen".into(),
                        target: "Beta Industries".into(),
                        relationship_type: "works_at".into(),
                        strength: 0.8,
                        valid_at: Some(cutover),
                    },
                )
            })
            .unwrap();

        let old = store
            .with_read(|conn| fetch_relationship(conn, original.id))
            .unwrap();
        assert_eq!(old.invalid_at, Some(cutover));
        assert!(replacement.invalid_at.is_none());
        assert_eq!(replacement.strength, 0.8);
        assert_eq!(replacement.valid_at, cutover);
    }

    #[test]
    fn supersede_same_pair_keeps_one_current_row() {
        let (store, _dir) = open_store();
        let cutover: DateTime<Utc> = "2023-01-01T00:00:00Z".parse().unwrap();

        let original = store
            .with_tx(|tx| {
                apply_relation(
                    tx,
                    &RelateInput {
                        source: "A".into(),
                        target: "B".into(),
                        relationship_type: "works_at".into(),
                        strength: 0.7,
                        valid_at: Some("2020-01-01T00:00:00Z".parse().unwrap()),
                    },
                )
            })
            .unwrap();

        store
            .with_tx(|tx| {
                apply_supersede(
                    tx,
                    original.id,
                    &RelateInput {
                        source: "A".into(),
                        target: "B".into(),
                        relationship_type: "works_at".into(),
                        strength: 0.8,
                        valid_at: Some(cutover),
                    },
                )
            })
            .unwrap();

        let (rows, current): (i64, i64) = store
            .with_read(|conn| {
                Ok((
                    conn.query_row("SELECT COUNT(*) FROM relationships", [], |r| r.get(0))?,
                    conn.query_row(
                        "SELECT COUNT(*) FROM relationships WHERE invalid_at IS NULL",
                        [],
                        |r| r.get(0),
                    )?,
                ))
            })
            .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(current, 1);
    }

    #[test]
    fn ambiguous_names_error_with_candidates() {
        let (store, _dir) = open_store();
        store
            .with_tx(|tx| {
                apply_entity(tx, "Atlas", EntityType::Project, None, None, "m")?;
                apply_entity(tx, "Atlas", EntityType::Person, None, None, "m")
            })
            .unwrap();

        let result = store.with_read(|conn| resolve_entity_strict(conn, "atlas"));
        match result {
            Err(MemoryError::Ambiguous { candidates, .. }) => {
                assert_eq!(candidates.len(), 2)
            }
            other => panic!("expected Ambiguous, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn document_links_entities() {
        let (store, _dir) = open_store();
        let id = store
            .with_tx(|tx| {
                apply_document(
                    tx,
                    "email",
                    Some("intro.eml"),
                    "Hi, connecting you with Sarah Chen from Acme Corp.",
                    None,
                    &["Sarah Chen".into(), "Acme Corp".into()],
                )
            })
            .unwrap();

        let links: i64 = store
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM entity_documents WHERE document_id = ?1",
                    [id],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(links, 2);
    }

    #[test]
    fn rejects_out_of_range_importance() {
        let (store, _dir) = open_store();
        let result = store.with_tx(|tx| apply_fact(tx, &fact("x", 1.5), None, "m"));
        assert!(matches!(result, Err(MemoryError::InvalidInput(_))));
    }
}
