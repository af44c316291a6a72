//! Recall service: semantic + keyword search with multi-factor ranking,
//! entity context, and provenance tracing.
//!
//! The composite score is `0.60 * similarity + 0.30 * importance +
//! 0.10 * recency`, with `recency = exp(-age_days / 30)` over last access.
//! Every returned memory gets the rehearsal effect: a small monotonic
//! importance boost plus access bookkeeping, batched into one write.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::embed::{cosine_similarity, Embedder, Embedding};
use crate::error::{MemoryError, Result};
use crate::model::{
    Document, Entity, EntityRef, EntityType, Episode, Memory, MemoryType, Relationship,
    VerificationStatus,
};
use crate::services::remember::entities_matching;
use crate::store::Store;

/// Query embeddings worth keeping around between recalls
const QUERY_CACHE_SIZE: usize = 100;

// ============================================================================
// INPUTS / OUTPUTS
// ============================================================================

/// Optional constraints on recall candidates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecallFilter {
    /// Restrict to one memory type
    #[serde(rename = "type", default)]
    pub memory_type: Option<MemoryType>,
    /// Restrict to memories linked to this entity (name or alias)
    #[serde(default)]
    pub entity: Option<String>,
    /// Only memories created at or after this instant
    #[serde(default)]
    pub created_after: Option<chrono::DateTime<Utc>>,
    /// Only memories created at or before this instant
    #[serde(default)]
    pub created_before: Option<chrono::DateTime<Utc>>,
}

/// One ranked recall result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallHit {
    #[serde(flatten)]
    pub memory: Memory,
    /// Cosine similarity (semantic) or normalized keyword rank (fallback)
    pub similarity: f64,
    /// Composite ranking score
    pub score: f64,
}

/// A relationship as seen from one entity
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipView {
    #[serde(flatten)]
    pub relationship: Relationship,
    /// Canonical name of the entity on the other end
    pub other_entity: String,
    /// "outbound" when the queried entity is the source, else "inbound"
    pub perspective: String,
}

/// Everything known about one entity
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutReport {
    pub entity: Entity,
    /// True when the name matched more than one entity
    pub ambiguous: bool,
    /// The losing candidates when ambiguous
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<EntityRef>,
    pub aliases: Vec<String>,
    /// Memories about this entity, importance-descending
    pub memories: Vec<Memory>,
    /// Currently-valid relationships, strength-descending
    pub relationships: Vec<RelationshipView>,
    pub documents: Vec<Document>,
}

/// Provenance chain of one memory
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceReport {
    pub memory: Memory,
    pub verification_status: VerificationStatus,
    /// Episodes this memory was created in or linked to
    pub episodes: Vec<Episode>,
    /// Entities this memory is about
    pub entities: Vec<EntityRef>,
    /// Source documents filed for those entities
    pub documents: Vec<Document>,
}

// ============================================================================
// SERVICE
// ============================================================================

/// Search service over the memory store
pub struct RecallService {
    store: Arc<Store>,
    embedder: Arc<Embedder>,
    config: Config,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl RecallService {
    pub fn new(store: Arc<Store>, embedder: Arc<Embedder>, config: Config) -> Self {
        let capacity = NonZeroUsize::new(QUERY_CACHE_SIZE).expect("cache size is non-zero");
        Self {
            store,
            embedder,
            config,
            query_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Semantic search with keyword fallback. Applies the rehearsal effect
    /// to every returned memory.
    pub async fn recall(
        &self,
        query: &str,
        limit: usize,
        filter: Option<RecallFilter>,
    ) -> Result<Vec<RecallHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MemoryError::InvalidInput("query is empty".into()));
        }
        let limit = limit.max(1);
        let filter = filter.unwrap_or_default();

        match self.query_embedding(query).await? {
            Some(vector) => self.recall_with_vector(&vector, limit, &filter),
            None => self.recall_keyword(query, limit, &filter),
        }
    }

    /// Fetch (or cache) the query embedding; `None` when the runtime is down.
    async fn query_embedding(&self, query: &str) -> Result<Option<Vec<f32>>> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(hit) = cache.get(query) {
                return Ok(Some(hit.clone()));
            }
        }
        match self.embedder.embed(query).await {
            Ok(Embedding { vector, .. }) => {
                if let Ok(mut cache) = self.query_cache.lock() {
                    cache.put(query.to_string(), vector.clone());
                }
                Ok(Some(vector))
            }
            Err(e @ MemoryError::SchemaMismatch { .. }) => Err(e),
            Err(e) => {
                tracing::debug!("keyword fallback: {}", e);
                Ok(None)
            }
        }
    }

    /// Rank candidates against an already-computed query vector.
    pub fn recall_with_vector(
        &self,
        query_vector: &[f32],
        limit: usize,
        filter: &RecallFilter,
    ) -> Result<Vec<RecallHit>> {
        let top_k = limit * self.config.recall.top_k_multiplier.max(1);

        let mut candidates = self.store.with_read(|conn| {
            let (where_clause, entity_ids) = self.filter_clause(conn, filter)?;
            if filter.entity.is_some() && entity_ids.as_ref().is_some_and(|ids| ids.is_empty()) {
                return Ok(Vec::new());
            }

            let sql = format!(
                "SELECT {cols}, e.embedding FROM memories m
                 JOIN memory_embeddings e ON e.memory_id = m.id
                 WHERE m.invalidated_at IS NULL{where_clause}",
                cols = columns_prefixed("m"),
                where_clause = where_clause,
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| {
                    let memory = Memory::from_row(row)?;
                    let blob: Vec<u8> = row.get(15)?;
                    Ok((memory, blob))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut scored: Vec<(Memory, f64)> = rows
                .into_iter()
                .filter_map(|(memory, blob)| {
                    let embedding = Embedding::from_bytes(&blob)?;
                    if embedding.dimensions != query_vector.len() {
                        return None;
                    }
                    let similarity =
                        cosine_similarity(query_vector, &embedding.vector) as f64;
                    Some((memory, similarity))
                })
                .collect();

            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(top_k);
            Ok(scored)
        })?;

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let hits = self.rank(&mut candidates, limit);
        self.rehearse(hits)
    }

    /// FTS5 keyword path used when the embedder is down.
    fn recall_keyword(
        &self,
        query: &str,
        limit: usize,
        filter: &RecallFilter,
    ) -> Result<Vec<RecallHit>> {
        let top_k = limit * self.config.recall.top_k_multiplier.max(1);
        let match_expr = sanitize_fts_query(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = self.store.with_read(|conn| {
            let (where_clause, entity_ids) = self.filter_clause(conn, filter)?;
            if filter.entity.is_some() && entity_ids.as_ref().is_some_and(|ids| ids.is_empty()) {
                return Ok(Vec::new());
            }

            let sql = format!(
                "SELECT {cols}, bm25(memories_fts) AS rank
                 FROM memories_fts
                 JOIN memories m ON m.id = memories_fts.rowid
                 WHERE memories_fts MATCH ?1 AND m.invalidated_at IS NULL{where_clause}
                 ORDER BY rank
                 LIMIT {top_k}",
                cols = columns_prefixed("m"),
                where_clause = where_clause,
                top_k = top_k,
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([&match_expr], |row| {
                    let memory = Memory::from_row(row)?;
                    let rank: f64 = row.get(15)?;
                    Ok((memory, rank))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // bm25 ranks are smaller-is-better; normalize into a [0, 1]
        // similarity stand-in so the composite weights still apply
        let best = candidates
            .iter()
            .map(|(_, rank)| -rank)
            .fold(f64::MIN, f64::max)
            .max(0.001);
        for (_, rank) in candidates.iter_mut() {
            *rank = (-*rank / best).clamp(0.0, 1.0);
        }

        let hits = self.rank(&mut candidates, limit);
        self.rehearse(hits)
    }

    /// Extra WHERE conditions for a filter, plus resolved entity ids when an
    /// entity constraint is present.
    fn filter_clause(
        &self,
        conn: &Connection,
        filter: &RecallFilter,
    ) -> Result<(String, Option<Vec<i64>>)> {
        let mut clause = String::new();
        if let Some(memory_type) = filter.memory_type {
            clause.push_str(&format!(" AND m.type = '{}'", memory_type.as_str()));
        }
        if let Some(after) = filter.created_after {
            clause.push_str(&format!(" AND m.created_at >= '{}'", after.to_rfc3339()));
        }
        if let Some(before) = filter.created_before {
            clause.push_str(&format!(" AND m.created_at <= '{}'", before.to_rfc3339()));
        }

        let entity_ids = match &filter.entity {
            Some(name) => {
                let ids: Vec<i64> = entities_matching(conn, name)?
                    .into_iter()
                    .map(|e| e.id)
                    .collect();
                if !ids.is_empty() {
                    let list = ids
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    clause.push_str(&format!(
                        " AND m.id IN (SELECT memory_id FROM memory_entities WHERE entity_id IN ({}))",
                        list
                    ));
                }
                Some(ids)
            }
            None => None,
        };

        Ok((clause, entity_ids))
    }

    /// Composite scoring and tie-breaking over (memory, similarity) pairs.
    fn rank(&self, candidates: &mut Vec<(Memory, f64)>, limit: usize) -> Vec<RecallHit> {
        let weights = &self.config.recall;
        let now = Utc::now();

        let mut hits: Vec<RecallHit> = candidates
            .drain(..)
            .map(|(memory, similarity)| {
                let age_days =
                    (now - memory.last_accessed).num_seconds().max(0) as f64 / 86_400.0;
                let recency = (-age_days / weights.recency_window_days).exp();
                let score = weights.similarity_weight * similarity
                    + weights.importance_weight * memory.importance
                    + weights.recency_weight * recency;
                RecallHit {
                    memory,
                    similarity,
                    score,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.memory
                        .confidence
                        .partial_cmp(&a.memory.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.memory.updated_at.cmp(&a.memory.updated_at))
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
        hits.truncate(limit);
        hits
    }

    /// Rehearsal effect: boost importance, bump access bookkeeping, one
    /// batched write. Monotonic: importance never decreases here.
    fn rehearse(&self, mut hits: Vec<RecallHit>) -> Result<Vec<RecallHit>> {
        if hits.is_empty() {
            return Ok(hits);
        }
        let boost = self.config.recall.rehearsal_boost;
        let now = Utc::now();

        self.store.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE memories
                 SET importance = MIN(1.0, importance * ?2),
                     last_accessed = ?3,
                     access_count = access_count + 1
                 WHERE id = ?1",
            )?;
            for hit in &hits {
                stmt.execute(params![hit.memory.id, boost, now])?;
            }
            Ok(())
        })?;

        for hit in &mut hits {
            hit.memory.importance = (hit.memory.importance * boost).min(1.0);
            hit.memory.last_accessed = now;
            hit.memory.access_count += 1;
        }
        Ok(hits)
    }

    /// Full context for one entity, resolved case-insensitively across
    /// canonical names and aliases. Ambiguity returns the top-importance
    /// match plus the alternatives.
    pub fn about(&self, name: &str) -> Result<AboutReport> {
        self.store.with_read(|conn| {
            let mut matches = entities_matching(conn, name)?;
            if matches.is_empty() {
                return Err(MemoryError::NotFound(format!("entity '{}'", name)));
            }
            let entity = matches.remove(0);
            let ambiguous = !matches.is_empty();
            let alternatives = matches
                .into_iter()
                .map(|e| EntityRef {
                    id: e.id,
                    name: e.name,
                    entity_type: e.entity_type,
                    importance: e.importance,
                })
                .collect();

            let aliases = {
                let mut stmt =
                    conn.prepare("SELECT alias FROM entity_aliases WHERE entity_id = ?1")?;
                let rows = stmt
                    .query_map([entity.id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows
            };

            let memories = {
                let sql = format!(
                    "SELECT {} FROM memories m
                     JOIN memory_entities me ON me.memory_id = m.id
                     WHERE me.entity_id = ?1 AND m.invalidated_at IS NULL
                     ORDER BY m.importance DESC, m.id ASC",
                    columns_prefixed("m")
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([entity.id], Memory::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let relationships = {
                let sql = format!(
                    "SELECT {cols}, se.name, te.name FROM relationships r
                     JOIN entities se ON se.id = r.source_entity_id
                     JOIN entities te ON te.id = r.target_entity_id
                     WHERE (r.source_entity_id = ?1 OR r.target_entity_id = ?1)
                       AND r.invalid_at IS NULL
                     ORDER BY r.strength DESC, r.id ASC",
                    cols = Relationship::COLUMNS
                        .split(", ")
                        .map(|c| format!("r.{}", c))
                        .collect::<Vec<_>>()
                        .join(", "),
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([entity.id], |row| {
                        let relationship = Relationship::from_row(row)?;
                        let source_name: String = row.get(10)?;
                        let target_name: String = row.get(11)?;
                        Ok((relationship, source_name, target_name))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter()
                    .map(|(relationship, source_name, target_name)| {
                        let outbound = relationship.source_entity_id == entity.id;
                        RelationshipView {
                            other_entity: if outbound { target_name } else { source_name },
                            perspective: if outbound { "outbound" } else { "inbound" }.to_string(),
                            relationship,
                        }
                    })
                    .collect()
            };

            let documents = {
                let sql = format!(
                    "SELECT {} FROM documents d
                     JOIN entity_documents ed ON ed.document_id = d.id
                     WHERE ed.entity_id = ?1
                     ORDER BY d.created_at DESC",
                    columns_prefixed_for("d", Document::COLUMNS)
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([entity.id], Document::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            Ok(AboutReport {
                entity,
                ambiguous,
                alternatives,
                aliases,
                memories,
                relationships,
                documents,
            })
        })
    }

    /// Prefix-first fuzzy entity search over names and aliases.
    pub fn search_entities(
        &self,
        query: &str,
        types: Option<&[EntityType]>,
        limit: usize,
    ) -> Result<Vec<EntityRef>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let escaped = needle.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let prefix = format!("{}%", escaped);
        let substring = format!("%{}%", escaped);
        let limit = limit.clamp(1, 100);

        let type_clause = match types {
            Some(types) if !types.is_empty() => {
                let list = types
                    .iter()
                    .map(|t| format!("'{}'", t.as_str()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(" AND e.type IN ({})", list)
            }
            _ => String::new(),
        };

        self.store.with_read(|conn| {
            let sql = format!(
                "SELECT e.id, e.name, e.type, e.importance FROM entities e
                 WHERE e.deleted_at IS NULL{type_clause}
                   AND (lower(e.name) LIKE ?2 ESCAPE '\\'
                        OR EXISTS (SELECT 1 FROM entity_aliases a
                                   WHERE a.entity_id = e.id
                                     AND lower(a.alias) LIKE ?2 ESCAPE '\\'))
                 ORDER BY CASE WHEN lower(e.name) LIKE ?1 ESCAPE '\\' THEN 0 ELSE 1 END,
                          e.importance DESC, e.id ASC
                 LIMIT {limit}",
                type_clause = type_clause,
                limit = limit,
            );
            let mut stmt = conn.prepare(&sql)?;
            let found = stmt
                .query_map(params![prefix, substring], |row| {
                    Ok(EntityRef {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        entity_type: EntityType::parse_name(&row.get::<_, String>(2)?),
                        importance: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(found)
        })
    }

    /// Provenance chain: memory, episodes, linked entities, their source
    /// documents, verification status.
    pub fn trace(&self, memory_id: i64) -> Result<TraceReport> {
        self.store.with_read(|conn| {
            let memory = conn
                .query_row(
                    &format!("SELECT {} FROM memories WHERE id = ?1", Memory::COLUMNS),
                    [memory_id],
                    Memory::from_row,
                )
                .optional()?
                .ok_or_else(|| MemoryError::NotFound(format!("memory {}", memory_id)))?;

            let episodes = {
                let sql = format!(
                    "SELECT {} FROM episodes ep
                     JOIN episode_memories em ON em.episode_id = ep.id
                     WHERE em.memory_id = ?1
                     ORDER BY ep.ended_at DESC",
                    columns_prefixed_for("ep", Episode::COLUMNS)
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([memory_id], Episode::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let entities = {
                let mut stmt = conn.prepare(
                    "SELECT e.id, e.name, e.type, e.importance FROM entities e
                     JOIN memory_entities me ON me.entity_id = e.id
                     WHERE me.memory_id = ?1
                     ORDER BY e.importance DESC",
                )?;
                let rows = stmt
                    .query_map([memory_id], |row| {
                        Ok(EntityRef {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            entity_type: EntityType::parse_name(&row.get::<_, String>(2)?),
                            importance: row.get(3)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let documents = {
                let sql = format!(
                    "SELECT DISTINCT {} FROM documents d
                     JOIN entity_documents ed ON ed.document_id = d.id
                     JOIN memory_entities me ON me.entity_id = ed.entity_id
                     WHERE me.memory_id = ?1
                     ORDER BY d.created_at DESC",
                    columns_prefixed_for("d", Document::COLUMNS)
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([memory_id], Document::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            Ok(TraceReport {
                verification_status: memory.verification_status,
                memory,
                episodes,
                entities,
                documents,
            })
        })
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn columns_prefixed(alias: &str) -> String {
    columns_prefixed_for(alias, Memory::COLUMNS)
}

fn columns_prefixed_for(alias: &str, columns: &str) -> String {
    columns
        .split(", ")
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reduce arbitrary user text to a safe FTS5 MATCH expression: bare quoted
/// terms OR-ed together.
fn sanitize_fts_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{}\"", token))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============================================================================
// TESTS
// ============================================================================
