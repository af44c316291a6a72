//! Session buffer: per-session turn accumulation and episode creation.
//!
//! Turns buffer cheaply during a conversation; ending the session folds
//! them into an episode with a narrative plus any structured extractions,
//! all in one transaction. The narrative itself is stored as a recallable
//! memory so episodic context surfaces in semantic search.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::embed::{Embedder, Embedding};
use crate::error::{MemoryError, Result};
use crate::model::{EntityType, Episode, MemoryType, Turn};
use crate::services::reflect::{apply_reflection, ReflectionInput};
use crate::services::remember::{
    apply_entity, apply_fact, apply_relation, RelateInput, RememberInput,
};
use crate::services::{ChangeEvent, EventSender};
use crate::store::Store;

/// Importance assigned to episode narratives when stored as memories
const NARRATIVE_IMPORTANCE: f64 = 0.6;

// ============================================================================
// INPUTS / OUTPUTS
// ============================================================================

/// Receipt for one buffered turn
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReceipt {
    pub id: i64,
    /// Unsummarized turns now buffered for this session
    pub turn_count: i64,
    /// True once the buffer passes the soft cap; the host should summarize
    pub needs_summary: bool,
}

/// An entity extracted during a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntitySpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: EntityType,
    #[serde(default)]
    pub description: Option<String>,
}

/// Everything `end_session` persists
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionSummaryInput {
    pub session_id: String,
    pub narrative: String,
    #[serde(default)]
    pub facts: Vec<RememberInput>,
    #[serde(default)]
    pub entities: Vec<EntitySpec>,
    #[serde(default)]
    pub relationships: Vec<RelateInput>,
    #[serde(default)]
    pub reflections: Vec<ReflectionInput>,
}

/// A session with buffered turns but no episode yet
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsummarizedSession {
    pub session_id: String,
    pub turn_count: i64,
    pub first_turn_at: DateTime<Utc>,
    pub last_turn_at: DateTime<Utc>,
}

/// Result of ending a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeSummary {
    pub episode_id: i64,
    /// Memory id the narrative was stored under
    pub narrative_memory_id: i64,
    pub memories_stored: usize,
    pub entities_stored: usize,
    pub relationships_stored: usize,
    pub reflections_stored: usize,
    pub turns_summarized: usize,
}

/// Buffer one turn inside an open transaction.
pub fn apply_turn(
    conn: &rusqlite::Connection,
    session_id: &str,
    role: &str,
    content: &str,
    soft_cap: usize,
) -> Result<TurnReceipt> {
    if session_id.trim().is_empty() {
        return Err(MemoryError::InvalidInput("session id is empty".into()));
    }
    if content.is_empty() {
        return Err(MemoryError::InvalidInput("turn content is empty".into()));
    }

    conn.execute(
        "INSERT INTO messages (session_id, role, content, created_at, summarized)
         VALUES (?1, ?2, ?3, ?4, 0)",
        params![session_id, role, content, Utc::now()],
    )?;
    let id = conn.last_insert_rowid();
    let turn_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND summarized = 0",
        [session_id],
        |row| row.get(0),
    )?;
    Ok(TurnReceipt {
        id,
        turn_count,
        needs_summary: turn_count >= soft_cap as i64,
    })
}

// ============================================================================
// SERVICE
// ============================================================================

/// Per-session turn buffer and episode creator
pub struct SessionBuffer {
    store: Arc<Store>,
    embedder: Arc<Embedder>,
    config: Config,
    events: Option<EventSender>,
}

impl SessionBuffer {
    pub fn new(store: Arc<Store>, embedder: Arc<Embedder>, config: Config) -> Self {
        Self {
            store,
            embedder,
            config,
            events: None,
        }
    }

    /// Attach a change-event channel.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Append one turn to a session's buffer.
    pub fn buffer_turn(&self, session_id: &str, role: &str, content: &str) -> Result<TurnReceipt> {
        let soft_cap = self.config.limits.turn_soft_cap;
        self.store
            .with_tx(|tx| apply_turn(tx, session_id, role, content, soft_cap))
    }

    /// Buffered turns for one session, oldest first.
    pub fn turns(&self, session_id: &str) -> Result<Vec<Turn>> {
        self.store.with_read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY id ASC",
                Turn::COLUMNS
            ))?;
            let rows = stmt
                .query_map([session_id], Turn::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Sessions with at least one turn and no episode row: the recovery
    /// list after a crash or an abandoned conversation.
    pub fn unsummarized(&self) -> Result<Vec<UnsummarizedSession>> {
        self.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.session_id, COUNT(*), MIN(m.created_at), MAX(m.created_at)
                 FROM messages m
                 WHERE NOT EXISTS (SELECT 1 FROM episodes e WHERE e.session_id = m.session_id)
                 GROUP BY m.session_id
                 ORDER BY MAX(m.created_at) DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(UnsummarizedSession {
                        session_id: row.get(0)?,
                        turn_count: row.get(1)?,
                        first_turn_at: row.get(2)?,
                        last_turn_at: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// End a session: create the episode, persist the narrative as a
    /// recallable memory, store extractions and reflections, mark turns
    /// summarized. One transaction; embeddings are computed up front.
    pub async fn end_session(&self, input: SessionSummaryInput) -> Result<EpisodeSummary> {
        if input.session_id.trim().is_empty() {
            return Err(MemoryError::InvalidInput("session id is empty".into()));
        }
        if input.narrative.trim().is_empty() {
            return Err(MemoryError::InvalidInput("narrative is empty".into()));
        }

        // Embed outside the transaction; a down runtime degrades to None
        let narrative_embedding = self.embed_or_none(&input.narrative).await?;
        let mut fact_embeddings: Vec<Option<Embedding>> = Vec::with_capacity(input.facts.len());
        for fact in &input.facts {
            fact_embeddings.push(self.embed_or_none(&fact.content).await?);
        }
        let model = self.embedder.model().to_string();

        let summary = self.store.with_tx(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM episodes WHERE session_id = ?1",
                    [&input.session_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Err(MemoryError::InvalidInput(format!(
                    "session '{}' already summarized as episode {}",
                    input.session_id, id
                )));
            }

            let now = Utc::now();
            let started_at: Option<DateTime<Utc>> = tx
                .query_row(
                    "SELECT MIN(created_at) FROM messages WHERE session_id = ?1",
                    [&input.session_id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();

            tx.execute(
                "INSERT INTO episodes (session_id, narrative, started_at, ended_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![input.session_id, input.narrative, started_at, now],
            )?;
            let episode_id = tx.last_insert_rowid();

            // The narrative doubles as an episodic memory so recall finds it
            let narrative_outcome = apply_fact(
                tx,
                &RememberInput {
                    content: input.narrative.clone(),
                    memory_type: MemoryType::Observation,
                    importance: NARRATIVE_IMPORTANCE,
                    ..Default::default()
                },
                narrative_embedding.as_ref(),
                &model,
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO episode_memories (episode_id, memory_id) VALUES (?1, ?2)",
                params![episode_id, narrative_outcome.id],
            )?;

            let mut entities_stored = 0usize;
            for spec in &input.entities {
                apply_entity(
                    tx,
                    &spec.name,
                    spec.entity_type,
                    spec.description.as_deref(),
                    None,
                    &model,
                )?;
                entities_stored += 1;
            }

            let mut memories_stored = 0usize;
            for (fact, embedding) in input.facts.iter().zip(fact_embeddings.iter()) {
                let outcome = apply_fact(tx, fact, embedding.as_ref(), &model)?;
                tx.execute(
                    "INSERT OR IGNORE INTO episode_memories (episode_id, memory_id)
                     VALUES (?1, ?2)",
                    params![episode_id, outcome.id],
                )?;
                for entity_id in &outcome.linked_entities {
                    tx.execute(
                        "INSERT OR IGNORE INTO episode_entities (episode_id, entity_id)
                         VALUES (?1, ?2)",
                        params![episode_id, entity_id],
                    )?;
                }
                memories_stored += 1;
            }

            let mut relationships_stored = 0usize;
            for relate in &input.relationships {
                apply_relation(tx, relate)?;
                relationships_stored += 1;
            }

            let mut reflections_stored = 0usize;
            for reflection in &input.reflections {
                apply_reflection(tx, reflection)?;
                reflections_stored += 1;
            }

            let turns_summarized = tx.execute(
                "UPDATE messages SET summarized = 1 WHERE session_id = ?1 AND summarized = 0",
                [&input.session_id],
            )?;

            Ok(EpisodeSummary {
                episode_id,
                narrative_memory_id: narrative_outcome.id,
                memories_stored,
                entities_stored,
                relationships_stored,
                reflections_stored,
                turns_summarized,
            })
        })?;

        if let Some(tx) = &self.events {
            let _ = tx.send(ChangeEvent::EpisodeCreated {
                id: summary.episode_id,
            });
        }
        Ok(summary)
    }

    /// Look up an episode by session id.
    pub fn episode(&self, session_id: &str) -> Result<Option<Episode>> {
        self.store.with_read(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM episodes WHERE session_id = ?1",
                        Episode::COLUMNS
                    ),
                    [session_id],
                    Episode::from_row,
                )
                .optional()?)
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
    use crate::config::EmbedderConfig;
    use tempfile::TempDir;

    fn test_buffer() -> (SessionBuffer, Arc<Store>, TempDir) {
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
        let buffer = SessionBuffer::new(store.clone(), embedder, Config::from_env().unwrap());
        (buffer, store, dir)
    }

    fn summary(session_id: &str, narrative: &str) -> SessionSummaryInput {
        SessionSummaryInput {
            session_id: session_id.to_string(),
            narrative: narrative.to_string(),
            facts: vec![],
            entities: vec![],
            relationships: vec![],
            reflections: vec![],
        }
    }

    #[test]
    fn buffering_counts_turns() {
        let (buffer, _store, _dir) = test_buffer();
        let first = buffer.buffer_turn("s1", "user", "Hi").unwrap();
        let second = buffer.buffer_turn("s1", "assistant", "Hello").unwrap();
        assert_eq!(first.turn_count, 1);
        assert_eq!(second.turn_count, 2);
        assert!(!second.needs_summary);

        let turns = buffer.turns("s1").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert!(!turns[0].summarized);
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let (buffer, _store, _dir) = test_buffer();
        buffer.buffer_turn("s1", "user", "Hi").unwrap();
        buffer.buffer_turn("s1", "assistant", "Hello").unwrap();
        buffer.buffer_turn("s2", "user", "Other session").unwrap();

        let pending = buffer.unsummarized().unwrap();
        assert_eq!(pending.len(), 2);

        let result = buffer
            .end_session(summary("s1", "Greeted the user."))
            .await
            .unwrap();
        assert_eq!(result.turns_summarized, 2);

        // s1 is summarized, s2 still pending
        let pending = buffer.unsummarized().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].session_id, "s2");

        let episode = buffer.episode("s1").unwrap().unwrap();
        assert_eq!(episode.narrative, "Greeted the user.");
        assert!(episode.started_at.is_some());
    }

    #[tokio::test]
    async fn narrative_is_recallable_via_keyword_search() {
        let (buffer, store, _dir) = test_buffer();
        buffer.buffer_turn("s1", "user", "Hi").unwrap();
        buffer
            .end_session(summary("s1", "Greeted the user and set up the workspace."))
            .await
            .unwrap();

        let recall = crate::services::recall::RecallService::new(
            store,
            Arc::new(
                Embedder::new(&EmbedderConfig {
                    endpoint: "http://127.0.0.1:1".to_string(),
                    model: "all-minilm".to_string(),
                    dimensions: 384,
                    timeout: std::time::Duration::from_millis(100),
                })
                .unwrap(),
            ),
            Config::from_env().unwrap(),
        );
        let hits = recall.recall("greeted", 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].memory.content.contains("Greeted"));
    }

    #[tokio::test]
    async fn end_session_persists_extractions() {
        let (buffer, store, _dir) = test_buffer();
        buffer.buffer_turn("s1", "user", "Tell you about Sarah").unwrap();

        let input = SessionSummaryInput {
            session_id: "s1".into(),
            narrative: "Talked about Sarah's new role.".into(),
            facts: vec![RememberInput {
                content: "Sarah Chen now leads platform".into(),
                importance: 0.8,
                about_entities: vec!["Sarah Chen".into()],
                ..Default::default()
            }],
            entities: vec![EntitySpec {
                name: "Sarah Chen".into(),
                entity_type: EntityType::Person,
                description: Some("platform lead".into()),
            }],
            relationships: vec![RelateInput {
                source: "Sarah Chen".into(),
                target: "Acme Corp".into(),
                relationship_type: "works_at".into(),
                strength: 0.9,
                valid_at: None,
            }],
            reflections: vec![ReflectionInput {
                reflection_type: crate::model::ReflectionType::Observation,
                content: "User cares about org changes".into(),
                about_entity: None,
                importance: 0.7,
                confidence: 0.8,
                decay_rate: 0.999,
            }],
        };
        let result = buffer.end_session(input).await.unwrap();
        assert_eq!(result.memories_stored, 1);
        assert_eq!(result.entities_stored, 1);
        assert_eq!(result.relationships_stored, 1);
        assert_eq!(result.reflections_stored, 1);

        let (episode_memories, reflections): (i64, i64) = store
            .with_read(|conn| {
                Ok((
                    conn.query_row("SELECT COUNT(*) FROM episode_memories", [], |r| r.get(0))?,
                    conn.query_row("SELECT COUNT(*) FROM reflections", [], |r| r.get(0))?,
                ))
            })
            .unwrap();
        // Narrative memory plus the extracted fact
        assert_eq!(episode_memories, 2);
        assert_eq!(reflections, 1);
    }

    #[tokio::test]
    async fn ending_twice_is_rejected() {
        let (buffer, _store, _dir) = test_buffer();
        buffer.buffer_turn("s1", "user", "Hi").unwrap();
        buffer.end_session(summary("s1", "Done.")).await.unwrap();
        let again = buffer.end_session(summary("s1", "Done again.")).await;
        assert!(matches!(again, Err(MemoryError::InvalidInput(_))));
    }

    #[test]
    fn soft_cap_requests_summary() {
        let (mut buffer, _store, _dir) = test_buffer();
        buffer.config.limits.turn_soft_cap = 3;
        buffer.buffer_turn("s1", "user", "one").unwrap();
        buffer.buffer_turn("s1", "user", "two").unwrap();
        let third = buffer.buffer_turn("s1", "user", "three").unwrap();
        assert!(third.needs_summary);
    }
}
