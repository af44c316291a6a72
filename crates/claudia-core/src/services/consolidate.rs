//! Consolidation service: importance decay, similarity merging, pattern
//! detection, and embedding backfill.
//!
//! Long passes work in bounded batches and release the write lock between
//! them so tool requests are never starved. Failures inside a scheduled run
//! are logged by the scheduler, never fatal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use regex::Regex;
use rusqlite::params;
use serde::Serialize;

use crate::config::Config;
use crate::embed::{cosine_similarity, Embedder, Embedding};
use crate::error::{MemoryError, Result};
use crate::model::PatternType;
use crate::store::Store;

/// Summary of one full consolidation run
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    /// Memories and reflections whose importance decayed
    pub decayed: u64,
    /// Memories absorbed into a merge survivor
    pub merged: u64,
    /// Patterns created or re-confirmed
    pub patterns_detected: u64,
    /// Memories that received a backfilled embedding
    pub reembedded: u64,
    pub duration_ms: u64,
}

/// Background maintenance over the memory store
pub struct ConsolidateService {
    store: Arc<Store>,
    embedder: Arc<Embedder>,
    config: Config,
}

impl ConsolidateService {
    pub fn new(store: Arc<Store>, embedder: Arc<Embedder>, config: Config) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    // ========================================================================
    // DECAY
    // ========================================================================

    /// Apply importance decay to memories older than one day and to
    /// reflections. Memory decay is anchored on `updated_at` so a missed
    /// night catches up in one run; the row's `updated_at` moves forward
    /// with each application. Importance is floored, never zeroed.
    pub fn decay(&self) -> Result<u64> {
        let decayed_memories = self.decay_memories()?;
        let decayed_reflections = self.decay_reflections()?;
        tracing::info!(
            memories = decayed_memories,
            reflections = decayed_reflections,
            "decay pass complete"
        );
        Ok(decayed_memories + decayed_reflections)
    }

    fn decay_memories(&self) -> Result<u64> {
        let rate = self.config.consolidation.memory_decay_rate;
        let floor = self.config.consolidation.importance_floor;
        let batch = self.config.consolidation.batch_size;
        let mut total = 0u64;

        loop {
            let now = Utc::now();
            let candidates: Vec<(i64, f64, DateTime<Utc>)> = self.store.with_read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, importance, updated_at FROM memories
                     WHERE invalidated_at IS NULL
                       AND importance > ?1
                       AND updated_at <= datetime('now', '-1 day')
                     ORDER BY id
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![floor, batch as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })?;

            if candidates.is_empty() {
                break;
            }
            let count = candidates.len();

            self.store.with_tx(|tx| {
                let mut stmt = tx.prepare(
                    "UPDATE memories SET importance = ?2, updated_at = ?3 WHERE id = ?1",
                )?;
                for (id, importance, updated_at) in &candidates {
                    let age_days = (now - *updated_at).num_seconds().max(0) as f64 / 86_400.0;
                    let decayed = (importance * rate.powf(age_days)).max(floor);
                    stmt.execute(params![id, decayed, now])?;
                }
                Ok(())
            })?;

            total += count as u64;
            if count < batch {
                break;
            }
        }

        Ok(total)
    }

    /// Reflections decay far slower, one day's worth per daily run, using
    /// each row's own decay rate.
    fn decay_reflections(&self) -> Result<u64> {
        let floor = self.config.consolidation.importance_floor;
        let changed = self.store.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE reflections
                 SET importance = MAX(?1, importance * decay_rate)
                 WHERE importance > ?1
                   AND last_confirmed_at <= datetime('now', '-1 day')",
                params![floor],
            )?;
            Ok(changed as u64)
        })?;
        Ok(changed)
    }

    // ========================================================================
    // MERGE
    // ========================================================================

    /// Merge clusters of near-duplicate memories: pairwise embedding
    /// similarity above the threshold *and* at least one shared entity link.
    /// The highest-importance row survives; the rest are invalidated with a
    /// pointer to the survivor and their contents appended to its
    /// `aggregated_from` list.
    pub fn merge(&self) -> Result<u64> {
        let threshold = self.config.consolidation.merge_threshold;

        struct Candidate {
            id: i64,
            content: String,
            importance: f64,
            access_count: i64,
            aggregated_from: Vec<String>,
            vector: Vec<f32>,
        }

        let (candidates, entity_links) = self.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.content, m.importance, m.access_count, m.aggregated_from,
                        e.embedding
                 FROM memories m
                 JOIN memory_embeddings e ON e.memory_id = m.id
                 WHERE m.invalidated_at IS NULL",
            )?;
            let candidates = stmt
                .query_map([], |row| {
                    let aggregated_raw: String = row.get(4)?;
                    let blob: Vec<u8> = row.get(5)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                        aggregated_raw,
                        blob,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .filter_map(|(id, content, importance, access_count, aggregated_raw, blob)| {
                    let embedding = Embedding::from_bytes(&blob)?;
                    Some(Candidate {
                        id,
                        content,
                        importance,
                        access_count,
                        aggregated_from: serde_json::from_str(&aggregated_raw)
                            .unwrap_or_default(),
                        vector: embedding.vector,
                    })
                })
                .collect::<Vec<_>>();

            let mut stmt =
                conn.prepare("SELECT entity_id, memory_id FROM memory_entities")?;
            let mut entity_links: HashMap<i64, Vec<i64>> = HashMap::new();
            for row in stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })? {
                let (entity_id, memory_id) = row?;
                entity_links.entry(entity_id).or_default().push(memory_id);
            }

            Ok((candidates, entity_links))
        })?;

        if candidates.len() < 2 {
            return Ok(0);
        }

        let by_id: HashMap<i64, usize> = candidates
            .iter()
            .enumerate()
            .map(|(index, c)| (c.id, index))
            .collect();

        // Only memories sharing an entity can merge, so candidate pairs come
        // from per-entity groups rather than the full cross product.
        let mut pairs: HashSet<(usize, usize)> = HashSet::new();
        for members in entity_links.values() {
            for (i, a) in members.iter().enumerate() {
                for b in members.iter().skip(i + 1) {
                    if let (Some(&ai), Some(&bi)) = (by_id.get(a), by_id.get(b)) {
                        pairs.insert((ai.min(bi), ai.max(bi)));
                    }
                }
            }
        }

        // Union-find over similar pairs
        let mut parent: Vec<usize> = (0..candidates.len()).collect();
        fn find(parent: &mut Vec<usize>, x: usize) -> usize {
            if parent[x] != x {
                let root = find(parent, parent[x]);
                parent[x] = root;
            }
            parent[x]
        }

        for (a, b) in pairs {
            let similarity =
                cosine_similarity(&candidates[a].vector, &candidates[b].vector) as f64;
            if similarity > threshold {
                let ra = find(&mut parent, a);
                let rb = find(&mut parent, b);
                if ra != rb {
                    parent[ra] = rb;
                }
            }
        }

        let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
        for index in 0..candidates.len() {
            let root = find(&mut parent, index);
            clusters.entry(root).or_default().push(index);
        }

        let mut merged = 0u64;
        let now = Utc::now();
        for members in clusters.values() {
            if members.len() < 2 {
                continue;
            }
            let survivor = *members
                .iter()
                .max_by(|a, b| {
                    candidates[**a]
                        .importance
                        .partial_cmp(&candidates[**b].importance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| candidates[**b].id.cmp(&candidates[**a].id))
                })
                .expect("cluster is non-empty");

            let survivor_id = candidates[survivor].id;
            let mut aggregated = candidates[survivor].aggregated_from.clone();
            let mut absorbed_access = 0i64;
            let absorbed: Vec<i64> = members
                .iter()
                .filter(|&&m| m != survivor)
                .map(|&m| {
                    aggregated.push(candidates[m].content.clone());
                    absorbed_access += candidates[m].access_count;
                    candidates[m].id
                })
                .collect();

            self.store.with_tx(|tx| {
                tx.execute(
                    "UPDATE memories
                     SET aggregated_from = ?2, access_count = access_count + ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![
                        survivor_id,
                        serde_json::to_string(&aggregated)
                            .map_err(|e| MemoryError::Internal(e.to_string()))?,
                        absorbed_access,
                        now,
                    ],
                )?;
                let mut stmt = tx.prepare(
                    "UPDATE memories SET invalidated_at = ?2, superseded_by = ?3 WHERE id = ?1",
                )?;
                for id in &absorbed {
                    stmt.execute(params![id, now, survivor_id])?;
                }
                Ok(())
            })?;

            merged += absorbed.len() as u64;
            tracing::debug!(
                survivor = survivor_id,
                absorbed = absorbed.len(),
                "merged memory cluster"
            );
        }

        Ok(merged)
    }

    // ========================================================================
    // PATTERN DETECTION
    // ========================================================================

    /// Scan for cooling entities, overdue commitments, and repeated
    /// observations. Each finding upserts a pattern row keyed by
    /// (pattern_type, name); re-confirmation bumps `aggregation_count`.
    pub fn detect_patterns(&self) -> Result<u64> {
        let mut detected = 0u64;
        detected += self.detect_cooling()?;
        detected += self.detect_overdue_commitments()?;
        detected += self.detect_communication_style()?;
        tracing::info!(detected, "pattern detection complete");
        Ok(detected)
    }

    fn upsert_pattern(
        &self,
        pattern_type: PatternType,
        name: &str,
        description: Option<&str>,
        confidence: f64,
        entity_id: Option<i64>,
    ) -> Result<()> {
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO patterns
                 (pattern_type, name, description, confidence, entity_id,
                  first_observed_at, last_confirmed_at, aggregation_count, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1, 1)
                 ON CONFLICT(pattern_type, name) DO UPDATE SET
                     last_confirmed_at = excluded.last_confirmed_at,
                     confidence = MAX(confidence, excluded.confidence),
                     aggregation_count = aggregation_count + 1,
                     is_active = 1",
                params![
                    pattern_type.as_str(),
                    name,
                    description,
                    confidence,
                    entity_id,
                    Utc::now(),
                ],
            )?;
            Ok(())
        })
    }

    /// Important entities whose most recent memory is old: the relationship
    /// is cooling.
    fn detect_cooling(&self) -> Result<u64> {
        let threshold = self.config.consolidation.cooling_importance;
        let horizon = self.config.consolidation.cooling_days;

        let cooling: Vec<(i64, String)> = self.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.name FROM entities e
                 WHERE e.deleted_at IS NULL AND e.importance >= ?1
                   AND EXISTS (SELECT 1 FROM memory_entities me WHERE me.entity_id = e.id)
                 GROUP BY e.id
                 HAVING (SELECT MAX(m.created_at) FROM memories m
                         JOIN memory_entities me ON me.memory_id = m.id
                         WHERE me.entity_id = e.id AND m.invalidated_at IS NULL)
                        <= datetime('now', ?2)",
            )?;
            let rows = stmt
                .query_map(
                    params![threshold, format!("-{} days", horizon)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let count = cooling.len() as u64;
        for (entity_id, name) in cooling {
            self.upsert_pattern(
                PatternType::Relationship,
                &format!("Contact with {} is cooling", name),
                Some(&format!(
                    "No new memory about {} in over {} days",
                    name, horizon
                )),
                0.6,
                Some(entity_id),
            )?;
        }
        Ok(count)
    }

    /// Commitments whose parsed deadline has passed.
    fn detect_overdue_commitments(&self) -> Result<u64> {
        let commitments: Vec<(i64, String)> = self.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content FROM memories
                 WHERE invalidated_at IS NULL AND type = 'commitment'",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let now = Utc::now();
        let mut count = 0u64;
        for (id, content) in commitments {
            let Some(deadline) = parse_deadline(&content, now) else {
                continue;
            };
            if deadline >= now {
                continue;
            }
            let label: String = content.chars().take(80).collect();
            self.upsert_pattern(
                PatternType::Behavioral,
                &format!("Overdue commitment: {}", label),
                Some(&format!(
                    "Memory {} has a deadline of {} in the past",
                    id,
                    deadline.format("%Y-%m-%d")
                )),
                0.8,
                None,
            )?;
            count += 1;
        }
        Ok(count)
    }

    /// Repeated observations about one entity inside the window collapse
    /// into a single communication-style pattern.
    fn detect_communication_style(&self) -> Result<u64> {
        let window = self.config.consolidation.observation_window_days;
        let minimum = self.config.consolidation.observation_min_count;

        let repeated: Vec<(i64, String, i64)> = self.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.name, COUNT(*) AS n FROM memories m
                 JOIN memory_entities me ON me.memory_id = m.id
                 JOIN entities e ON e.id = me.entity_id
                 WHERE m.invalidated_at IS NULL AND m.type = 'observation'
                   AND m.created_at >= datetime('now', ?1)
                   AND e.deleted_at IS NULL
                 GROUP BY e.id
                 HAVING n >= ?2",
            )?;
            let rows = stmt
                .query_map(
                    params![format!("-{} days", window), minimum],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let count = repeated.len() as u64;
        for (entity_id, name, observations) in repeated {
            self.upsert_pattern(
                PatternType::Communication,
                &format!("Recurring observations about {}", name),
                Some(&format!(
                    "{} observations within {} days",
                    observations, window
                )),
                0.7,
                Some(entity_id),
            )?;
        }
        Ok(count)
    }

    // ========================================================================
    // EMBEDDING BACKFILL
    // ========================================================================

    /// Embed memories persisted while the runtime was down. Stops quietly
    /// when the runtime is still unavailable.
    pub async fn reembed_missing(&self) -> Result<u64> {
        let batch = self.config.consolidation.batch_size;
        let pending: Vec<(i64, String)> = self.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content FROM memories
                 WHERE invalidated_at IS NULL
                   AND id NOT IN (SELECT memory_id FROM memory_embeddings)
                 ORDER BY importance DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([batch as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        if pending.is_empty() {
            return Ok(0);
        }

        let model = self.embedder.model().to_string();
        let mut reembedded = 0u64;
        for (id, content) in pending {
            let embedding = match self.embedder.embed(&content).await {
                Ok(embedding) => embedding,
                Err(e @ MemoryError::SchemaMismatch { .. }) => return Err(e),
                Err(_) => break,
            };
            self.store.with_tx(|tx| {
                tx.execute(
                    "INSERT OR REPLACE INTO memory_embeddings
                     (memory_id, embedding, dimensions, model, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        id,
                        embedding.to_bytes(),
                        embedding.dimensions as i64,
                        model,
                        Utc::now(),
                    ],
                )?;
                Ok(())
            })?;
            reembedded += 1;
        }
        Ok(reembedded)
    }

    // ========================================================================
    // FULL CONSOLIDATION
    // ========================================================================

    /// Full nightly run: decay, then merge, then pattern detection, then
    /// embedding backfill. Predictions and verification stay manual.
    pub async fn consolidate(&self) -> Result<ConsolidationReport> {
        let started = Instant::now();
        let decayed = self.decay()?;
        let merged = self.merge()?;
        let patterns_detected = self.detect_patterns()?;
        let reembedded = self.reembed_missing().await?;

        let report = ConsolidationReport {
            decayed,
            merged,
            patterns_detected,
            reembedded,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            decayed = report.decayed,
            merged = report.merged,
            patterns = report.patterns_detected,
            reembedded = report.reembedded,
            duration_ms = report.duration_ms,
            "full consolidation complete"
        );
        Ok(report)
    }
}

// ============================================================================
// DEADLINE PARSING
// ============================================================================

const MONTHS: &[(&str, u32)] = &[
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
];

fn iso_date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("static regex compiles")
    })
}

fn spelled_date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:by|before|due|until)\s+([a-z]+)\s+(\d{1,2})(?:st|nd|rd|th)?(?:,?\s+(\d{4}))?")
            .expect("static regex compiles")
    })
}

/// Best-effort deadline extraction from commitment text. Recognizes ISO
/// dates anywhere and "by/before/due/until <month> <day>[, <year>]" phrases;
/// a missing year means the current one. Deadlines land at end of day UTC.
pub fn parse_deadline(content: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(caps) = iso_date_pattern().captures(content) {
        let year: i32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        return end_of_day(year, month, day);
    }

    if let Some(caps) = spelled_date_pattern().captures(content) {
        let month_name = caps[1].to_lowercase();
        let month = MONTHS
            .iter()
            .find(|(name, _)| name.starts_with(&month_name) && month_name.len() >= 3)
            .map(|(_, number)| *number)?;
        let day: u32 = caps[2].parse().ok()?;
        let year: i32 = match caps.get(3) {
            Some(y) => y.as_str().parse().ok()?,
            None => now.year(),
        };
        return end_of_day(year, month, day);
    }

    None
}

fn end_of_day(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, day, 23, 59, 59).single()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbedderConfig;
    use crate::services::remember::{apply_fact, RememberInput};
    use crate::model::MemoryType;
    use tempfile::TempDir;

    fn test_service() -> (ConsolidateService, Arc<Store>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("store.db")).unwrap());
        let embedder = Arc::new(
            Embedder::new(&EmbedderConfig {
                endpoint: "http://127.0.0.1:1".to_string(),
                model: "all-minilm".to_string(),
                dimensions: 3,
                timeout: std::time::Duration::from_millis(100),
            })
            .unwrap(),
        );
        let service =
            ConsolidateService::new(store.clone(), embedder, Config::from_env().unwrap());
        (service, store, dir)
    }

    fn seed_aged_memory(store: &Store, content: &str, importance: f64, age_days: i64) -> i64 {
        store
            .with_tx(|tx| {
                let outcome = apply_fact(
                    tx,
                    &RememberInput {
                        content: content.to_string(),
                        importance,
                        ..Default::default()
                    },
                    None,
                    "m",
                )?;
                tx.execute(
                    "UPDATE memories SET created_at = ?2, updated_at = ?2, last_accessed = ?2
                     WHERE id = ?1",
                    params![outcome.id, Utc::now() - chrono::Duration::days(age_days)],
                )?;
                Ok(outcome.id)
            })
            .unwrap()
    }

    fn importance_of(store: &Store, id: i64) -> f64 {
        store
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT importance FROM memories WHERE id = ?1",
                    [id],
                    |r| r.get(0),
                )?)
            })
            .unwrap()
    }

    #[test]
    fn decay_hits_the_floor_for_ancient_memories() {
        let (service, store, _dir) = test_service();
        let id = seed_aged_memory(&store, "ancient trivia", 0.1, 400);

        let decayed = service.decay().unwrap();
        assert_eq!(decayed, 1);
        assert_eq!(importance_of(&store, id), 0.05);
    }

    #[test]
    fn decay_skips_fresh_memories() {
        let (service, store, _dir) = test_service();
        let id = seed_aged_memory(&store, "fresh fact", 0.8, 0);

        let decayed = service.decay().unwrap();
        assert_eq!(decayed, 0);
        assert_eq!(importance_of(&store, id), 0.8);
    }

    #[test]
    fn decay_applies_daily_rate() {
        let (service, store, _dir) = test_service();
        let id = seed_aged_memory(&store, "ten day old fact", 0.8, 10);

        service.decay().unwrap();
        let expected = 0.8 * 0.98f64.powf(10.0);
        assert!((importance_of(&store, id) - expected).abs() < 0.002);
    }

    #[test]
    fn repeated_decay_does_not_double_count() {
        let (service, store, _dir) = test_service();
        let id = seed_aged_memory(&store, "once is enough", 0.8, 10);

        service.decay().unwrap();
        let after_first = importance_of(&store, id);
        // Second run the same day: the anchor moved to now, nothing to do
        service.decay().unwrap();
        assert_eq!(importance_of(&store, id), after_first);
    }

    #[test]
    fn decay_is_bounded_below() {
        let (service, store, _dir) = test_service();
        let id = seed_aged_memory(&store, "floored", 0.06, 3000);
        for _ in 0..3 {
            service.decay().unwrap();
        }
        assert!(importance_of(&store, id) >= 0.05);
    }

    fn seed_embedded_memory(
        store: &Store,
        content: &str,
        importance: f64,
        vector: Vec<f32>,
        entity: &str,
    ) -> i64 {
        store
            .with_tx(|tx| {
                let outcome = apply_fact(
                    tx,
                    &RememberInput {
                        content: content.to_string(),
                        importance,
                        about_entities: vec![entity.to_string()],
                        ..Default::default()
                    },
                    Some(&Embedding::new(vector)),
                    "m",
                )?;
                Ok(outcome.id)
            })
            .unwrap()
    }

    #[test]
    fn merge_absorbs_near_duplicates_sharing_an_entity() {
        let (service, store, _dir) = test_service();
        let survivor = seed_embedded_memory(
            &store,
            "Sarah Chen works at Acme Corp",
            0.9,
            vec![1.0, 0.0, 0.0],
            "Sarah Chen",
        );
        let absorbed = seed_embedded_memory(
            &store,
            "Sarah Chen is employed by Acme Corp",
            0.4,
            vec![0.999, 0.04, 0.0],
            "Sarah Chen",
        );
        // Similar vector but different entity: stays untouched
        let unrelated = seed_embedded_memory(
            &store,
            "Bob also exists",
            0.5,
            vec![0.998, 0.06, 0.0],
            "Bob",
        );
        store
            .with_write(|conn| {
                conn.execute(
                    "UPDATE memories SET access_count = 3 WHERE id = ?1",
                    [absorbed],
                )?;
                Ok(())
            })
            .unwrap();

        let merged = service.merge().unwrap();
        assert_eq!(merged, 1);

        let survivor_row: (i64, String, Option<String>) = store
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT access_count, aggregated_from, invalidated_at
                     FROM memories WHERE id = ?1",
                    [survivor],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )?)
            })
            .unwrap();
        assert_eq!(survivor_row.0, 3);
        assert!(survivor_row.1.contains("employed"));
        assert!(survivor_row.2.is_none());

        let absorbed_row: (Option<String>, Option<i64>) = store
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT invalidated_at, superseded_by FROM memories WHERE id = ?1",
                    [absorbed],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap();
        assert!(absorbed_row.0.is_some());
        assert_eq!(absorbed_row.1, Some(survivor));

        let unrelated_invalidated: Option<String> = store
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT invalidated_at FROM memories WHERE id = ?1",
                    [unrelated],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert!(unrelated_invalidated.is_none());
    }

    #[test]
    fn merge_ignores_dissimilar_memories() {
        let (service, store, _dir) = test_service();
        seed_embedded_memory(&store, "topic one", 0.5, vec![1.0, 0.0, 0.0], "Sarah Chen");
        seed_embedded_memory(&store, "topic two", 0.5, vec![0.0, 1.0, 0.0], "Sarah Chen");
        assert_eq!(service.merge().unwrap(), 0);
    }

    #[test]
    fn cooling_entities_become_patterns() {
        let (service, store, _dir) = test_service();
        let id = seed_aged_memory(&store, "met Sarah long ago", 0.5, 90);
        store
            .with_write(|conn| {
                conn.execute_batch(
                    "INSERT INTO entities (name, type, importance, created_at, updated_at)
                     VALUES ('Sarah Chen', 'person', 0.8, datetime('now'), datetime('now'));",
                )?;
                conn.execute(
                    "INSERT INTO memory_entities (memory_id, entity_id, relationship)
                     VALUES (?1, 1, 'about')",
                    [id],
                )?;
                Ok(())
            })
            .unwrap();

        let detected = service.detect_patterns().unwrap();
        assert_eq!(detected, 1);

        let (pattern_type, aggregation): (String, i64) = store
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT pattern_type, aggregation_count FROM patterns",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(pattern_type, "relationship");
        assert_eq!(aggregation, 1);

        // Re-detection confirms instead of duplicating
        service.detect_patterns().unwrap();
        let (rows, aggregation): (i64, i64) = store
            .with_read(|conn| {
                Ok((
                    conn.query_row("SELECT COUNT(*) FROM patterns", [], |r| r.get(0))?,
                    conn.query_row("SELECT aggregation_count FROM patterns", [], |r| {
                        r.get(0)
                    })?,
                ))
            })
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(aggregation, 2);
    }

    #[test]
    fn overdue_commitments_become_patterns() {
        let (service, store, _dir) = test_service();
        store
            .with_tx(|tx| {
                apply_fact(
                    tx,
                    &RememberInput {
                        content: "Send the Acme proposal by 2020-06-01".into(),
                        memory_type: MemoryType::Commitment,
                        ..Default::default()
                    },
                    None,
                    "m",
                )?;
                apply_fact(
                    tx,
                    &RememberInput {
                        content: "Review notes someday, no deadline".into(),
                        memory_type: MemoryType::Commitment,
                        ..Default::default()
                    },
                    None,
                    "m",
                )
            })
            .unwrap();

        let detected = service.detect_patterns().unwrap();
        assert_eq!(detected, 1);

        let name: String = store
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT name FROM patterns WHERE pattern_type = 'behavioral'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert!(name.starts_with("Overdue commitment:"));
    }

    #[test]
    fn repeated_observations_aggregate() {
        let (service, store, _dir) = test_service();
        store
            .with_tx(|tx| {
                for i in 0..3 {
                    apply_fact(
                        tx,
                        &RememberInput {
                            content: format!("Sarah replied tersely, take {}", i),
                            memory_type: MemoryType::Observation,
                            about_entities: vec!["Sarah Chen".into()],
                            ..Default::default()
                        },
                        None,
                        "m",
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let detected = service.detect_patterns().unwrap();
        assert_eq!(detected, 1);
        let pattern_type: String = store
            .with_read(|conn| {
                Ok(conn.query_row("SELECT pattern_type FROM patterns", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(pattern_type, "communication");
    }

    #[tokio::test]
    async fn consolidate_reports_all_phases() {
        let (service, store, _dir) = test_service();
        seed_aged_memory(&store, "aging fact", 0.8, 10);

        let report = service.consolidate().await.unwrap();
        assert_eq!(report.decayed, 1);
        assert_eq!(report.merged, 0);
        assert_eq!(report.patterns_detected, 0);
        // Embedder is unreachable: backfill stops without error
        assert_eq!(report.reembedded, 0);
    }

    #[test]
    fn deadline_parser_handles_common_shapes() {
        let now = Utc::now();
        let iso = parse_deadline("ship it by 2026-03-15, no excuses", now).unwrap();
        assert_eq!(iso.format("%Y-%m-%d").to_string(), "2026-03-15");

        let spelled = parse_deadline("due March 15, 2026", now).unwrap();
        assert_eq!(spelled.format("%Y-%m-%d").to_string(), "2026-03-15");

        let yearless = parse_deadline("finish by September 9", now).unwrap();
        assert_eq!(yearless.year(), now.year());

        assert!(parse_deadline("no date here at all", now).is_none());
    }
}
