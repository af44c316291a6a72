//! Reflections: user-approved learnings about how to work with the user.
//!
//! Reflections sit outside the memory table on purpose. They default to
//! higher importance (0.7) and a far slower decay (0.999), and only a user
//! action confirms or removes them.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::model::{Reflection, ReflectionType};
use crate::services::remember::resolve_or_create_entity;
use crate::store::Store;

fn default_importance() -> f64 {
    0.7
}

fn default_confidence() -> f64 {
    0.8
}

fn default_decay_rate() -> f64 {
    0.999
}

/// Input for storing a reflection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReflectionInput {
    #[serde(rename = "type", default)]
    pub reflection_type: ReflectionType,
    pub content: String,
    /// Optional entity this reflection is about
    #[serde(default)]
    pub about_entity: Option<String>,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
}

/// Fields a caller may change on an existing reflection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReflectionUpdate {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub importance: Option<f64>,
    /// True re-confirms the reflection: bumps aggregation count and
    /// freshness
    #[serde(default)]
    pub confirm: bool,
}

/// Store a reflection inside an open transaction.
pub fn apply_reflection(conn: &Connection, input: &ReflectionInput) -> Result<i64> {
    if input.content.trim().is_empty() {
        return Err(MemoryError::InvalidInput("reflection content is empty".into()));
    }
    let about_entity_id = match &input.about_entity {
        Some(name) if !name.trim().is_empty() => Some(resolve_or_create_entity(conn, name)?),
        _ => None,
    };
    let now = Utc::now();
    conn.execute(
        "INSERT INTO reflections
         (reflection_type, content, about_entity_id, importance, confidence, decay_rate,
          aggregation_count, first_observed_at, last_confirmed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
        params![
            input.reflection_type.as_str(),
            input.content,
            about_entity_id,
            input.importance,
            input.confidence,
            input.decay_rate,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// CRUD surface for the `reflections` tool
pub struct ReflectService {
    store: Arc<Store>,
}

impl ReflectService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn insert(&self, input: &ReflectionInput) -> Result<i64> {
        self.store.with_tx(|tx| apply_reflection(tx, input))
    }

    /// All reflections, importance-descending.
    pub fn list(&self) -> Result<Vec<Reflection>> {
        self.store.with_read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM reflections ORDER BY importance DESC, id ASC",
                Reflection::COLUMNS
            ))?;
            let rows = stmt
                .query_map([], Reflection::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn get(&self, id: i64) -> Result<Reflection> {
        self.store.with_read(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM reflections WHERE id = ?1", Reflection::COLUMNS),
                [id],
                Reflection::from_row,
            )
            .optional()?
            .ok_or_else(|| MemoryError::NotFound(format!("reflection {}", id)))
        })
    }

    pub fn update(&self, id: i64, update: &ReflectionUpdate) -> Result<Reflection> {
        if let Some(importance) = update.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(MemoryError::InvalidInput(
                    "importance must be in [0, 1]".into(),
                ));
            }
        }
        self.store.with_tx(|tx| {
            let existing = tx
                .query_row(
                    &format!("SELECT {} FROM reflections WHERE id = ?1", Reflection::COLUMNS),
                    [id],
                    Reflection::from_row,
                )
                .optional()?
                .ok_or_else(|| MemoryError::NotFound(format!("reflection {}", id)))?;

            let content = update.content.clone().unwrap_or(existing.content);
            let importance = update.importance.unwrap_or(existing.importance);
            if update.confirm {
                tx.execute(
                    "UPDATE reflections
                     SET content = ?2, importance = ?3,
                         aggregation_count = aggregation_count + 1,
                         last_confirmed_at = ?4
                     WHERE id = ?1",
                    params![id, content, importance, Utc::now()],
                )?;
            } else {
                tx.execute(
                    "UPDATE reflections SET content = ?2, importance = ?3 WHERE id = ?1",
                    params![id, content, importance],
                )?;
            }
            tx.query_row(
                &format!("SELECT {} FROM reflections WHERE id = ?1", Reflection::COLUMNS),
                [id],
                Reflection::from_row,
            )
            .map_err(MemoryError::Storage)
        })
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let deleted = self
            .store
            .with_tx(|tx| Ok(tx.execute("DELETE FROM reflections WHERE id = ?1", [id])?))?;
        if deleted == 0 {
            return Err(MemoryError::NotFound(format!("reflection {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_service() -> (ReflectService, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("store.db")).unwrap());
        (ReflectService::new(store), dir)
    }

    fn input(content: &str) -> ReflectionInput {
        ReflectionInput {
            reflection_type: ReflectionType::Learning,
            content: content.to_string(),
            about_entity: None,
            importance: default_importance(),
            confidence: default_confidence(),
            decay_rate: default_decay_rate(),
        }
    }

    #[test]
    fn insert_uses_slow_decay_defaults() {
        let (service, _dir) = test_service();
        let id = service.insert(&input("prefers terse answers")).unwrap();
        let reflection = service.get(id).unwrap();
        assert_eq!(reflection.importance, 0.7);
        assert_eq!(reflection.confidence, 0.8);
        assert_eq!(reflection.decay_rate, 0.999);
        assert_eq!(reflection.aggregation_count, 1);
    }

    #[test]
    fn confirm_bumps_aggregation() {
        let (service, _dir) = test_service();
        let id = service.insert(&input("checks email at 7am")).unwrap();
        let updated = service
            .update(
                id,
                &ReflectionUpdate {
                    confirm: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.aggregation_count, 2);
    }

    #[test]
    fn update_and_delete_roundtrip() {
        let (service, _dir) = test_service();
        let id = service.insert(&input("draft")).unwrap();
        let updated = service
            .update(
                id,
                &ReflectionUpdate {
                    content: Some("refined".into()),
                    importance: Some(0.9),
                    confirm: false,
                },
            )
            .unwrap();
        assert_eq!(updated.content, "refined");
        assert_eq!(updated.importance, 0.9);

        service.delete(id).unwrap();
        assert!(matches!(service.get(id), Err(MemoryError::NotFound(_))));
        assert!(matches!(service.delete(id), Err(MemoryError::NotFound(_))));
    }

    #[test]
    fn about_entity_is_resolved_or_created() {
        let (service, _dir) = test_service();
        let mut reflection_input = input("responds fastest on chat");
        reflection_input.about_entity = Some("Sarah Chen".into());
        let id = service.insert(&reflection_input).unwrap();
        assert!(service.get(id).unwrap().about_entity_id.is_some());
    }
}
