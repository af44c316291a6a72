//! Runtime configuration.
//!
//! Built from environment variables, optionally overridden by CLI flags in
//! the daemon. Per-workspace isolation: the store lives at
//! `<user-data>/memory/<workspace-hash>/store.db`; demo mode uses an
//! isolated `<user-data>/demo/` root instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;

use crate::error::{MemoryError, Result};
use crate::text::workspace_hash;

/// Default loopback port for the health endpoint
pub const DEFAULT_HEALTH_PORT: u16 = 3848;

/// Default embedding dimension, fixed per store at creation
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

/// Default per-call timeout for model runtime requests
pub const MODEL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Embedding runtime client settings
#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    /// Base URL of the local embedding runtime (Ollama native API)
    pub endpoint: String,
    /// Model name, e.g. "all-minilm"
    pub model: String,
    /// Vector dimension; mismatches against the store are fatal at startup
    pub dimensions: usize,
    /// Per-call timeout
    pub timeout: Duration,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_model_endpoint(),
            model: "all-minilm".to_string(),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            timeout: MODEL_CALL_TIMEOUT,
        }
    }
}

/// Generative language model client settings
#[derive(Debug, Clone)]
pub struct LanguageModelConfig {
    /// Base URL of the local LLM runtime (Ollama native API)
    pub endpoint: String,
    /// Model name, e.g. "llama3.2"
    pub model: String,
    /// Per-call timeout
    pub timeout: Duration,
}

impl Default for LanguageModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_model_endpoint(),
            model: "llama3.2".to_string(),
            timeout: MODEL_CALL_TIMEOUT,
        }
    }
}

/// Recall ranking weights and limits
#[derive(Debug, Clone)]
pub struct RecallConfig {
    /// Weight of cosine similarity in the composite score
    pub similarity_weight: f64,
    /// Weight of stored importance
    pub importance_weight: f64,
    /// Weight of recency decay
    pub recency_weight: f64,
    /// Recency decay window in days: `exp(-age_days / window)`
    pub recency_window_days: f64,
    /// Candidate pool multiplier: top-K = multiplier x limit
    pub top_k_multiplier: usize,
    /// Importance multiplier applied to every returned memory
    pub rehearsal_boost: f64,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            similarity_weight: 0.60,
            importance_weight: 0.30,
            recency_weight: 0.10,
            recency_window_days: 30.0,
            top_k_multiplier: 3,
            rehearsal_boost: 1.02,
        }
    }
}

/// Consolidation tuning
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Daily multiplicative decay applied to memory importance
    pub memory_decay_rate: f64,
    /// Much slower decay for reflections (per-row override wins)
    pub reflection_decay_rate: f64,
    /// Importance never decays below this floor
    pub importance_floor: f64,
    /// Cosine similarity threshold for merging near-duplicate memories
    pub merge_threshold: f64,
    /// Entities above this importance with no recent memory are "cooling"
    pub cooling_importance: f64,
    /// Days without a new memory before an entity counts as cooling
    pub cooling_days: i64,
    /// Repeated-observation window for communication-style patterns
    pub observation_window_days: i64,
    /// Observations within the window needed to aggregate a pattern
    pub observation_min_count: i64,
    /// Max rows mutated per write batch; the write lock is released between
    /// batches so tool requests are not starved
    pub batch_size: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            memory_decay_rate: 0.98,
            reflection_decay_rate: 0.999,
            importance_floor: 0.05,
            merge_threshold: 0.92,
            cooling_importance: 0.5,
            cooling_days: 60,
            observation_window_days: 14,
            observation_min_count: 3,
            batch_size: 1000,
        }
    }
}

/// Hard limits on caller-controlled sizes
#[derive(Debug, Clone)]
pub struct Limits {
    /// Max sub-operations in one `batch` tool call
    pub max_batch_ops: usize,
    /// Turns per session before `buffer_turn` starts asking for a summary
    pub turn_soft_cap: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_batch_ops: 100,
            turn_soft_cap: 1000,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute workspace directory this store is scoped to
    pub workspace: PathBuf,
    /// Demo mode: isolated store under `<user-data>/demo/`
    pub demo: bool,
    /// Resolved database file path
    pub db_path: PathBuf,
    /// Health endpoint port
    pub health_port: u16,
    /// Embedding runtime settings
    pub embedding: EmbedderConfig,
    /// Language model runtime settings
    pub language_model: LanguageModelConfig,
    /// Recall ranking settings
    pub recall: RecallConfig,
    /// Consolidation settings
    pub consolidation: ConsolidationConfig,
    /// Size limits
    pub limits: Limits,
}

fn default_model_endpoint() -> String {
    // OLLAMA_HOST is the runtime's own convention; honor it when set.
    std::env::var("OLLAMA_HOST")
        .ok()
        .filter(|v| !v.is_empty())
        .map(|host| {
            if host.starts_with("http://") || host.starts_with("https://") {
                host
            } else {
                format!("http://{}", host)
            }
        })
        .unwrap_or_else(|| "http://127.0.0.1:11434".to_string())
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

impl Config {
    /// Build configuration from the environment.
    ///
    /// Recognized variables: `WORKSPACE_DIR`, `DEMO_MODE`, `EMBEDDING_MODEL`,
    /// `LM_MODEL`, `HEALTH_PORT` (plus `OLLAMA_HOST` for the runtime
    /// endpoint).
    pub fn from_env() -> Result<Self> {
        let workspace = match std::env::var("WORKSPACE_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => std::env::current_dir()?,
        };
        let demo = env_flag("DEMO_MODE");

        let health_port = match std::env::var("HEALTH_PORT") {
            Ok(raw) if !raw.is_empty() => raw.parse::<u16>().map_err(|_| {
                MemoryError::Config(format!("HEALTH_PORT is not a valid port: {raw}"))
            })?,
            _ => DEFAULT_HEALTH_PORT,
        };

        let mut embedding = EmbedderConfig::default();
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            if !model.is_empty() {
                embedding.model = model;
            }
        }

        let mut language_model = LanguageModelConfig::default();
        if let Ok(model) = std::env::var("LM_MODEL") {
            if !model.is_empty() {
                language_model.model = model;
            }
        }

        let db_path = resolve_db_path(&workspace, demo)?;

        Ok(Self {
            workspace,
            demo,
            db_path,
            health_port,
            embedding,
            language_model,
            recall: RecallConfig::default(),
            consolidation: ConsolidationConfig::default(),
            limits: Limits::default(),
        })
    }

    /// Re-resolve the database path after the workspace or demo flag changed
    /// (CLI overrides).
    pub fn rehome(&mut self) -> Result<()> {
        self.db_path = resolve_db_path(&self.workspace, self.demo)?;
        Ok(())
    }
}

/// Resolve `<user-data>/memory/<workspace-hash>/store.db`, or the demo root.
fn resolve_db_path(workspace: &Path, demo: bool) -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "claudia", "memory")
        .ok_or_else(|| MemoryError::Config("could not determine user data directory".into()))?;
    let root = if demo {
        dirs.data_dir().join("demo")
    } else {
        dirs.data_dir()
            .join("memory")
            .join(workspace_hash(workspace))
    };
    Ok(root.join("store.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recall_weights_sum_to_one() {
        let recall = RecallConfig::default();
        let total = recall.similarity_weight + recall.importance_weight + recall.recency_weight;
        assert!((total - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn defaults_match_contract() {
        let consolidation = ConsolidationConfig::default();
        assert_eq!(consolidation.memory_decay_rate, 0.98);
        assert_eq!(consolidation.reflection_decay_rate, 0.999);
        assert_eq!(consolidation.importance_floor, 0.05);
        assert_eq!(consolidation.merge_threshold, 0.92);

        let embedding = EmbedderConfig::default();
        assert_eq!(embedding.dimensions, 384);

        let limits = Limits::default();
        assert_eq!(limits.max_batch_ops, 100);
        assert_eq!(limits.turn_soft_cap, 1000);
    }

    #[test]
    fn demo_and_workspace_roots_differ() {
        let ws = Path::new("/tmp/claudia-config-test");
        let normal = resolve_db_path(ws, false).unwrap();
        let demo = resolve_db_path(ws, true).unwrap();
        assert_ne!(normal, demo);
        assert!(demo.to_string_lossy().contains("demo"));
        assert!(normal
            .parent()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }
}
