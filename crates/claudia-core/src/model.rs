//! Core data model: entities, memories, relationships, episodes, patterns,
//! reflections, documents.
//!
//! Every row type carries its own `from_row` mapper so services can stay
//! SQL-light. Timestamps are stored as RFC 3339 TEXT in UTC; ids are SQLite
//! `INTEGER PRIMARY KEY` rowid aliases.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

// ============================================================================
// ENTITY
// ============================================================================

/// Types of real-world entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A human being
    Person,
    /// A company, team, or institution
    Organization,
    /// A named body of work
    Project,
    /// An abstract idea
    #[default]
    Concept,
    /// A physical place
    Location,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Organization => "organization",
            EntityType::Project => "project",
            EntityType::Concept => "concept",
            EntityType::Location => "location",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "person" => EntityType::Person,
            "organization" | "org" | "company" => EntityType::Organization,
            "project" => EntityType::Project,
            "location" | "place" => EntityType::Location,
            _ => EntityType::Concept,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named real-world thing the assistant knows about
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: i64,
    /// Canonical name; aliases map many-to-one onto this row
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub description: Option<String>,
    /// Aggregate importance in [0, 1]
    pub importance: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; deleted entities are excluded from resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entity {
    /// Column list every entity query must select, in `from_row` order.
    pub const COLUMNS: &'static str =
        "id, name, type, description, importance, created_at, updated_at, deleted_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            entity_type: EntityType::parse_name(&row.get::<_, String>(2)?),
            description: row.get(3)?,
            importance: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            deleted_at: row.get(7)?,
        })
    }
}

/// Slim entity projection returned by `search_entities`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub importance: f64,
}

// ============================================================================
// MEMORY
// ============================================================================

/// Types of memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// A discrete statement about the world
    #[default]
    Fact,
    /// Something the user promised or was promised, usually with a deadline
    Commitment,
    /// Something the assistant learned that changed its behavior
    Learning,
    /// A raw observation about the user or an entity
    Observation,
    /// A user preference
    Preference,
    /// A detected recurring pattern
    Pattern,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Commitment => "commitment",
            MemoryType::Learning => "learning",
            MemoryType::Observation => "observation",
            MemoryType::Preference => "preference",
            MemoryType::Pattern => "pattern",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "commitment" => MemoryType::Commitment,
            "learning" => MemoryType::Learning,
            "observation" => MemoryType::Observation,
            "preference" => MemoryType::Preference,
            "pattern" => MemoryType::Pattern,
            _ => MemoryType::Fact,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verification lifecycle of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    #[default]
    Pending,
    Verified,
    Refuted,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Refuted => "refuted",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "verified" => VerificationStatus::Verified,
            "refuted" => VerificationStatus::Refuted,
            _ => VerificationStatus::Pending,
        }
    }
}

/// A content-bearing record, deduplicated by normalized content hash
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: i64,
    pub content: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    /// Importance in [0, 1]; decays over time, boosted by rehearsal
    pub importance: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: i64,
    pub verification_status: VerificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    /// Soft tombstone; invalidated memories never appear in default recall
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidated_at: Option<DateTime<Utc>>,
    /// Survivor this memory was merged into, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<i64>,
    /// Contents of memories absorbed into this one during merge
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregated_from: Vec<String>,
}

impl Memory {
    /// Column list every memory query must select, in `from_row` order.
    pub const COLUMNS: &'static str = "id, content, type, importance, confidence, content_hash, \
         created_at, updated_at, last_accessed, access_count, verification_status, verified_at, \
         invalidated_at, superseded_by, aggregated_from";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let aggregated_raw: String = row.get(14)?;
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            memory_type: MemoryType::parse_name(&row.get::<_, String>(2)?),
            importance: row.get(3)?,
            confidence: row.get(4)?,
            content_hash: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            last_accessed: row.get(8)?,
            access_count: row.get(9)?,
            verification_status: VerificationStatus::parse_name(&row.get::<_, String>(10)?),
            verified_at: row.get(11)?,
            invalidated_at: row.get(12)?,
            superseded_by: row.get(13)?,
            aggregated_from: serde_json::from_str(&aggregated_raw).unwrap_or_default(),
        })
    }
}

// ============================================================================
// RELATIONSHIP
// ============================================================================

/// Relationship types the engine knows how to reason about. The vocabulary
/// is open; these are just the well-known values.
pub const WELL_KNOWN_RELATIONSHIPS: &[&str] = &[
    "works_with",
    "works_at",
    "client_of",
    "reports_to",
    "manages",
    "invested_in",
    "partner_at",
    "advisor_to",
    "knows",
    "collaborates_on",
    "colleagues",
    "community_connection",
    "likely_connected",
];

/// A typed, directed, bi-temporal edge between two entities.
///
/// `valid_at`/`invalid_at` are fact time, independent of row creation time.
/// At most one row per `(source, target, type)` has `invalid_at = NULL`;
/// superseding closes the old row and inserts a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub id: i64,
    pub source_entity_id: i64,
    pub target_entity_id: i64,
    pub relationship_type: String,
    /// Strength in [0, 1]
    pub strength: f64,
    /// Fact-time begin
    pub valid_at: DateTime<Utc>,
    /// Fact-time end; NULL = currently valid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<DateTime<Utc>>,
    pub direction: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub const COLUMNS: &'static str = "id, source_entity_id, target_entity_id, relationship_type, \
         strength, valid_at, invalid_at, direction, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_entity_id: row.get(1)?,
            target_entity_id: row.get(2)?,
            relationship_type: row.get(3)?,
            strength: row.get(4)?,
            valid_at: row.get(5)?,
            invalid_at: row.get(6)?,
            direction: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    /// Whether the edge is valid right now (fact time).
    pub fn is_current(&self) -> bool {
        self.invalid_at.is_none()
    }
}

// ============================================================================
// SESSION: TURNS AND EPISODES
// ============================================================================

/// A buffered conversational turn awaiting summarization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub summarized: bool,
}

impl Turn {
    pub const COLUMNS: &'static str = "id, session_id, role, content, created_at, summarized";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
            summarized: row.get::<_, i64>(5)? != 0,
        })
    }
}

/// A summarized session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: i64,
    pub session_id: String,
    pub narrative: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Episode {
    pub const COLUMNS: &'static str =
        "id, session_id, narrative, started_at, ended_at, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            narrative: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

// ============================================================================
// PATTERN
// ============================================================================

/// Kinds of derived patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// A relationship trend, e.g. a cooling contact
    Relationship,
    /// A behavioral trend, e.g. overdue commitments
    Behavioral,
    /// A communication-style trend
    Communication,
    /// A scheduling trend
    Scheduling,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Relationship => "relationship",
            PatternType::Behavioral => "behavioral",
            PatternType::Communication => "communication",
            PatternType::Scheduling => "scheduling",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "behavioral" => PatternType::Behavioral,
            "communication" => PatternType::Communication,
            "scheduling" => PatternType::Scheduling,
            _ => PatternType::Relationship,
        }
    }
}

/// A derived observation about the user or a relationship
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub id: i64,
    pub pattern_type: PatternType,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    pub first_observed_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    pub aggregation_count: i64,
    pub is_active: bool,
}

impl Pattern {
    pub const COLUMNS: &'static str = "id, pattern_type, name, description, confidence, \
         entity_id, first_observed_at, last_confirmed_at, aggregation_count, is_active";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pattern_type: PatternType::parse_name(&row.get::<_, String>(1)?),
            name: row.get(2)?,
            description: row.get(3)?,
            confidence: row.get(4)?,
            entity_id: row.get(5)?,
            first_observed_at: row.get(6)?,
            last_confirmed_at: row.get(7)?,
            aggregation_count: row.get(8)?,
            is_active: row.get::<_, i64>(9)? != 0,
        })
    }
}

// ============================================================================
// REFLECTION
// ============================================================================

/// Kinds of reflections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionType {
    #[default]
    Observation,
    Pattern,
    Learning,
    Question,
}

impl ReflectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReflectionType::Observation => "observation",
            ReflectionType::Pattern => "pattern",
            ReflectionType::Learning => "learning",
            ReflectionType::Question => "question",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pattern" => ReflectionType::Pattern,
            "learning" => ReflectionType::Learning,
            "question" => ReflectionType::Question,
            _ => ReflectionType::Observation,
        }
    }
}

/// A user-approved, slow-decaying learning about how to work with the user.
/// Distinct from a memory of a fact about the world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    pub id: i64,
    pub reflection_type: ReflectionType,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about_entity_id: Option<i64>,
    pub importance: f64,
    pub confidence: f64,
    pub decay_rate: f64,
    pub aggregation_count: i64,
    pub first_observed_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
}

impl Reflection {
    pub const COLUMNS: &'static str = "id, reflection_type, content, about_entity_id, importance, \
         confidence, decay_rate, aggregation_count, first_observed_at, last_confirmed_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            reflection_type: ReflectionType::parse_name(&row.get::<_, String>(1)?),
            content: row.get(2)?,
            about_entity_id: row.get(3)?,
            importance: row.get(4)?,
            confidence: row.get(5)?,
            decay_rate: row.get(6)?,
            aggregation_count: row.get(7)?,
            first_observed_at: row.get(8)?,
            last_confirmed_at: row.get(9)?,
        })
    }
}

// ============================================================================
// DOCUMENT
// ============================================================================

/// Filed source material: transcripts, emails, files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: i64,
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub const COLUMNS: &'static str = "id, source_type, filename, content, summary, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_type: row.get(1)?,
            filename: row.get(2)?,
            content: row.get(3)?,
            summary: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_roundtrip() {
        for t in [
            EntityType::Person,
            EntityType::Organization,
            EntityType::Project,
            EntityType::Concept,
            EntityType::Location,
        ] {
            assert_eq!(EntityType::parse_name(t.as_str()), t);
        }
    }

    #[test]
    fn memory_type_roundtrip() {
        for t in [
            MemoryType::Fact,
            MemoryType::Commitment,
            MemoryType::Learning,
            MemoryType::Observation,
            MemoryType::Preference,
            MemoryType::Pattern,
        ] {
            assert_eq!(MemoryType::parse_name(t.as_str()), t);
        }
    }

    #[test]
    fn unknown_types_fall_back() {
        assert_eq!(EntityType::parse_name("gadget"), EntityType::Concept);
        assert_eq!(MemoryType::parse_name("rumor"), MemoryType::Fact);
        assert_eq!(
            VerificationStatus::parse_name("unknown"),
            VerificationStatus::Pending
        );
    }

    #[test]
    fn well_known_relationships_include_core_set() {
        assert!(WELL_KNOWN_RELATIONSHIPS.contains(&"works_at"));
        assert!(WELL_KNOWN_RELATIONSHIPS.contains(&"reports_to"));
        assert!(WELL_KNOWN_RELATIONSHIPS.contains(&"likely_connected"));
    }

    #[test]
    fn memory_serializes_type_field() {
        let memory = Memory {
            id: 1,
            content: "x".into(),
            memory_type: MemoryType::Commitment,
            importance: 0.5,
            confidence: 0.8,
            content_hash: "h".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_accessed: Utc::now(),
            access_count: 0,
            verification_status: VerificationStatus::Pending,
            verified_at: None,
            invalidated_at: None,
            superseded_by: None,
            aggregated_from: vec![],
        };
        let json = serde_json::to_value(&memory).unwrap();
        assert_eq!(json["type"], "commitment");
        assert!(json.get("invalidatedAt").is_none());
    }
}
