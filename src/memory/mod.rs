//! Long-term memory of a work: what has happened, who is where, which threads
//! are still open.
//!
//! - `MemoryRecord` and its typed payloads
//! - `MemoryStore`: per-work partitions with similarity search
//! - `ContextRetriever`: assembles the context block for the next chapter
//! - `Similarity`: pluggable vector scoring

pub mod retriever;
pub mod similarity;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::work::WorkId;

pub use retriever::{ContextRetriever, RetrievedContext};
pub use similarity::{Cosine, Similarity};
pub use store::{MemoryStore, Query, ScoredRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    ChapterSummary,
    CharacterState,
    PlotEvent,
    WorldFact,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordKind::ChapterSummary => "chapter_summary",
            RecordKind::CharacterState => "character_state",
            RecordKind::PlotEvent => "plot_event",
            RecordKind::WorldFact => "world_fact",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Foreshadow,
    #[default]
    Setup,
    Climax,
    Reveal,
    Twist,
    Resolution,
}

impl EventType {
    /// Lenient parse of model output; unknown labels become `Setup`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "foreshadow" | "foreshadowing" | "伏笔" => EventType::Foreshadow,
            "climax" | "高潮" => EventType::Climax,
            "reveal" | "揭示" => EventType::Reveal,
            "twist" | "转折" => EventType::Twist,
            "resolution" | "resolve" | "resolved" | "回收" | "解决" => EventType::Resolution,
            _ => EventType::Setup,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Foreshadow => "foreshadow",
            EventType::Setup => "setup",
            EventType::Climax => "climax",
            EventType::Reveal => "reveal",
            EventType::Twist => "twist",
            EventType::Resolution => "resolution",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Minor,
    #[default]
    Normal,
    Major,
    Critical,
}

impl Importance {
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "critical" | "关键" => Importance::Critical,
            "major" | "重要" => Importance::Major,
            "minor" | "次要" => Importance::Minor,
            _ => Importance::Normal,
        }
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Importance::Minor => "minor",
            Importance::Normal => "normal",
            Importance::Major => "major",
            Importance::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Type-specific content of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordPayload {
    ChapterSummary {
        summary: String,
        #[serde(default)]
        key_characters: Vec<String>,
        #[serde(default)]
        key_events: Vec<String>,
        #[serde(default)]
        tone: Option<String>,
    },
    CharacterState {
        character: String,
        state: String,
    },
    PlotEvent {
        description: String,
        event_type: EventType,
        importance: Importance,
        resolved: bool,
        #[serde(default)]
        resolution: Option<String>,
    },
    WorldFact {
        category: String,
        name: String,
        description: String,
    },
}

impl RecordPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::ChapterSummary { .. } => RecordKind::ChapterSummary,
            RecordPayload::CharacterState { .. } => RecordKind::CharacterState,
            RecordPayload::PlotEvent { .. } => RecordKind::PlotEvent,
            RecordPayload::WorldFact { .. } => RecordKind::WorldFact,
        }
    }

    /// Free text used for embedding and for context assembly.
    pub fn text(&self) -> String {
        match self {
            RecordPayload::ChapterSummary { summary, .. } => summary.clone(),
            RecordPayload::CharacterState { character, state } => format!("{character}: {state}"),
            RecordPayload::PlotEvent {
                description,
                resolution,
                ..
            } => match resolution {
                Some(resolution) => format!("{description} (resolved: {resolution})"),
                None => description.clone(),
            },
            RecordPayload::WorldFact {
                category,
                name,
                description,
            } => format!("[{category}] {name}: {description}"),
        }
    }

    /// Name that versions of the same entity share.
    pub fn subject(&self) -> Option<&str> {
        match self {
            RecordPayload::CharacterState { character, .. } => Some(character),
            RecordPayload::WorldFact { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// One durable fact about a work, tied to the chapter that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub work_id: WorkId,
    /// Chapter this version originated in
    pub chapter: u32,
    pub embedding: Vec<f32>,
    pub payload: RecordPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<RecordId>,
    /// Set by the consistency audit on long-open plot threads
    #[serde(default)]
    pub stale: bool,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(work_id: WorkId, chapter: u32, payload: RecordPayload, embedding: Vec<f32>) -> Self {
        Self {
            id: RecordId::new(),
            work_id,
            chapter,
            embedding,
            payload,
            supersedes: None,
            superseded_by: None,
            stale: false,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    pub fn text(&self) -> String {
        self.payload.text()
    }

    /// Not replaced by a newer version.
    pub fn is_current(&self) -> bool {
        self.superseded_by.is_none()
    }

    pub fn is_unresolved_event(&self) -> bool {
        matches!(
            self.payload,
            RecordPayload::PlotEvent {
                resolved: false,
                ..
            }
        )
    }
}
