//! Core data model: projects, stage records, artifacts, stats, API usage,
//! and system configuration. Mirrors the logical tables of the persistence
//! backend one-for-one (see `store::schema`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Initialized,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initialized" => Some(Self::Initialized),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Legal transitions for project status (§4.5 is stage-level; this is
    /// the analogous project-level machine implied by §3).
    pub fn can_transition_to(&self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Initialized, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Initialized, Cancelled)
                | (Processing, Processing)
        )
    }
}

/// Status of a single [`StageRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled)
    }

    /// The state machine of §4.5.
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Running) // retry
                | (Cancelled, Running) // a fresh run resumes a stage left cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Audio,
    Video,
    Image,
    Script,
    Subtitle,
    Metadata,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Image => "image",
            Self::Script => "script",
            Self::Subtitle => "subtitle",
            Self::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "image" => Some(Self::Image),
            "script" => Some(Self::Script),
            "subtitle" => Some(Self::Subtitle),
            "metadata" => Some(Self::Metadata),
            _ => None,
        }
    }

    /// Subdirectory under `files/` that artifacts of this type live in (§6.3).
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Image => "images",
            Self::Script => "scripts",
            Self::Subtitle => "scripts",
            Self::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCategory {
    Input,
    Output,
    Intermediate,
    Final,
}

impl ArtifactCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Intermediate => "intermediate",
            Self::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(Self::Input),
            "output" => Some(Self::Output),
            "intermediate" => Some(Self::Intermediate),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

/// An aggregate root: one media-generation job (§3 "Project").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub theme: String,
    pub target_length_minutes: u32,
    pub status: ProjectStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub config: serde_json::Value,
    pub estimated_duration_seconds: Option<i64>,
    pub actual_duration_seconds: Option<i64>,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
}

/// One (Project, stage name) record (§3 "StageRecord").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub project_id: String,
    pub step_name: String,
    pub step_order: i64,
    pub status: StageStatus,
    pub input_params: serde_json::Value,
    pub output_summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub processing_time_seconds: Option<f64>,
}

/// A file-ledger entry (§3 "ArtifactRef").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: i64,
    pub project_id: String,
    pub step_name: Option<String>,
    pub file_type: ArtifactType,
    pub file_category: ArtifactCategory,
    /// Relative to the project root.
    pub file_path: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub metadata: serde_json::Value,
    pub is_temporary: bool,
}

/// A numeric metric keyed by (project, stage, name) (§3 "StatCounter").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatCounter {
    pub project_id: String,
    pub step_name: Option<String>,
    pub stat_name: String,
    pub stat_value: f64,
    pub stat_unit: String,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// A single outbound API call (§3 "ApiUsageRecord").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUsageRecord {
    pub id: i64,
    pub project_id: Option<String>,
    pub step_name: Option<String>,
    pub api_provider: String,
    pub api_endpoint: String,
    pub request_timestamp: chrono::DateTime<chrono::Utc>,
    pub tokens_input: Option<i64>,
    pub tokens_output: Option<i64>,
    pub estimated_cost_usd: Option<f64>,
    pub response_time_ms: Option<i64>,
    pub status_code: Option<i32>,
}

/// A typed process-wide config value (§3 "SystemConfig").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub config_key: String,
    pub config_value: String,
    pub config_type: ConfigValueType,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub updated_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigValueType {
    String,
    Integer,
    Boolean,
    Json,
}

impl ConfigValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Declares one node of a workflow (§4.3 "StageDef").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(with = "duration_seconds")]
    pub timeout: std::time::Duration,
    #[serde(default)]
    pub required_resources: Vec<String>,
    #[serde(with = "duration_seconds")]
    pub estimated_duration: std::time::Duration,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    FailWorkflow,
    SkipDependents,
}

/// A named, ordered collection of [`StageDef`] (the GLOSSARY's "Workflow").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    pub stages: Vec<StageDef>,
}

impl WorkflowDef {
    pub fn stage(&self, name: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Input/output map threaded through stage contexts.
pub type DataMap = HashMap<String, serde_json::Value>;

mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
