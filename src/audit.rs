//! Durable audit trail, separate from `tracing` output (§10 "Logging").
//!
//! Appends one JSON line per terminal stage transition to
//! `{project}/logs/audit.jsonl`, grounded on the teacher's
//! `audit/logger.rs` persistence of structured run records — simplified
//! here from a single rewritten "current run" file to an append-only
//! JSONL log, since the audit trail is a record of what happened rather
//! than a resumable snapshot (that job belongs to [`crate::checkpoint`]).

use crate::model::StageStatus;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub project_id: String,
    pub stage_name: String,
    pub status: StageStatus,
    pub attempt: u32,
    pub detail: Option<String>,
}

pub struct AuditTrail {
    projects_root: PathBuf,
}

impl AuditTrail {
    pub fn new(projects_root: PathBuf) -> Self {
        Self { projects_root }
    }

    fn log_path(&self, project_id: &str) -> PathBuf {
        self.projects_root.join(project_id).join("logs").join("audit.jsonl")
    }

    pub fn record(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let path = self.log_path(&entry.project_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")
    }

    pub fn read_all(&self, project_id: &str) -> std::io::Result<Vec<AuditEntry>> {
        let path = self.log_path(project_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
