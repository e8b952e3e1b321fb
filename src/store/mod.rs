//! C1 — Project Store: transactional persistence over projects, stage
//! records, the artifact ledger, statistics, API usage, and system config.
//!
//! Grounded in the teacher's `factory/db.rs` (`FactoryDb`): a single
//! `rusqlite::Connection` wrapped for shared access, schema applied via
//! `execute_batch` at open time, hand-rolled row mapping instead of an ORM.
//! Multi-row mutations use an explicit `Connection::transaction()` so a
//! caller error rolls everything back (§4.1 "Concurrency").

mod schema;

use crate::error::StoreError;
use crate::model::*;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

/// Health of the store, as reported by [`ProjectStore::health_check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded(String),
}

/// Predicate for [`ProjectStore::query_artifacts`].
#[derive(Debug, Clone, Default)]
pub struct ArtifactPredicate {
    pub step_name: Option<String>,
    pub file_type: Option<ArtifactType>,
    pub file_category: Option<ArtifactCategory>,
}

/// A filter for [`ProjectStore::list_projects`].
#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub status: Option<ProjectStatus>,
}

pub struct ProjectStore {
    conn: Mutex<Connection>,
}

impl ProjectStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL);",
        )?;
        drop(conn);
        self.migrate()?;
        Ok(())
    }

    /// Apply pending migrations in version order; refuses to run one whose
    /// version is <= the highest already applied (no downgrades, §4.1).
    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let current: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |r| r.get(0),
            )
            .unwrap_or(0);

        for migration in schema::MIGRATIONS {
            if migration.version <= current {
                continue;
            }
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(migration.sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![migration.version, now_str()],
            )?;
            tx.commit()?;
        }
        Ok(())
    }

    pub fn health_check(&self) -> Health {
        match self.conn.lock() {
            Ok(conn) => match conn.query_row("SELECT 1", [], |_| Ok(())) {
                Ok(()) => Health::Healthy,
                Err(e) => Health::Degraded(e.to_string()),
            },
            Err(_) => Health::Degraded("connection lock poisoned".to_string()),
        }
    }

    /// Snapshot the store file atomically via SQLite's own backup API.
    pub fn backup(&self, dest: &Path) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut dest_conn = Connection::open(dest)?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut dest_conn)?;
        backup.run_to_completion(5, std::time::Duration::from_millis(50), None)?;
        Ok(())
    }

    // ---- Projects ------------------------------------------------------

    pub fn create_project(
        &self,
        id: &str,
        name: &str,
        theme: &str,
        config: &serde_json::Value,
        target_length_minutes: u32,
    ) -> Result<Project, StoreError> {
        let conn = self.conn.lock().unwrap();
        if let Some(existing) = Self::get_project_locked(&conn, id)? {
            return Ok(existing);
        }
        let now = now_str();
        conn.execute(
            "INSERT INTO projects (id, name, theme, target_length_minutes, status, created_at, updated_at, config_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
            params![
                id,
                name,
                theme,
                target_length_minutes,
                ProjectStatus::Initialized.as_str(),
                now,
                config.to_string(),
            ],
        )?;
        Self::get_project_locked(&conn, id)?
            .ok_or_else(|| StoreError::Integrity("project vanished after insert".into()))
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::get_project_locked(&conn, id)
    }

    fn get_project_locked(conn: &Connection, id: &str) -> Result<Option<Project>, StoreError> {
        conn.query_row(
            "SELECT id, name, theme, target_length_minutes, status, created_at, updated_at,
                    config_json, estimated_duration, actual_duration, external_id, external_url
             FROM projects WHERE id = ?1",
            params![id],
            row_to_project,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_projects(
        &self,
        filter: &ProjectFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Project>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = "SELECT id, name, theme, target_length_minutes, status, created_at, updated_at,
                          config_json, estimated_duration, actual_duration, external_id, external_url
                   FROM projects
                   WHERE (?1 IS NULL OR status = ?1)
                   ORDER BY created_at
                   LIMIT ?2 OFFSET ?3";
        let mut stmt = conn.prepare(sql)?;
        let status = filter.status.map(|s| s.as_str().to_string());
        let rows = stmt.query_map(params![status, limit, offset], row_to_project)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_project_status(
        &self,
        id: &str,
        new_status: ProjectStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let current = Self::get_project_locked(&conn, id)?
            .ok_or_else(|| StoreError::ProjectNotFound(id.to_string()))?;
        if !current.status.can_transition_to(new_status) {
            return Err(StoreError::IllegalProjectTransition {
                from: current.status,
                to: new_status,
            });
        }
        conn.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_status.as_str(), now_str(), id],
        )?;
        Ok(())
    }

    pub fn set_project_actual_duration(&self, id: &str, seconds: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE projects SET actual_duration = ?1, updated_at = ?2 WHERE id = ?3",
            params![seconds, now_str(), id],
        )?;
        Ok(())
    }

    // ---- Stage records ---------------------------------------------------

    /// Bulk-insert stage records for a workflow; idempotent on repeat with
    /// identical input (existing rows for the same step name are left
    /// untouched rather than re-inserted, so a partially-completed project
    /// keeps its progress on a second `create_stage_records` call).
    pub fn create_stage_records(
        &self,
        project_id: &str,
        stages: &[(String, i64, serde_json::Value)],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for (name, order, input) in stages {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM workflow_steps WHERE project_id = ?1 AND step_name = ?2",
                    params![project_id, name],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_some() {
                continue;
            }
            tx.execute(
                "INSERT INTO workflow_steps (project_id, step_name, step_order, status, input_params_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project_id,
                    name,
                    order,
                    StageStatus::Pending.as_str(),
                    input.to_string()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_stage(
        &self,
        project_id: &str,
        step_name: &str,
    ) -> Result<Option<StageRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::get_stage_locked(&conn, project_id, step_name)
    }

    fn get_stage_locked(
        conn: &Connection,
        project_id: &str,
        step_name: &str,
    ) -> Result<Option<StageRecord>, StoreError> {
        conn.query_row(
            "SELECT project_id, step_name, step_order, status, input_params_json,
                    output_summary_json, error_message, retry_count, started_at,
                    completed_at, processing_time_seconds
             FROM workflow_steps WHERE project_id = ?1 AND step_name = ?2",
            params![project_id, step_name],
            row_to_stage,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_stages(&self, project_id: &str) -> Result<Vec<StageRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT project_id, step_name, step_order, status, input_params_json,
                    output_summary_json, error_message, retry_count, started_at,
                    completed_at, processing_time_seconds
             FROM workflow_steps WHERE project_id = ?1 ORDER BY step_order",
        )?;
        let rows = stmt.query_map(params![project_id], row_to_stage)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_stage_status(
        &self,
        project_id: &str,
        step_name: &str,
        new_status: StageStatus,
        error: Option<&str>,
        retry_count: Option<u32>,
        output: Option<&serde_json::Value>,
        elapsed_seconds: Option<f64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let current = Self::get_stage_locked(&conn, project_id, step_name)?.ok_or_else(|| {
            StoreError::StageNotFound {
                project: project_id.to_string(),
                stage: step_name.to_string(),
            }
        })?;
        if !current.status.can_transition_to(new_status) {
            return Err(StoreError::IllegalStageTransition {
                stage: step_name.to_string(),
                from: current.status,
                to: new_status,
            });
        }

        let now = now_str();
        let started_at = match new_status {
            StageStatus::Running if current.started_at.is_none() => Some(now.clone()),
            _ => current.started_at.map(|t| t.to_rfc3339()),
        };
        let completed_at = if new_status.is_terminal() {
            Some(now.clone())
        } else {
            current.completed_at.map(|t| t.to_rfc3339())
        };

        conn.execute(
            "UPDATE workflow_steps
             SET status = ?1, error_message = ?2, retry_count = COALESCE(?3, retry_count),
                 output_summary_json = COALESCE(?4, output_summary_json),
                 processing_time_seconds = COALESCE(?5, processing_time_seconds),
                 started_at = ?6, completed_at = ?7
             WHERE project_id = ?8 AND step_name = ?9",
            params![
                new_status.as_str(),
                error,
                retry_count,
                output.map(|v| v.to_string()),
                elapsed_seconds,
                started_at,
                completed_at,
                project_id,
                step_name,
            ],
        )?;
        Ok(())
    }

    // ---- Artifacts -------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn register_artifact(
        &self,
        project_id: &str,
        step_name: Option<&str>,
        file_type: ArtifactType,
        file_category: ArtifactCategory,
        rel_path: &str,
        file_name: &str,
        size_bytes: u64,
        metadata: &serde_json::Value,
        is_temporary: bool,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO project_files
                (project_id, step_name, file_type, file_category, file_path, file_name,
                 file_size_bytes, created_at, metadata_json, is_temporary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                project_id,
                step_name,
                file_type.as_str(),
                file_category.as_str(),
                rel_path,
                file_name,
                size_bytes,
                now_str(),
                metadata.to_string(),
                is_temporary as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_artifact(&self, project_id: &str, artifact_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM project_files WHERE id = ?1 AND project_id = ?2",
            params![artifact_id, project_id],
        )?;
        Ok(())
    }

    pub fn update_artifact_size(&self, artifact_id: i64, size_bytes: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE project_files SET file_size_bytes = ?1 WHERE id = ?2",
            params![size_bytes, artifact_id],
        )?;
        Ok(())
    }

    pub fn project_byte_total(&self, project_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(file_size_bytes), 0) FROM project_files WHERE project_id = ?1",
            params![project_id],
            |r| r.get(0),
        )?;
        Ok(total as u64)
    }

    pub fn query_artifacts(
        &self,
        project_id: &str,
        predicate: &ArtifactPredicate,
    ) -> Result<Vec<ArtifactRef>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = "SELECT id, project_id, step_name, file_type, file_category, file_path,
                          file_name, file_size_bytes, created_at, metadata_json, is_temporary
                   FROM project_files
                   WHERE project_id = ?1
                     AND (?2 IS NULL OR step_name = ?2)
                     AND (?3 IS NULL OR file_type = ?3)
                     AND (?4 IS NULL OR file_category = ?4)";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(
            params![
                project_id,
                predicate.step_name,
                predicate.file_type.as_ref().map(|t| t.as_str()),
                predicate.file_category.as_ref().map(|c| c.as_str()),
            ],
            row_to_artifact,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn all_artifacts(&self, project_id: &str) -> Result<Vec<ArtifactRef>, StoreError> {
        self.query_artifacts(project_id, &ArtifactPredicate::default())
    }

    // ---- Stats & API usage -------------------------------------------------

    pub fn record_stat(
        &self,
        project_id: &str,
        step_name: Option<&str>,
        name: &str,
        value: f64,
        unit: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO project_statistics (project_id, step_name, stat_name, stat_value, stat_unit, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![project_id, step_name, name, value, unit, now_str()],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_api_usage(
        &self,
        project_id: Option<&str>,
        step_name: Option<&str>,
        provider: &str,
        endpoint: &str,
        tokens_input: Option<i64>,
        tokens_output: Option<i64>,
        cost_usd: Option<f64>,
        response_time_ms: Option<i64>,
        status_code: Option<i32>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO api_usage
                (project_id, step_name, api_provider, api_endpoint, request_timestamp,
                 tokens_input, tokens_output, estimated_cost_usd, response_time_ms, status_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                project_id,
                step_name,
                provider,
                endpoint,
                now_str(),
                tokens_input,
                tokens_output,
                cost_usd,
                response_time_ms,
                status_code,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Delete a project and everything it transitively owns. API usage
    /// records are retained with their project link severed (ON DELETE SET
    /// NULL), per §3 "Relationships & lifecycle".
    pub fn delete_project(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn now_str() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

fn row_to_project(row: &rusqlite::Row) -> rusqlite::Result<Project> {
    let status_str: String = row.get(4)?;
    let config_str: String = row.get(7)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        theme: row.get(2)?,
        target_length_minutes: row.get::<_, i64>(3)? as u32,
        status: ProjectStatus::parse(&status_str).unwrap_or(ProjectStatus::Initialized),
        created_at: parse_ts(&row.get::<_, String>(5)?),
        updated_at: parse_ts(&row.get::<_, String>(6)?),
        config: serde_json::from_str(&config_str).unwrap_or(serde_json::json!({})),
        estimated_duration_seconds: row.get(8)?,
        actual_duration_seconds: row.get(9)?,
        external_id: row.get(10)?,
        external_url: row.get(11)?,
    })
}

fn row_to_stage(row: &rusqlite::Row) -> rusqlite::Result<StageRecord> {
    let status_str: String = row.get(3)?;
    let input_str: String = row.get(4)?;
    let output_str: Option<String> = row.get(5)?;
    let started_str: Option<String> = row.get(8)?;
    let completed_str: Option<String> = row.get(9)?;
    Ok(StageRecord {
        project_id: row.get(0)?,
        step_name: row.get(1)?,
        step_order: row.get(2)?,
        status: StageStatus::parse(&status_str).unwrap_or(StageStatus::Pending),
        input_params: serde_json::from_str(&input_str).unwrap_or(serde_json::json!({})),
        output_summary: output_str.and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.get(6)?,
        retry_count: row.get::<_, i64>(7)? as u32,
        started_at: started_str.map(|s| parse_ts(&s)),
        completed_at: completed_str.map(|s| parse_ts(&s)),
        processing_time_seconds: row.get(10)?,
    })
}

fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<ArtifactRef> {
    let file_type: String = row.get(3)?;
    let file_category: String = row.get(4)?;
    let created_at: String = row.get(8)?;
    let metadata: String = row.get(9)?;
    let is_temp: i64 = row.get(10)?;
    Ok(ArtifactRef {
        id: row.get(0)?,
        project_id: row.get(1)?,
        step_name: row.get(2)?,
        file_type: ArtifactType::parse(&file_type).unwrap_or(ArtifactType::Metadata),
        file_category: ArtifactCategory::parse(&file_category).unwrap_or(ArtifactCategory::Output),
        file_path: row.get(5)?,
        file_name: row.get(6)?,
        file_size_bytes: row.get::<_, i64>(7)? as u64,
        created_at: parse_ts(&created_at),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        is_temporary: is_temp != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ProjectStore {
        ProjectStore::open_in_memory().unwrap()
    }

    #[test]
    fn create_project_is_idempotent() {
        let s = store();
        let p1 = s
            .create_project("proj1", "Demo", "space", &serde_json::json!({}), 5)
            .unwrap();
        let p2 = s
            .create_project("proj1", "Demo Again", "ignored", &serde_json::json!({}), 99)
            .unwrap();
        assert_eq!(p1.name, p2.name);
        assert_eq!(p2.name, "Demo");
    }

    #[test]
    fn project_status_transitions_are_enforced() {
        let s = store();
        s.create_project("p", "n", "t", &serde_json::json!({}), 1)
            .unwrap();
        s.update_project_status("p", ProjectStatus::Processing)
            .unwrap();
        s.update_project_status("p", ProjectStatus::Completed)
            .unwrap();
        let err = s
            .update_project_status("p", ProjectStatus::Processing)
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalProjectTransition { .. }));
    }

    #[test]
    fn stage_transitions_are_enforced_and_timestamps_set() {
        let s = store();
        s.create_project("p", "n", "t", &serde_json::json!({}), 1)
            .unwrap();
        s.create_stage_records("p", &[("a".into(), 0, serde_json::json!({}))])
            .unwrap();
        s.update_stage_status("p", "a", StageStatus::Running, None, None, None, None)
            .unwrap();
        let stage = s.get_stage("p", "a").unwrap().unwrap();
        assert!(stage.started_at.is_some());
        s.update_stage_status(
            "p",
            "a",
            StageStatus::Completed,
            None,
            None,
            Some(&serde_json::json!({"x": 1})),
            Some(1.5),
        )
        .unwrap();
        let stage = s.get_stage("p", "a").unwrap().unwrap();
        assert!(stage.completed_at.is_some());
        assert_eq!(stage.output_summary.unwrap()["x"], 1);

        let err = s
            .update_stage_status("p", "a", StageStatus::Running, None, None, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalStageTransition { .. }));
    }

    #[test]
    fn create_stage_records_is_idempotent() {
        let s = store();
        s.create_project("p", "n", "t", &serde_json::json!({}), 1)
            .unwrap();
        s.create_stage_records("p", &[("a".into(), 0, serde_json::json!({}))])
            .unwrap();
        s.update_stage_status("p", "a", StageStatus::Running, None, None, None, None)
            .unwrap();
        // Re-registering the same stage set must not reset progress.
        s.create_stage_records("p", &[("a".into(), 0, serde_json::json!({}))])
            .unwrap();
        let stage = s.get_stage("p", "a").unwrap().unwrap();
        assert_eq!(stage.status, StageStatus::Running);
    }

    #[test]
    fn query_artifacts_filters_by_predicate() {
        let s = store();
        s.create_project("p", "n", "t", &serde_json::json!({}), 1)
            .unwrap();
        s.register_artifact(
            "p",
            Some("a"),
            ArtifactType::Audio,
            ArtifactCategory::Output,
            "files/audio/x.wav",
            "x.wav",
            10,
            &serde_json::json!({}),
            false,
        )
        .unwrap();
        s.register_artifact(
            "p",
            Some("b"),
            ArtifactType::Video,
            ArtifactCategory::Final,
            "files/video/y.mp4",
            "y.mp4",
            20,
            &serde_json::json!({}),
            false,
        )
        .unwrap();
        let audio = s
            .query_artifacts(
                "p",
                &ArtifactPredicate {
                    file_type: Some(ArtifactType::Audio),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].file_name, "x.wav");
    }

    #[test]
    fn deleting_project_severs_api_usage_link() {
        let s = store();
        s.create_project("p", "n", "t", &serde_json::json!({}), 1)
            .unwrap();
        s.record_api_usage(
            Some("p"),
            None,
            "openai",
            "/v1/chat",
            Some(10),
            Some(20),
            Some(0.01),
            Some(100),
            Some(200),
        )
        .unwrap();
        s.delete_project("p").unwrap();
        let conn = s.conn.lock().unwrap();
        let project_id: Option<String> = conn
            .query_row("SELECT project_id FROM api_usage LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(project_id, None);
    }
}
