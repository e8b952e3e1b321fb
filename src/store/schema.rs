//! Schema migrations for the project store (§6.2).
//!
//! Each migration is a single `(version, sql)` pair applied in order inside
//! one transaction, tracked in `schema_migrations`. Downgrades are refused.

pub struct Migration {
    pub version: i64,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: "
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            theme TEXT NOT NULL DEFAULT '',
            target_length_minutes INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'initialized',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            config_json TEXT NOT NULL DEFAULT '{}',
            estimated_duration INTEGER,
            actual_duration INTEGER,
            external_id TEXT,
            external_url TEXT
        );

        CREATE TABLE IF NOT EXISTS workflow_steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            step_name TEXT NOT NULL,
            step_order INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            started_at TEXT,
            completed_at TEXT,
            input_params_json TEXT NOT NULL DEFAULT '{}',
            output_summary_json TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            processing_time_seconds REAL,
            UNIQUE(project_id, step_name)
        );

        CREATE TABLE IF NOT EXISTS project_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            step_name TEXT,
            file_type TEXT NOT NULL,
            file_category TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_size_bytes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            is_temporary INTEGER NOT NULL DEFAULT 0,
            UNIQUE(project_id, file_path)
        );

        CREATE TABLE IF NOT EXISTS project_statistics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            step_name TEXT,
            stat_name TEXT NOT NULL,
            stat_value REAL NOT NULL,
            stat_unit TEXT NOT NULL DEFAULT '',
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS api_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT REFERENCES projects(id) ON DELETE SET NULL,
            step_name TEXT,
            api_provider TEXT NOT NULL,
            api_endpoint TEXT NOT NULL,
            request_timestamp TEXT NOT NULL,
            tokens_input INTEGER,
            tokens_output INTEGER,
            estimated_cost_usd REAL,
            response_time_ms INTEGER,
            status_code INTEGER
        );

        CREATE TABLE IF NOT EXISTS system_config (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            config_key TEXT NOT NULL UNIQUE,
            config_value TEXT NOT NULL,
            config_type TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            updated_by TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_workflow_steps_project_status ON workflow_steps(project_id, status);
        CREATE INDEX IF NOT EXISTS idx_workflow_steps_name ON workflow_steps(step_name);
        CREATE INDEX IF NOT EXISTS idx_project_files_project_type ON project_files(project_id, file_type);
        CREATE INDEX IF NOT EXISTS idx_project_files_step_category ON project_files(step_name, file_category);
        CREATE INDEX IF NOT EXISTS idx_projects_created_at ON projects(created_at);
        CREATE INDEX IF NOT EXISTS idx_api_usage_provider_ts ON api_usage(api_provider, request_timestamp);
    ",
}];
