//! Layered configuration surface (§6.5, §11).
//!
//! Precedence, lowest to highest: compiled-in defaults, a TOML file
//! (`{projects_root}/.workflow-core.toml` by default), environment variables
//! prefixed `WORKFLOW_CORE_`, then explicit CLI flags applied by the caller.
//! Mirrors the teacher's `ForgeToml`/`Config` split: a serde-friendly file
//! format plus a resolved runtime struct with validated, canonicalized paths.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    #[default]
    ReportOnly,
    AutoRepair,
}

/// The on-disk, partially-specified configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreToml {
    #[serde(default)]
    pub max_concurrent_stages: Option<usize>,
    #[serde(default)]
    pub default_stage_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry_base_delay_seconds: Option<f64>,
    #[serde(default)]
    pub retry_exponential_backoff: Option<bool>,
    #[serde(default)]
    pub resource_pool: HashMap<String, usize>,
    #[serde(default)]
    pub checkpoint_interval_seconds: Option<u64>,
    #[serde(default)]
    pub checkpoint_retention_count: Option<usize>,
    #[serde(default)]
    pub project_byte_quota: Option<u64>,
    #[serde(default)]
    pub reconcile_mode: Option<ReconcileMode>,
    #[serde(default)]
    pub projects_root: Option<PathBuf>,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl CoreToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).context("failed to parse workflow-core config")
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("WORKFLOW_CORE_MAX_CONCURRENT_STAGES")
            && let Ok(n) = v.parse()
        {
            self.max_concurrent_stages = Some(n);
        }
        if let Ok(v) = std::env::var("WORKFLOW_CORE_DEFAULT_STAGE_TIMEOUT_SECONDS")
            && let Ok(n) = v.parse()
        {
            self.default_stage_timeout_seconds = Some(n);
        }
        if let Ok(v) = std::env::var("WORKFLOW_CORE_PROJECTS_ROOT") {
            self.projects_root = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("WORKFLOW_CORE_STORE_PATH") {
            self.store_path = Some(PathBuf::from(v));
        }
    }
}

/// Fully resolved, validated runtime configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub max_concurrent_stages: usize,
    pub default_stage_timeout: std::time::Duration,
    pub retry_base_delay: std::time::Duration,
    pub retry_exponential_backoff: bool,
    pub resource_pool: HashMap<String, usize>,
    pub checkpoint_interval: Option<std::time::Duration>,
    pub checkpoint_retention_count: usize,
    pub project_byte_quota: Option<u64>,
    pub reconcile_mode: ReconcileMode,
    pub projects_root: PathBuf,
    pub store_path: PathBuf,
}

impl CoreConfig {
    /// Build from a (possibly empty) file layer plus environment overrides.
    ///
    /// `projects_root` must be supplied by the caller (CLI flag or default
    /// `./projects`); it anchors the default `store_path` and config-file
    /// lookup.
    pub fn resolve(projects_root: PathBuf, file: Option<CoreToml>) -> Result<Self> {
        let mut file = file.unwrap_or_default();
        file.apply_env();

        if !projects_root.exists() {
            std::fs::create_dir_all(&projects_root).context("failed to create projects_root")?;
        }
        let projects_root = projects_root
            .canonicalize()
            .context("failed to resolve projects_root")?;

        let store_path = file
            .store_path
            .clone()
            .unwrap_or_else(|| projects_root.join("workflow-core.db"));

        let config = Self {
            max_concurrent_stages: file.max_concurrent_stages.unwrap_or(4),
            default_stage_timeout: std::time::Duration::from_secs(
                file.default_stage_timeout_seconds.unwrap_or(300),
            ),
            retry_base_delay: std::time::Duration::from_secs_f64(
                file.retry_base_delay_seconds.unwrap_or(5.0),
            ),
            retry_exponential_backoff: file.retry_exponential_backoff.unwrap_or(true),
            resource_pool: file.resource_pool,
            checkpoint_interval: match file.checkpoint_interval_seconds.unwrap_or(60) {
                0 => None,
                n => Some(std::time::Duration::from_secs(n)),
            },
            checkpoint_retention_count: file.checkpoint_retention_count.unwrap_or(10),
            project_byte_quota: file.project_byte_quota,
            reconcile_mode: file.reconcile_mode.unwrap_or_default(),
            projects_root,
            store_path,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(projects_root: PathBuf, config_path: Option<&Path>) -> Result<Self> {
        let default_path = projects_root.join(".workflow-core.toml");
        let path = config_path.unwrap_or(&default_path);
        let file = CoreToml::load_or_default(path)?;
        Self::resolve(projects_root, Some(file))
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_stages == 0 {
            bail!("max_concurrent_stages must be >= 1");
        }
        if self.checkpoint_retention_count == 0 {
            bail!("checkpoint_retention_count must be >= 1");
        }
        Ok(())
    }
}
