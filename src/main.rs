use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use workflow_core::cmd::{self, Host};
use workflow_core::config::CoreConfig;
use workflow_core::model::ProjectStatus;

#[derive(Parser)]
#[command(name = "workflow-core")]
#[command(version, about = "Dependency-aware workflow orchestration core")]
struct Cli {
    /// Root directory holding per-project file trees.
    #[arg(long, global = true, default_value = "./projects")]
    projects_root: PathBuf,

    /// Path to the sqlite store. Defaults to `<projects_root>/store.db`.
    #[arg(long, global = true)]
    store_path: Option<PathBuf>,

    /// Path to a `core.toml` configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// `text` (default) or `json`.
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new project and its on-disk directory tree.
    InitProject {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        theme: String,
        #[arg(long, default_value_t = 0)]
        target_length: u32,
    },
    /// Execute a workflow definition against a project.
    Run {
        #[arg(long)]
        project: String,
        #[arg(long)]
        workflow: PathBuf,
    },
    /// Print a project's status and stage states.
    Status {
        #[arg(long)]
        project: String,
    },
    /// List known projects, optionally filtered by status.
    ListProjects {
        #[arg(long)]
        status: Option<String>,
    },
    /// Resume an interrupted project and re-run its workflow.
    Resume {
        #[arg(long)]
        project: String,
        #[arg(long)]
        workflow: PathBuf,
    },
    /// Cross-check the artifact ledger against the filesystem.
    Reconcile {
        #[arg(long)]
        project: String,
        #[arg(long)]
        auto_repair: bool,
    },
    /// Remove temporary artifacts older than a given age.
    CleanupTemporary {
        #[arg(long)]
        project: String,
        #[arg(long)]
        older_than: i64,
    },
    /// Request cancellation of a project's in-process run.
    Cancel {
        #[arg(long)]
        project: String,
    },
}

fn init_tracing(verbose: bool, log_format: &str) {
    let filter = if verbose {
        EnvFilter::new("workflow_core=debug")
    } else {
        EnvFilter::new("workflow_core=info")
    };
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn parse_status(s: &str) -> Result<ProjectStatus> {
    match s {
        "initialized" => Ok(ProjectStatus::Initialized),
        "processing" => Ok(ProjectStatus::Processing),
        "completed" => Ok(ProjectStatus::Completed),
        "failed" => Ok(ProjectStatus::Failed),
        "cancelled" => Ok(ProjectStatus::Cancelled),
        other => anyhow::bail!("unknown project status '{other}'"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, &cli.log_format);

    let file = match &cli.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            Some(toml::from_str(&content).context("failed to parse config file")?)
        }
        None => None,
    };
    let mut config = match CoreConfig::resolve(cli.projects_root.clone(), file) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(cmd::exit_code::MISCONFIGURATION);
        }
    };
    if let Some(store_path) = cli.store_path {
        config.store_path = store_path;
    }

    let host = Host::open(config)?;

    let exit = match cli.command {
        Commands::InitProject { id, name, theme, target_length } => {
            cmd::init_project(&host, &id, &name, &theme, target_length)?;
            cmd::exit_code::SUCCESS
        }
        Commands::Run { project, workflow } => {
            let workflow_def = cmd::load_workflow_def(&workflow)?;
            cmd::run(&host, &project, &workflow_def).await?
        }
        Commands::Status { project } => {
            cmd::status(&host, &project)?;
            cmd::exit_code::SUCCESS
        }
        Commands::ListProjects { status } => {
            let filter = status.as_deref().map(parse_status).transpose()?;
            cmd::list_projects(&host, filter)?;
            cmd::exit_code::SUCCESS
        }
        Commands::Resume { project, workflow } => {
            let workflow_def = cmd::load_workflow_def(&workflow)?;
            cmd::resume(&host, &project, &workflow_def).await?
        }
        Commands::Reconcile { project, auto_repair } => {
            cmd::reconcile(&host, &project, auto_repair).await?;
            cmd::exit_code::SUCCESS
        }
        Commands::CleanupTemporary { project, older_than } => {
            cmd::cleanup_temporary(&host, &project, older_than).await?;
            cmd::exit_code::SUCCESS
        }
        Commands::Cancel { project } => {
            cmd::cancel(&host, &project)?;
            cmd::exit_code::SUCCESS
        }
    };

    std::process::exit(exit);
}
