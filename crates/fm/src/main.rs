use clap::{Args, Parser, Subcommand};
use fm_core::projects::ProjectRegistry;
use fm_core::runner::ProcessRunner;
use fm_core::{Engine, EngineConfig};
use fm_events::bus::EventBus;
use fm_store::{JsonStore, TranscriptWriter, ViolationLogFile};
use fm_vcs::backend::BranchConfig;
use fm_vcs::git::GitWorkspace;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fm", about = "Serialized prompt execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and its HTTP/WebSocket API.
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "FOREMAN_HOST", default_value = "127.0.0.1")]
    host: IpAddr,
    #[arg(long, env = "FOREMAN_PORT", default_value_t = 4820)]
    port: u16,
    /// Repository the agent works in.
    #[arg(long, env = "FOREMAN_REPO_ROOT", default_value = ".")]
    repo_root: PathBuf,
    #[arg(long, env = "FOREMAN_DATA_DIR", default_value = ".foreman")]
    data_dir: PathBuf,
    #[arg(long, env = "FOREMAN_PROJECTS_DIR", default_value = "projects")]
    projects_dir: PathBuf,
    #[arg(long, env = "FOREMAN_DEFAULT_PROJECT")]
    default_project: Option<String>,
    #[arg(long, env = "FOREMAN_AGENT_BIN", default_value = "codex")]
    agent_bin: String,
    #[arg(
        long,
        env = "FOREMAN_AGENT_ARGS",
        default_value = "exec --skip-git-repo-check -"
    )]
    agent_args: String,
    #[arg(long, env = "FOREMAN_SANDBOX")]
    sandbox: Option<String>,
    #[arg(long, env = "FOREMAN_GIT_BASE_BRANCH", default_value = "main")]
    base_branch: String,
    #[arg(
        long,
        env = "FOREMAN_BRANCH_PREFIX",
        default_value = "foreman/prompt"
    )]
    branch_prefix: String,
    #[arg(long, env = "FOREMAN_BRANCH_SLUG_WORDS", default_value_t = 6)]
    slug_words: usize,
    #[arg(long, env = "FOREMAN_BRANCH_SLUG_CHARS", default_value_t = 48)]
    slug_chars: usize,
    /// Leave prompt branches in place after a clean finish.
    #[arg(long, env = "FOREMAN_NO_BRANCH_CLEANUP")]
    no_branch_cleanup: bool,
    /// Debug override: skip the clean-tree preflight check.
    #[arg(long, env = "FOREMAN_GIT_ALLOW_DIRTY")]
    allow_dirty: bool,
    /// Log every mutating git operation instead of executing it.
    #[arg(long, env = "FOREMAN_GIT_DRY_RUN")]
    git_dry_run: bool,
    /// Escape hatch: bypass branch isolation entirely. Reduces safety.
    #[arg(long, env = "FOREMAN_DISABLE_BRANCH_DISCIPLINE")]
    disable_branch_discipline: bool,
    #[arg(long, env = "FOREMAN_CANCEL_GRACE_SECS", default_value_t = 5)]
    grace_secs: u64,
    #[arg(long, env = "FOREMAN_HEARTBEAT_SECS", default_value_t = 10)]
    heartbeat_secs: u64,
    #[arg(long, env = "FOREMAN_BUS_CAPACITY", default_value_t = 1024)]
    bus_capacity: usize,
}

impl ServeArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            repo_root: self.repo_root.clone(),
            data_dir: self.data_dir.clone(),
            projects_dir: self.projects_dir.clone(),
            default_project: self.default_project.clone(),
            agent_bin: self.agent_bin.clone(),
            agent_args: self.agent_args.clone(),
            sandbox: self.sandbox.clone(),
            grace_secs: self.grace_secs,
            heartbeat_secs: self.heartbeat_secs,
            bus_capacity: self.bus_capacity,
            branch: BranchConfig {
                base_branch: self.base_branch.clone(),
                branch_prefix: self.branch_prefix.clone(),
                slug_words: self.slug_words,
                slug_chars: self.slug_chars,
                cleanup_enabled: !self.no_branch_cleanup,
                allow_dirty: self.allow_dirty,
                dry_run: self.git_dry_run,
                disabled: self.disable_branch_discipline,
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(&args).await,
    }
}

async fn serve(args: &ServeArgs) -> ExitCode {
    let config = args.engine_config();

    if let Err(err) = std::fs::create_dir_all(&config.data_dir) {
        eprintln!("unable to create data dir {}: {err}", config.data_dir.display());
        return ExitCode::FAILURE;
    }

    // A store that exists but cannot be parsed halts boot: no silent data loss.
    let store = match JsonStore::open(config.prompt_db_path()) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("unable to load prompt store: {err}");
            return ExitCode::FAILURE;
        }
    };

    let runner_config = match config.runner_config() {
        Ok(runner_config) => runner_config,
        Err(err) => {
            eprintln!("invalid agent configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let bus = EventBus::new(config.bus_capacity);
    let registry = ProjectRegistry::load(
        &config.projects_dir,
        &config.repo_root,
        config.default_project.as_deref(),
    );
    let workspace = GitWorkspace::new(config.repo_root.clone(), config.branch.clone());
    let runner = ProcessRunner::new(runner_config, config.repo_root.clone());
    let transcripts = Arc::new(TranscriptWriter::new(config.transcripts_dir()));
    let violations = Arc::new(ViolationLogFile::new(config.violation_log_path()));

    let engine = Arc::new(Engine::new(
        store,
        bus,
        workspace,
        registry,
        runner,
        transcripts,
        violations,
        config.clone(),
    ));

    // Recovery runs to completion before the scheduler consumes anything.
    match engine.reconcile_on_boot() {
        Ok(recovered) if !recovered.is_empty() => {
            tracing::warn!(count = recovered.len(), "recovered prompts from previous run");
        }
        Ok(_) => {}
        Err(err) => {
            eprintln!("recovery failed: {err}");
            return ExitCode::FAILURE;
        }
    }

    tokio::spawn(Arc::clone(&engine).run());
    tokio::spawn(Arc::clone(&engine).heartbeat());

    let addr = SocketAddr::new(args.host, args.port);
    let state = fm_serve::AppState { engine };
    if let Err(err) = fm_serve::serve(state, addr).await {
        eprintln!("serve error: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
