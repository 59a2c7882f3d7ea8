//! Gauntlet CLI - cached validation pipelines
//!
//! Usage:
//!   gauntlet run [--check] [--force] [--cwd DIR] -- <command...>
//!   gauntlet validate [--force] [--no-fail-fast] [--sequential] [--config FILE]

mod display;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gauntlet_core::{ExecutionContext, GauntletConfig, GauntletError};
use gauntlet_git::{
    ContentHashProvider, GitCommand, GitContentHash, GitExecutor, GitNoteStore, InMemoryNoteStore,
    NoteStore, UnknownContentHash, WorkdirResolver,
};
use gauntlet_runner::{
    document, install_shutdown_hook, CacheLookup, OutputMerger, ParallelScheduler,
    PipelineDocument, PipelineOptions, PipelineRunner, ProcessRegistry, ResultDocument, RunCache,
    SingleRunner, StepExecutor, TracingObserver, GENERIC_FAILURE_EXIT_CODE,
    SPAWN_FAILURE_EXIT_CODE,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::display::DisplayOptions;

/// Environment variable holding the log filter
const LOG_ENV_VAR: &str = "GAUNTLET_LOG";

/// Exit code for rejected arguments, paths and configuration
const USAGE_EXIT_CODE: i32 = 2;

#[derive(Parser)]
#[command(name = "gauntlet")]
#[command(author, version, about = "Cached validation pipelines")]
struct Cli {
    /// Enable debug logging on stderr
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command through the run cache
    Run {
        /// Report cache status without executing (exit 0 on hit, 1 on miss)
        #[arg(long)]
        check: bool,

        /// Ignore cached results; the cache is still refreshed
        #[arg(long)]
        force: bool,

        /// Working directory relative to the repository root
        #[arg(long, value_name = "DIR")]
        cwd: Option<String>,

        /// Show the first N captured lines on stderr
        #[arg(long, value_name = "N")]
        head: Option<usize>,

        /// Show the last N captured lines on stderr
        #[arg(long, value_name = "N")]
        tail: Option<usize>,

        /// Show all captured lines on stderr
        #[arg(long)]
        verbose: bool,

        /// Command to run, passed to the shell
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run the configured validation pipeline
    Validate {
        /// Ignore cached results; the cache is still refreshed
        #[arg(long)]
        force: bool,

        /// Let sibling steps finish after a failure
        #[arg(long)]
        no_fail_fast: bool,

        /// Run every phase's steps one at a time
        #[arg(long)]
        sequential: bool,

        /// Config file (defaults to .gauntlet/config.toml)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

/// Repository handles for one invocation
struct Workspace {
    root: PathBuf,
    invoking_dir: PathBuf,
    store: Arc<dyn NoteStore>,
    hasher: Arc<dyn ContentHashProvider>,
}

impl Workspace {
    /// Outside a repository caching is disabled and the invoking directory acts as root
    async fn detect() -> Result<Self> {
        let invoking_dir = std::env::current_dir().context("Failed to read current directory")?;
        match GitCommand::detect(&invoking_dir).await {
            Ok(git) => Ok(Self {
                root: git.repo_root().to_path_buf(),
                invoking_dir,
                store: Arc::new(GitNoteStore::new(git.clone())),
                hasher: Arc::new(GitContentHash::new(git)),
            }),
            Err(e) => {
                debug!("No repository detected, caching disabled: {}", e);
                Ok(Self {
                    root: invoking_dir.clone(),
                    invoking_dir,
                    store: Arc::new(InMemoryNoteStore::new()),
                    hasher: Arc::new(UnknownContentHash),
                })
            }
        }
    }

    fn run_cache(&self, context: ExecutionContext) -> RunCache {
        RunCache::new(
            self.store.clone(),
            self.hasher.clone(),
            WorkdirResolver::new(&self.root, &self.invoking_dir),
            context,
        )
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.debug) {
        eprintln!("gauntlet: failed to initialize logging: {}", e);
    }

    let registry = ProcessRegistry::new();
    let _shutdown = install_shutdown_hook(registry.clone());

    let code = match dispatch(cli.command, registry).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("gauntlet: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn init_logging(debug: bool) -> Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn exit_code_for(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<GauntletError>() {
        Some(GauntletError::Spawn { .. }) => SPAWN_FAILURE_EXIT_CODE,
        Some(e) if e.is_usage_error() => USAGE_EXIT_CODE,
        _ => GENERIC_FAILURE_EXIT_CODE,
    }
}

/// Build the shell command from the trailing arguments
///
/// A single argument is already a complete shell command. Several arguments
/// are quoted one by one so `sh -c 'exit 3'` keeps its grouping.
fn shell_command(args: &[String]) -> Result<String> {
    match args {
        [single] => Ok(single.clone()),
        _ => shlex::try_join(args.iter().map(String::as_str)).map_err(|e| {
            anyhow::Error::from(GauntletError::Config(format!("Cannot quote command: {}", e)))
        }),
    }
}

async fn dispatch(command: Commands, registry: ProcessRegistry) -> Result<i32> {
    match command {
        Commands::Run {
            check,
            force,
            cwd,
            head,
            tail,
            verbose,
            command,
        } => {
            let display = DisplayOptions {
                head,
                tail,
                verbose,
            };
            let command = shell_command(&command)?;
            cmd_run(command, cwd, check, force, display, registry).await
        }
        Commands::Validate {
            force,
            no_fail_fast,
            sequential,
            config,
        } => cmd_validate(force, no_fail_fast, sequential, config, registry).await,
    }
}

async fn cmd_run(
    command: String,
    cwd: Option<String>,
    check: bool,
    force: bool,
    display: DisplayOptions,
    registry: ProcessRegistry,
) -> Result<i32> {
    if command.trim().is_empty() {
        bail!(GauntletError::Config("No command given".to_string()));
    }

    let workspace = Workspace::detect().await?;
    let context = ExecutionContext::from_process_env(force);
    let cache = workspace.run_cache(context);

    let config = GauntletConfig::load_or_default(&workspace.root).unwrap_or_else(|e| {
        warn!("Ignoring unreadable config: {}", e);
        GauntletConfig::default()
    });
    let runner = SingleRunner::new(
        cache,
        StepExecutor::with_registry(registry),
        OutputMerger::new(),
    )
    .with_log_dir(config.resolved_log_dir());

    if check {
        return match runner.check(&command, cwd.as_deref()).await? {
            CacheLookup::Hit(record) => {
                eprintln!("cached: `{}` passed in {:.2}s", record.command, record.duration_seconds);
                Ok(0)
            }
            CacheLookup::Miss(reason) => {
                eprintln!("not cached: {:?}", reason);
                Ok(1)
            }
        };
    }

    let report = runner.run(&command, cwd.as_deref()).await?;
    emit(&ResultDocument::Run(report.document.clone()))?;
    display::print_lines(&report.lines, display);
    Ok(report.exit_code())
}

async fn cmd_validate(
    force: bool,
    no_fail_fast: bool,
    sequential: bool,
    config_path: Option<PathBuf>,
    registry: ProcessRegistry,
) -> Result<i32> {
    let workspace = Workspace::detect().await?;
    let config = match &config_path {
        Some(path) => GauntletConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => GauntletConfig::load_or_default(&workspace.root)?,
    };
    if config.phases.is_empty() {
        bail!(GauntletError::Config(
            "No phases configured and no project language detected".to_string()
        ));
    }

    let mut options = PipelineOptions::from(&config);
    options.fail_fast = config.fail_fast && !no_fail_fast;
    options.force_sequential = sequential;

    let context = ExecutionContext::from_process_env(force);
    let scheduler = ParallelScheduler::new(StepExecutor::with_registry(registry), OutputMerger::new());
    let runner = PipelineRunner::new(scheduler, workspace.run_cache(context))
        .with_log_dir(config.resolved_log_dir())
        .with_observer(Arc::new(TracingObserver));

    let result = runner.run(&config.phases, &options).await?;
    emit(&ResultDocument::Pipeline(PipelineDocument::from(&result)))?;
    if let Some(step) = result.failed_step() {
        eprintln!("failed: {} (exit {})", step.name, step.exit_code);
        if let Some(output) = &result.failed_step_output {
            eprintln!("{}", output);
        }
    }

    Ok(if result.passed { 0 } else { GENERIC_FAILURE_EXIT_CODE })
}

/// Write the document to stdout in full before anything else goes to stderr
fn emit(doc: &ResultDocument) -> Result<()> {
    let rendered = document::render(doc).context("Failed to render result document")?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    out.write_all(rendered.as_bytes())?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_runner::{CacheKeyCodec, StepOptions};

    fn run_args(argv: &[&str]) -> Vec<String> {
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run { command, .. } => command,
            Commands::Validate { .. } => panic!("expected the run subcommand"),
        }
    }

    #[test]
    fn test_single_argument_is_used_verbatim() {
        let args = run_args(&["gauntlet", "run", "--", "cargo test && echo ok"]);
        assert_eq!(shell_command(&args).unwrap(), "cargo test && echo ok");
    }

    #[test]
    fn test_arguments_keep_their_grouping() {
        let spaced = shell_command(&run_args(&["gauntlet", "run", "--", "echo", "a b"])).unwrap();
        let split = shell_command(&run_args(&["gauntlet", "run", "--", "echo", "a", "b"])).unwrap();

        assert_eq!(split, "echo a b");
        assert_ne!(spaced, split);
        assert_ne!(
            CacheKeyCodec::encode(&spaced, "."),
            CacheKeyCodec::encode(&split, ".")
        );
    }

    #[test]
    fn test_hyphen_arguments_after_command() {
        let args = run_args(&["gauntlet", "run", "--force", "cargo", "test", "--all"]);
        assert_eq!(args, vec!["cargo", "test", "--all"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quoted_script_reports_its_exit_code() {
        let command =
            shell_command(&run_args(&["gauntlet", "run", "--", "sh", "-c", "exit 3"])).unwrap();
        let cwd = std::env::current_dir().unwrap();

        let output = StepExecutor::new()
            .run(&command, &StepOptions::new(cwd))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[test]
    fn test_exit_code_mapping() {
        let spawn = anyhow::Error::from(GauntletError::Spawn {
            command: "nope".to_string(),
            reason: "not found".to_string(),
        });
        assert_eq!(exit_code_for(&spawn), SPAWN_FAILURE_EXIT_CODE);

        let traversal = anyhow::Error::from(GauntletError::PathTraversal {
            requested: "../..".to_string(),
            root: PathBuf::from("/repo"),
        });
        assert_eq!(exit_code_for(&traversal), USAGE_EXIT_CODE);

        let other = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&other), GENERIC_FAILURE_EXIT_CODE);
    }
}
