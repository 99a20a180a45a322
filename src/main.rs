use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cmd;

const LOG_ENV: &str = "CONDUCTOR_LOG";
const DEFAULT_LOG_FILTER: &str = "conductor=info";

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Resumable, scope-checked execution of workstream manifests")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the .conductor state directory
    Init,
    /// Show the resolved execution order for a feature
    Plan {
        #[arg(short, long)]
        feature: String,
    },
    /// Execute (or resume) a feature's units in dependency order
    Run {
        #[arg(short, long)]
        feature: String,

        /// Shell command invoked once per unit attempt
        #[arg(long)]
        worker_cmd: Option<String>,

        /// Failures allowed per unit before it is blocked
        #[arg(long)]
        max_retries: Option<u32>,

        /// Per-unit timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Phase name passed to constraint evaluation
        #[arg(long)]
        phase: Option<String>,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// Show per-unit status from the checkpoint
    Status {
        #[arg(short, long)]
        feature: String,
    },
    /// Clear a feature's checkpoint (the evidence log is kept)
    Reset {
        #[arg(short, long)]
        feature: String,

        #[arg(long)]
        force: bool,
    },
    /// Check changed files against a unit's declared scope
    Scope {
        #[arg(short, long)]
        feature: String,

        #[arg(short, long)]
        unit: String,

        /// Check staged files instead of the working tree
        #[arg(long, conflicts_with = "base")]
        staged: bool,

        /// Check files changed since this ref
        #[arg(long)]
        base: Option<String>,
    },
    /// Evaluate one action against the constraint rules
    Constraint {
        #[arg(long, default_value = "*")]
        phase: String,

        #[arg(long, conflicts_with = "path", required_unless_present = "path")]
        command: Option<String>,

        #[arg(long)]
        path: Option<String>,

        /// Rules file (defaults to the configured one)
        #[arg(long)]
        rules: Option<PathBuf>,
    },
    /// Inspect a feature's evidence log
    Evidence {
        #[command(subcommand)]
        command: EvidenceCommands,
    },
    /// Produce an attestation statement for a branch diff
    Attest {
        #[arg(long, default_value = "main")]
        base: String,

        #[arg(long, default_value = "HEAD")]
        head: String,

        /// Pull request number
        #[arg(long)]
        pr: Option<u64>,

        #[arg(long, requires = "pr")]
        pr_url: Option<String>,

        /// Write the statement here, replacing any existing file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write a markdown report here
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum EvidenceCommands {
    /// Verify the hash chain
    Verify {
        #[arg(short, long)]
        feature: String,
    },
    /// Print events
    Show {
        #[arg(short, long)]
        feature: String,

        /// Only the last N events
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

/// Console output goes to stderr so stdout stays parseable; the file layer
/// is skipped when the project has no `.conductor/logs` yet.
fn init_logging(
    project_dir: &Path,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = || {
        if verbose {
            tracing_subscriber::EnvFilter::new("conductor=debug")
        } else {
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into())
        }
    };

    let mut guard = None;
    let log_dir = project_dir
        .join(conductor::conductor_config::STATE_DIR)
        .join("logs");
    let file_layer = if log_dir.is_dir() {
        let file_appender = tracing_appender::rolling::daily(&log_dir, "conductor.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(env_filter()),
        )
    } else {
        None
    };

    let console_filter = if verbose {
        env_filter()
    } else {
        tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("conductor=warn"))
    };
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}

async fn dispatch(cli: &Cli, project_dir: PathBuf) -> Result<i32> {
    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir),
        Commands::Plan { feature } => cmd::cmd_plan(&project_dir, feature, cli.json),
        Commands::Run {
            feature,
            worker_cmd,
            max_retries,
            timeout,
            phase,
            ui,
        } => {
            let overrides = conductor::conductor_config::CliOverrides {
                max_retries: *max_retries,
                unit_timeout_secs: *timeout,
                worker_cmd: worker_cmd.clone(),
                phase: phase.clone(),
            };
            let mode = if cli.json {
                conductor::ui::UiMode::Json
            } else {
                conductor::ui::UiMode::parse(ui)
            };
            cmd::cmd_run(&project_dir, feature, overrides, mode, cli.verbose).await
        }
        Commands::Status { feature } => cmd::cmd_status(&project_dir, feature, cli.json),
        Commands::Reset { feature, force } => cmd::cmd_reset(&project_dir, feature, *force),
        Commands::Scope {
            feature,
            unit,
            staged,
            base,
        } => cmd::cmd_scope(
            &project_dir,
            feature,
            unit,
            *staged,
            base.as_deref(),
            cli.json,
        ),
        Commands::Constraint {
            phase,
            command,
            path,
            rules,
        } => {
            let action = match (command, path) {
                (Some(c), _) => conductor::constraints::Action::Command(c.clone()),
                (None, Some(p)) => conductor::constraints::Action::Path(p.clone()),
                (None, None) => anyhow::bail!("one of --command or --path is required"),
            };
            cmd::cmd_constraint(&project_dir, phase, &action, rules.as_deref(), cli.json)
        }
        Commands::Evidence { command } => cmd::cmd_evidence(&project_dir, command, cli.json),
        Commands::Attest {
            base,
            head,
            pr,
            pr_url,
            output,
            report,
        } => cmd::cmd_attest(
            &project_dir,
            cmd::AttestArgs {
                base,
                head,
                pr: *pr,
                pr_url: pr_url.as_deref(),
                output: output.as_deref(),
                report: report.as_deref(),
            },
            cli.json,
        ),
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("Failed to get current directory"),
    };

    let code = match project_dir {
        Ok(project_dir) => {
            let guard = init_logging(&project_dir, cli.verbose);
            let code = match dispatch(&cli, project_dir).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    1
                }
            };
            // Flush the file appender before exiting
            drop(guard);
            code
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    std::process::exit(code);
}
