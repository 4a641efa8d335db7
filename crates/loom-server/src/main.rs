//! loom-server binary
//!
//! Operator tool for one persisted space.
//!
//! ```bash
//! loom-server --db space.db init --label main
//! loom-server --db space.db branches
//! loom-server --db space.db log --branch main --limit 20
//! loom-server --db space.db state --object doc:a
//! loom-server --db space.db fork --at <event-id> --reason "try another plan"
//! loom-server --db space.db demote --branch main
//! loom-server --db space.db designate-primary --branch f1
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use loom_kernel::LoomConfig;
use loom_server::admin;

#[derive(Parser, Debug)]
#[command(name = "loom-server", version, about = "Inspect and administer a persisted Loom space")]
struct Cli {
    /// Sqlite file holding the space.
    #[arg(long)]
    db: PathBuf,

    /// RON config file. Environment overrides apply on top.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a space with a root branch in an empty file.
    Init {
        #[arg(long)]
        label: Option<String>,
    },
    /// List branches.
    Branches,
    /// Show a branch's history, newest last.
    Log {
        /// Label or id prefix. Defaults to the primary branch.
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print an object's projected state as JSON.
    State {
        #[arg(long)]
        object: String,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Fork a new branch at an event.
    Fork {
        #[arg(long)]
        at: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        label: Option<String>,
    },
    /// Make a branch the primary of its fork set. Demote the current one first.
    DesignatePrimary {
        #[arg(long)]
        branch: String,
    },
    /// Clear a branch's primary flag.
    Demote {
        #[arg(long)]
        branch: String,
    },
}

fn main() -> ExitCode {
    let _telemetry = loom_telemetry::init_tracing("loom-server");
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => LoomConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => LoomConfig::default(),
    }
    .apply_env();

    let create = match &cli.command {
        Command::Init { label } => Some(label.clone()),
        _ => None,
    };
    let space = admin::open_space(&cli.db, &config, create)?;

    match cli.command {
        Command::Init { .. } => {
            println!("{}", space.id());
        }
        Command::Branches => {
            for line in admin::branch_lines(&space) {
                println!("{line}");
            }
        }
        Command::Log { branch, limit } => {
            let branch = admin::resolve_branch(&space, branch.as_deref())?;
            for line in admin::log_lines(&space, branch, limit)? {
                println!("{line}");
            }
        }
        Command::State { object, branch } => {
            let branch = admin::resolve_branch(&space, branch.as_deref())?;
            let state = admin::object_state(&space, &object, branch)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Fork { at, reason, label } => {
            let child = admin::fork_at(&space, &at, reason, label)?;
            println!("{}", child.branch_id);
        }
        Command::DesignatePrimary { branch } => {
            let branch = admin::resolve_branch(&space, Some(&branch))?;
            let ctx = space.designate_primary(branch)?;
            tracing::info!(branch = %ctx.branch_id, head = %ctx.last_event_id, "primary designated");
            println!("{}", ctx.branch_id);
        }
        Command::Demote { branch } => {
            let branch = admin::resolve_branch(&space, Some(&branch))?;
            space.demote(branch)?;
            tracing::info!(%branch, "primary flag cleared");
            println!("{branch}");
        }
    }
    Ok(())
}
