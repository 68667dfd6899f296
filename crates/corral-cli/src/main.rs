//! corral -- supervise a fleet of terminal AI coding agents.
//!
//! The default invocation loads the persisted fleet and runs the
//! supervisor loop headless; front-ends drive the supervisor through its
//! library API. `reset` wipes all persisted state, `debug` prints paths.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use corral_daemon::{Store, Supervisor};
use corral_git::Worktree;
use corral_mux::{tmux_available, SystemTmux};
use corral_session::InstanceContext;
use corral_types::{config_dir, Config};

const LOG_FILE_NAME: &str = "corral.log";

/// corral -- keep a small herd of coding agents working in their own panes.
#[derive(Parser, Debug)]
#[command(name = "corral", version, about)]
struct Cli {
    /// Program to run in new instances (persisted as the default)
    #[arg(long)]
    program: Option<String>,

    /// Automatically press Enter when new instances show a prompt
    #[arg(long)]
    autoyes: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Delete the persisted fleet, including instance branches and worktrees
    Reset,

    /// Print configuration and state file paths
    Debug,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_dir = match config_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("corral: {e}");
            return ExitCode::from(1);
        }
    };

    init_logging(&config_dir);

    let mut config = Config::load(&config_dir);
    if let Some(program) = cli.program {
        config.default_program = program;
        if let Err(e) = config.save(&config_dir) {
            warn!(error = %e, "failed to persist --program to config");
        }
    }
    if cli.autoyes {
        config.auto_yes = true;
    }

    match cli.command {
        Some(Commands::Reset) => reset(&config_dir),
        Some(Commands::Debug) => {
            print_debug(&config_dir);
            ExitCode::SUCCESS
        }
        None => run(config, &config_dir),
    }
}

/// Route logs to a scratch file under the config dir; the terminal belongs
/// to the UI.
fn init_logging(config_dir: &std::path::Path) {
    let _ = std::fs::create_dir_all(config_dir);
    let log_path = config_dir.join(LOG_FILE_NAME);
    match std::fs::File::options()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(e) => {
            eprintln!("corral: failed to open log file {}: {e}", log_path.display());
        }
    }
}

fn run(config: Config, config_dir: &std::path::Path) -> ExitCode {
    if !tmux_available() {
        eprintln!("corral: tmux is not installed or not on PATH");
        return ExitCode::from(1);
    }

    let home = match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home),
        Err(_) => {
            eprintln!("corral: HOME environment variable not set");
            return ExitCode::from(1);
        }
    };

    let ctx = InstanceContext {
        mux: Arc::new(SystemTmux::new()),
        branch_prefix: config.branch_prefix.clone(),
        worktrees_root: config_dir.join("worktrees"),
        agent_home: home,
    };

    let store = Store::new(config_dir);
    let mut supervisor = Supervisor::new(config, ctx, store);
    info!(instances = supervisor.instances().len(), "corral started");

    // Runs until the process is interrupted; the loop persists the fleet
    // on each mutating operation, so a hard kill loses at most one tick.
    let shutdown = AtomicBool::new(false);
    supervisor.run_loop(&shutdown);
    ExitCode::SUCCESS
}

/// Tear down every persisted instance: branch, worktree, snapshot, config
/// stays.
fn reset(config_dir: &std::path::Path) -> ExitCode {
    let store = Store::new(config_dir);
    let mut failed = false;

    for snap in store.load() {
        let worktree = Worktree::from_record(snap.worktree);
        if worktree.branch().is_empty() {
            continue;
        }
        if let Err(e) = worktree.cleanup() {
            error!(instance = %snap.title, error = %e, "failed to clean up instance worktree");
            eprintln!("corral: failed to clean up '{}': {e}", snap.title);
            failed = true;
        }
    }

    if let Err(e) = store.delete() {
        eprintln!("corral: {e}");
        failed = true;
    }

    if failed {
        ExitCode::from(1)
    } else {
        println!("corral: removed persisted instances");
        ExitCode::SUCCESS
    }
}

fn print_debug(config_dir: &std::path::Path) {
    println!("config dir:    {}", config_dir.display());
    println!(
        "config file:   {}",
        config_dir.join(corral_types::config::CONFIG_FILE_NAME).display()
    );
    println!(
        "snapshot file: {}",
        config_dir.join(corral_daemon::store::SNAPSHOT_FILE_NAME).display()
    );
    println!("worktrees:     {}", config_dir.join("worktrees").display());
    println!("log file:      {}", config_dir.join(LOG_FILE_NAME).display());
}
