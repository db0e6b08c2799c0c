//! The booster pool daemon.

use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use prewarm::config::LauncherConfig;
use prewarm::daemon::{self, Supervisor};

#[derive(Debug, Parser)]
#[command(name = "prewarmd", about = "Keep warm booster processes ready to launch applications")]
struct DaemonArgs {
    /// Fork and go into the background
    #[arg(long)]
    daemon: bool,

    /// Do not print anything
    #[arg(long)]
    quiet: bool,

    /// Directory for the family sockets (overrides the rc file)
    #[arg(long, value_name = "DIR")]
    socket_dir: Option<PathBuf>,
}

fn main() {
    let args = match DaemonArgs::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            process::exit(1);
        }
        Err(e) => {
            // --help / --version
            let _ = e.print();
            process::exit(0);
        }
    };

    if let Err(e) = run(args) {
        eprintln!("prewarmd: {e:#}");
        process::exit(1);
    }
}

fn run(args: DaemonArgs) -> Result<()> {
    let mut config = LauncherConfig::load();
    if let Some(dir) = args.socket_dir.clone() {
        config.socket_dir = dir;
    }

    if args.quiet {
        daemon::console_quiet()?;
    }
    if args.daemon {
        daemon::daemonize()?;
    }
    init_logging(&args, &config);

    Supervisor::new(config)?.run()
}

/// Console logging by default, the configured file when daemonized, nothing
/// when quieted. A subscriber that cannot be built is skipped rather than
/// fatal.
fn init_logging(args: &DaemonArgs, config: &LauncherConfig) {
    if args.quiet {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if args.daemon {
        let Ok(file) = File::options()
            .create(true)
            .append(true)
            .open(&config.log_file)
        else {
            return;
        };
        let file = Arc::new(file);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(move || Arc::clone(&file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
