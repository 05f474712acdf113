use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use srm::builtin;
use srm::config::OPTION_PREFIX;
use srm::distributed::DEFAULT_PORT;
use srm::{Config, JobRegistry, Worker};

/// Serve jobs for any master that connects
#[derive(Parser)]
struct WorkerArgs {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Directory for intermediate files; overrides the master's setting
    #[arg(short, long)]
    dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let (options, rest): (Vec<String>, Vec<String>) = std::env::args().partition(|a| a.starts_with(OPTION_PREFIX));
    let args = WorkerArgs::parse_from(rest);

    // -SRM:LocalDir is honoured when --dir is absent
    let defaults = Config::from_args(&options)?;
    let local_dir = args.dir.unwrap_or(defaults.local_dir);

    let mut registry = JobRegistry::new();
    builtin::register_builtins(&mut registry)?;

    let worker = Worker::bind((args.bind.as_str(), args.port), Arc::new(registry), &local_dir)?;
    info!(
        "srm worker ready on {}, files in {}",
        worker.local_addr()?,
        local_dir.display()
    );
    worker.serve()?;
    Ok(())
}
