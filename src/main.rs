// src/main.rs

mod config;
mod engine;
mod gate;
mod geometry;
mod metrics;
mod pipeline;
mod source;
mod stream;
mod supervisor;
mod track;
mod types;
mod worker;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use supervisor::Supervisor;
use tracing::info;
use types::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Supervise one worker process per config file in a directory.
    Master,
    /// Run a single channel from one config file.
    Slave,
}

/// Directional tripwire counting for video streams.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Master)]
    mode: Mode,

    /// Config directory (master) or a single config file (slave).
    #[arg(long)]
    config: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("cannot install signal handler")?;

    match args.mode {
        Mode::Master => {
            if !args.config.is_dir() {
                bail!("master mode needs a config directory, got {:?}", args.config);
            }
            let mut supervisor = Supervisor::from_dir(&args.config)?;
            supervisor.run(&stop);
        }
        Mode::Slave => {
            if !args.config.is_file() {
                bail!("slave mode needs a config file, got {:?}", args.config);
            }
            let config = Config::load(&args.config)?;
            info!("⚙️ channel '{}' from {:?}", config.name, args.config);
            worker::run(&config, &stop)?;
        }
    }

    Ok(())
}
