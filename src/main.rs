//! Mount a directory of compressed files as an ordinary read/write filesystem.
use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, error};

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;
use compressfs::codec::Codec;
use compressfs::fs::OpenPolicy;

#[derive(Parser)]
#[command(
    version,
    about = "Transparently compressing filesystem.",
    after_help = "Never change the codec of a backend once it holds files: existing files would \
                  become unreadable."
)]
struct Args {
    /// Directory holding the compressed files.
    backend: PathBuf,

    /// Where to mount the uncompressed view.
    mountpoint: PathBuf,

    /// Compression codec of the backend.
    #[arg(value_enum)]
    codec: Codec,

    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a compressfs config TOML."
    )]
    config_path: Option<PathBuf>,

    /// Override how concurrent opens of one file are arbitrated.
    #[arg(long, value_enum)]
    open_policy: Option<OpenPolicy>,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load(
        args.backend,
        args.mountpoint,
        args.codec,
        args.config_path.as_deref(),
    )
    .unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Some(policy) = args.open_policy {
        config.cache.open_policy = policy;
    }

    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });

    debug!(config = ?config, "Starting with configuration...");
    if let Err(e) = daemon::spawn(config) {
        error!("{e}");
        std::process::exit(1);
    }
}
