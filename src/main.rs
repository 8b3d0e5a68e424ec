// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use codescan::Config;
use codescan::backends::capture::BackendKind;

mod cli;

#[derive(Parser)]
#[command(name = "codescan")]
#[command(about = "Real-time optical code scanner for inventory tracking")]
#[command(version = env!("GIT_VERSION"))]
#[command(subcommand_required = false)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available cameras
    List,

    /// Scan one inventory code and print it
    Scan {
        /// Camera device id to use (from 'codescan list')
        #[arg(short, long)]
        camera: Option<String>,

        /// Capture backend override
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        /// Turn the torch on at session start
        #[arg(short, long)]
        torch: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum BackendArg {
    V4l2,
    Virtual,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::V4l2 => BackendKind::V4l2,
            BackendArg::Virtual => BackendKind::Virtual,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=codescan=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let args = Cli::parse();
    let config = Config::load();

    match args.command {
        Some(Commands::List) => cli::list_cameras(&config),
        Some(Commands::Scan {
            camera,
            backend,
            torch,
        }) => cli::scan(config, camera, backend.map(Into::into), torch),
        None => cli::scan(config, None, None, false),
    }
}
