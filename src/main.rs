#![forbid(unsafe_code)]

//! `cgi-bridge`: serve one CGI program over HTTP.
//!
//! Loads the TOML configuration, builds the bridge, and serves every request
//! path through it until Ctrl-C or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use cgi_bridge::bridge::mux::MultiplexerChoice;
use cgi_bridge::config::BridgeConfig;
use cgi_bridge::{http, AppError, CgiBridge, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "cgi-bridge", about = "Serve a CGI program over HTTP", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the listen address from the configuration.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override the output demultiplexing strategy.
    #[arg(long, value_enum)]
    multiplexer: Option<MultiplexerChoice>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("cgi-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = BridgeConfig::load_from_path(&args.config)?;

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(choice) = args.multiplexer {
        config.multiplexer = choice;
    }

    let bridge = CgiBridge::from_config(&config)?;
    info!(
        command = bridge.command(),
        strategy = ?bridge.strategy(),
        merge_stderr = config.merge_stderr,
        "configuration loaded"
    );

    http::serve(bridge, config.server).await
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
