//! Ultraviolet entrypoint: parse the one flag, load configs, run.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ultraviolet::config::{self, DEFAULT_CONFIG_DIR, MAIN_CONFIG_FILE, SERVER_CONFIG_DIR};

#[derive(Debug, Parser)]
#[command(name = "ultraviolet", about = "Minecraft reverse proxy", version)]
struct Args {
    /// Path to the config directory.
    #[arg(long = "configs", default_value = DEFAULT_CONFIG_DIR)]
    configs: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let main_cfg = match config::read_ultraviolet_config(&args.configs.join(MAIN_CONFIG_FILE)) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to read main config");
            return ExitCode::FAILURE;
        }
    };

    let (server_cfgs, errors) =
        config::read_server_configs(&args.configs.join(SERVER_CONFIG_DIR));
    if let Some(err) = errors.first() {
        // Bad config files are fatal at startup; at reload they are
        // logged and skipped.
        error!(error = %err, "failed to read server configs");
        return ExitCode::FAILURE;
    }

    match ultraviolet::run(main_cfg, server_cfgs, &args.configs).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal");
            ExitCode::FAILURE
        }
    }
}
