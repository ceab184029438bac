//! Binary entry point: load configuration, initialize tracing, serve.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 unrecoverable
//! runtime error.

use std::process::ExitCode;

use clap::Parser;
use relay_core::RelayConfig;
use relay_gateway::RelayApp;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "otp-relay", about = "OTP bridge: edge SMS to Telegram/email delivery")]
struct Cli {
    /// Address the HTTP facade binds to.
    #[arg(long, env = "HTTP_BIND")]
    bind: Option<String>,

    /// Tracing filter, e.g. `info` or `relay_queue=debug,info`.
    #[arg(long, env = "RELAY_LOG", default_value = "info")]
    log_filter: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.log_filter.clone()))
        .init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "configuration error");
            return ExitCode::from(1);
        }
    };
    let bind = cli.bind.clone().unwrap_or_else(|| config.http_bind.clone());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "failed to start async runtime");
            return ExitCode::from(2);
        }
    };

    // Component construction only validates configuration (keys, dispatcher
    // endpoints); failures here are configuration errors, not runtime ones.
    let app = match RelayApp::build(config) {
        Ok(app) => app,
        Err(error) => {
            tracing::error!(%error, "configuration error");
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(relay_gateway::serve(app, &bind));

    match result {
        Ok(()) => {
            tracing::info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(%error, "unrecoverable runtime error");
            ExitCode::from(2)
        }
    }
}
