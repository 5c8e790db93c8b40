//! `janusd`, the object-bridge daemon binary.

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use janus::server::{self, exit_codes};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    match server::run().await {
        Ok(()) => ExitCode::from(u8::try_from(exit_codes::OK).unwrap_or(0)),
        Err(e) => {
            tracing::error!("janusd failed: {e:#}");
            let code = if e.to_string().contains("cannot bind") {
                exit_codes::BIND_FAILED
            } else if e.to_string().contains("TLS") || e.to_string().contains("allow-list") {
                exit_codes::AUTH_SETUP
            } else {
                exit_codes::INTERNAL
            };
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
