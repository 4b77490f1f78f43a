//! Dashboard gateway binary.
//!
//! Reads its configuration from the environment (see [`dashgate::config`]),
//! serves the built dashboard and forwards `/api` calls until SIGINT or
//! SIGTERM, then lets in-flight requests finish.
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `RUST_LOG` | `info` | log filter (tracing-subscriber) |
//! | `LOG_FORMAT` | `text` | `text` or `json` |

use std::process::ExitCode;
use std::sync::Arc;

use dashgate::config::{ReadEnv, SystemEnv};
use dashgate::{App, GatewayConfig, Request, Server};
use tracing_subscriber::EnvFilter;

fn init_tracing(env: &impl ReadEnv) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env
        .var("LOG_FORMAT")
        .is_ok_and(|v| v.trim().eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
///
/// Cloud Run and Kubernetes stop containers with SIGTERM. The SIGTERM handler
/// is installed when this is called, not when the future is first polled.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());

    async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
            tracing::info!("received SIGINT");
        };

        #[cfg(unix)]
        let terminate = async {
            match sigterm {
                Ok(mut signal) => {
                    signal.recv().await;
                    tracing::info!("received SIGTERM");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing(&SystemEnv);

    let config = match GatewayConfig::from_env(&SystemEnv) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration, refusing to start");
            return ExitCode::FAILURE;
        }
    };

    let app = match App::new(&config) {
        Ok(app) => Arc::new(app),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize gateway");
            return ExitCode::FAILURE;
        }
    };

    // Installed before binding so a stop request never finds the default handler.
    let shutdown = shutdown_signal();

    let server = match Server::bind(config.listen_addr()).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        address = %server.local_addr(),
        upstream = config.target_base_url(),
        prefix = config.prefix(),
        "dashboard gateway starting"
    );

    let handler = move |req: Request| {
        let app = Arc::clone(&app);
        async move { app.handle(req).await }
    };

    match server.run_until(handler, shutdown).await {
        Ok(()) => {
            tracing::info!("dashboard gateway stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}
