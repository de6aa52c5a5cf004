use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use poem::listener::TcpListener;
use poem::Server;
use rgm_stream::config::Cli;
use rgm_stream::controller::PollingController;
use rgm_stream::hub::SubscriberHub;
use rgm_stream::logging;
use rgm_stream::monitor::NvmlSource;
use rgm_stream::server::{self, AppState};
use tokio_util::sync::CancellationToken;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(cli.log_file.as_deref()).context("failed to initialize logging")?;

    tracing::info!("Starting rgm-stream {}", env!("CARGO_PKG_VERSION"));

    let hub = SubscriberHub::default();
    let controller = PollingController::new(
        NvmlSource::new(),
        hub.clone(),
        hub.clone(),
        cli.poller_config(),
    );
    let state = AppState {
        hub,
        status: controller.status(),
    };

    let shutdown = CancellationToken::new();
    let poll_shutdown = shutdown.clone();
    let poller = tokio::spawn(async move {
        // not restarted: a wedged driver needs an operator or supervisor
        if let Err(e) = controller.run(poll_shutdown).await {
            tracing::error!("GPU polling task ended: {}", e);
        }
    });

    let addr = cli.listen_addr();
    tracing::info!(%addr, "HTTP server listening");
    let served = Server::new(TcpListener::bind(addr))
        .run_with_graceful_shutdown(
            server::routes(state),
            shutdown_signal(),
            Some(Duration::from_secs(5)),
        )
        .await
        .context("HTTP server failed");

    shutdown.cancel();
    poller.await.context("GPU polling task panicked")?;
    served?;

    tracing::info!("rgm-stream stopped");
    Ok(())
}
