use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use drowsy_backend::{app, logging, AppState, Config, GrpcConnector};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    logging::init_tracing(&config.logging.level);

    tracing::info!("Starting Drowsiness Gateway ({})", config.server.environment);

    // Dial the scoring backend; the gateway starts even if this fails
    let connector = Arc::new(GrpcConnector::new(config.backend.clone()));
    let state = Arc::new(AppState::new(config.clone(), connector).await);

    if state.gateway.health_check().await {
        tracing::info!("Scoring backend at {} is healthy", state.gateway.target());
    } else {
        tracing::warn!(
            "Scoring backend at {} is {}, frames will be refused until POST /api/backend/redial",
            state.gateway.target(),
            state.gateway.state()
        );
    }

    let router = app(state.clone());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    state.shutdown().await;
}
