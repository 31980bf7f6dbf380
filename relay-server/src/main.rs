use relay_server::{AppState, load_config, serve};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
/// Activates error tracing, loads the room configuration, then binds the
/// relay port and serves connections until the process dies. One process
/// is one room; more rooms means more processes on their own ports.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true) // Module path (e.g. relay_server::session)
                .with_thread_ids(true) // Thread-ID (helpful for Tokio)
                .with_thread_names(true), // Thread-Name
        )
        .init();

    let config = match load_config().await {
        Ok(config) => config,
        Err(message) => {
            tracing::error!(message, "Initial config load error.");
            panic!("Initial config load error: {}", message);
        }
    };

    let state = Arc::new(AppState::new(config.clone()));
    let listener = tokio::net::TcpListener::bind((config.bind_addr.as_str(), config.port))
        .await
        .unwrap();
    tracing::info!(address = %config.bind_addr, port = config.port, "Relay server listening.");

    serve(listener, state).await;
}
