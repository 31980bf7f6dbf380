//! The relay of one game room: accepts player connections on a fixed TCP
//! port, synchronizes the match start, forwards board snapshots between
//! the opponents with latest-wins delivery and settles win, loss and
//! forfeit. Match outcomes go to the external profile service on a best
//! effort basis. The library target exists so the integration tests can
//! run the real accept loop on an ephemeral port.

pub mod admission;
pub mod config;
pub mod room;
pub mod session;

pub use config::{CONFIG_FILE, RelayConfig, load_config};
pub use room::{AppState, Room, RoomPhase};

use std::sync::Arc;
use tokio::net::TcpListener;

/// Accepts connections forever and spawns one session per socket. Runs as
/// its own task so admission never blocks the running sessions.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "Accepted connection.");
                tokio::spawn(session::handle_connection(stream, state.clone()));
            }
            Err(err) => {
                tracing::warn!(?err, "Accepting a connection failed.");
            }
        }
    }
}
