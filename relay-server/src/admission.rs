//! Admission of fresh connections. The sequence on the raw socket is the
//! one the original protocol prescribes: the server presents the session
//! win tally, the client acknowledges, the server presents the ready
//! roster, the client answers with its display name and becomes part of
//! the room.

use crate::room::{AppState, ClientId, StateSlot};
use crate::session::read_frame;
use bytes::Bytes;
use protocol::{ACK, CONTROL_BUFFER_SIZE, CONTROL_TEXT, Frame, FrameCodec, READY_ROSTER, SERVER_ERROR, WIN_TALLY};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Everything a finished handshake hands over to the session tasks.
pub struct AdmittedClient {
    pub id: ClientId,
    pub name: String,
    /// Receiving side of the control outbox, owned by the writer task.
    pub outbox: mpsc::Receiver<Bytes>,
    pub slot: Arc<StateSlot>,
}

/// Is called on error, sends a last explanation and closes the socket.
async fn send_closing_message(stream: &mut TcpStream, closing_message: String) {
    let frame = Frame::text(SERVER_ERROR, &closing_message);
    let _ = stream.write_all(&frame.encode_to_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Performs the whole admission handshake. `None` means the connection is
/// already closed and the caller can simply return. The codec is handed in
/// so bytes the client sent early are not lost to the session loop.
pub async fn admit_client(
    stream: &mut TcpStream,
    codec: &mut FrameCodec,
    state: &Arc<AppState>,
) -> Option<AdmittedClient> {
    // Step one: the session win tally.
    let tally = state.room.lock().await.win_tally();
    let tally_frame = Frame::binary(WIN_TALLY, &tally).expect("Could not serialize win tally.");
    if stream
        .write_all(&tally_frame.encode_to_bytes())
        .await
        .is_err()
    {
        tracing::warn!("Connection lost before the win tally went out.");
        return None;
    }

    // Step two: any acknowledgment from the client.
    match read_frame(stream, codec).await {
        Ok(frame) if frame.tag == ACK => {}
        Ok(frame) => {
            tracing::warn!(tag = frame.tag, "Expected an acknowledgment during admission.");
            send_closing_message(stream, "Protocol error during admission.".into()).await;
            return None;
        }
        Err(err) => {
            tracing::warn!(?err, "Connection lost awaiting the admission acknowledgment.");
            return None;
        }
    }

    // Step three: the names that are currently ready.
    let roster = state.room.lock().await.ready_names();
    let roster_frame = Frame::binary(READY_ROSTER, &roster).expect("Could not serialize roster.");
    if stream
        .write_all(&roster_frame.encode_to_bytes())
        .await
        .is_err()
    {
        tracing::warn!("Connection lost before the ready roster went out.");
        return None;
    }

    // Step four: the display name.
    let name = match read_frame(stream, codec).await {
        Ok(frame) if frame.tag == CONTROL_TEXT => frame.payload_text().trim().to_string(),
        Ok(frame) => {
            tracing::warn!(tag = frame.tag, "Expected a display name during admission.");
            send_closing_message(stream, "Protocol error during admission.".into()).await;
            return None;
        }
        Err(err) => {
            tracing::warn!(?err, "Connection lost awaiting the display name.");
            return None;
        }
    };
    if name.is_empty() {
        send_closing_message(stream, "Empty display names are not allowed.".into()).await;
        return None;
    }

    // Admit under the lock and announce the newcomer.
    let (outbox_tx, outbox_rx) = mpsc::channel(CONTROL_BUFFER_SIZE);
    let slot = Arc::new(StateSlot::default());
    let (id, player_count) = {
        let mut room = state.room.lock().await;
        let max_players = state.config.max_players;
        if max_players != 0 && room.player_count() >= max_players as usize {
            drop(room);
            send_closing_message(
                stream,
                format!("Room exceeded the maximum of {} players.", max_players),
            )
            .await;
            return None;
        }
        let id = room.admit(name.clone(), outbox_tx, slot.clone());
        (id, room.player_count())
    };

    tracing::info!(player = %name, id, "Player joined the room.");
    state
        .reporter
        .player_count(&state.config.room_addr, player_count);

    Some(AdmittedClient {
        id,
        name,
        outbox: outbox_rx,
        slot,
    })
}
