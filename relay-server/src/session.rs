//! One admitted connection: a reader task that dispatches inbound frames
//! and a writer task that owns the socket's write half. Nothing else ever
//! writes to the socket, so frames can not interleave. If either task
//! finishes, the other gets aborted and the connection is cleaned up.

use crate::admission;
use crate::room::{AppState, ClientId, OutcomeReport, StateSlot};
use bytes::Bytes;
use protocol::{
    ACK, BOARD_STATE, BoardSnapshot, CONTROL_TEXT, ControlCommand, Frame, FrameCodec, TOP_OUT,
    parse_control,
};
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

/// Reads until one complete frame is buffered. `UnexpectedEof` flags the
/// peer closing the connection.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: &mut FrameCodec,
) -> io::Result<Frame> {
    loop {
        if let Some(frame) = codec.decode_next()? {
            return Ok(frame);
        }
        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            ));
        }
        codec.feed(&chunk[..n]);
    }
}

/// Does the whole handling from start to finish: admission handshake,
/// reader and writer tasks, cleanup.
pub async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(?err, "Could not disable Nagle on the client socket.");
    }

    let mut codec = FrameCodec::new();
    let Some(admitted) = admission::admit_client(&mut stream, &mut codec, &state).await else {
        // The handshake already said goodbye on the socket.
        return;
    };
    let admission::AdmittedClient {
        id,
        name,
        outbox,
        slot,
    } = admitted;

    let (read_half, write_half) = stream.into_split();
    let mut send_task = tokio::spawn(write_loop(write_half, outbox, slot));
    let mut receive_task = tokio::spawn(read_loop(read_half, codec, state.clone(), id));

    // If any one of the tasks runs to completion, we abort the other.
    let result = tokio::select! {
        res_a = &mut send_task => { receive_task.abort(); res_a },
        res_b = &mut receive_task => { send_task.abort(); res_b },
    };

    let reason = result.unwrap_or_else(|err| {
        tracing::error!(?err, "Internal panic in session logic.");
        "Internal panic in session logic."
    });

    cleanup(&state, id, &name, reason).await;
}

/// The single owner of the write half. Control frames have priority over
/// the pending-state slot, a verdict never queues behind a board frame.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Bytes>,
    slot: Arc<StateSlot>,
) -> &'static str {
    loop {
        tokio::select! {
            biased;
            maybe = outbox.recv() => {
                let Some(payload) = maybe else {
                    // The room dropped our handle, the connection is done.
                    return "Control outbox closed.";
                };
                if let Err(err) = writer.write_all(&payload).await {
                    tracing::debug!(?err, "Error writing a control frame.");
                    return "Error in communication with client endpoint.";
                }
            }
            _ = slot.armed() => {
                if let Some(payload) = slot.take().await {
                    if let Err(err) = writer.write_all(&payload).await {
                        tracing::debug!(?err, "Error flushing the state slot.");
                        return "Error in communication with client endpoint.";
                    }
                }
            }
        }
    }
}

/// Reads and dispatches inbound frames. Every read carries the configured
/// timeout; when it elapses while this client participates in a running
/// match that has been going for at least one timeout span, the silence is
/// a forfeit. Outside of that the elapse simply re-enters the read, which
/// keeps idle lobby connections open indefinitely.
async fn read_loop(
    mut reader: OwnedReadHalf,
    mut codec: FrameCodec,
    state: Arc<AppState>,
    id: ClientId,
) -> &'static str {
    let forfeit_after = Duration::from_millis(state.config.read_timeout_ms);
    loop {
        match tokio::time::timeout(forfeit_after, read_frame(&mut reader, &mut codec)).await {
            Ok(Ok(frame)) => {
                if let Some(reason) = dispatch_frame(&state, id, frame).await {
                    return reason;
                }
            }
            Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return "Connection closed by peer.";
            }
            Ok(Err(err)) => {
                tracing::error!(?err, client = id, "Error reading from client.");
                return "Connection lost.";
            }
            Err(_elapsed) => {
                let mut room = state.room.lock().await;
                // The grace condition keeps a match from ending before the
                // participants had a full timeout span to send anything.
                if room.is_running_participant(id)
                    && room
                        .running_for()
                        .is_some_and(|runtime| runtime >= forfeit_after)
                {
                    // Silence counts as a forfeit, not as a broken socket.
                    // The connection itself stays up.
                    tracing::info!(
                        client = id,
                        "Participant silent during a running match, forfeits."
                    );
                    let reports = room.resolve(id).await;
                    drop(room);
                    report_outcomes(&state, &reports);
                }
            }
        }
    }
}

/// Routes one inbound frame. `Some` ends the session with the returned
/// reason, malformed frames only get logged and dropped.
async fn dispatch_frame(
    state: &Arc<AppState>,
    id: ClientId,
    frame: Frame,
) -> Option<&'static str> {
    match frame.tag {
        CONTROL_TEXT => {
            let text = frame.payload_text();
            match parse_control(&text) {
                ControlCommand::ReadyToggle { .. } => {
                    let mut room = state.room.lock().await;
                    let quorum_reached = room.toggle_ready(id);
                    // The original forwarded the toggle text to everyone, so
                    // clients can mirror each other's ready state.
                    room.broadcast_control(frame.encode_to_bytes());
                    if quorum_reached {
                        room.begin_start(epoch_stamp());
                    }
                    None
                }
                ControlCommand::Disconnect => Some("Client disconnected intentionally"),
                ControlCommand::Notice(_) => {
                    // Declined invites and the like are upstream concerns,
                    // the relay passes them on verbatim.
                    let room = state.room.lock().await;
                    room.broadcast_control(frame.encode_to_bytes());
                    None
                }
            }
        }
        ACK => {
            state.room.lock().await.ack_start(id);
            None
        }
        BOARD_STATE => {
            match postcard::from_bytes::<BoardSnapshot>(&frame.payload) {
                Ok(snapshot) => {
                    let raw = frame.encode_to_bytes();
                    state
                        .room
                        .lock()
                        .await
                        .apply_snapshot(id, raw, snapshot.lines_sent)
                        .await;
                }
                Err(err) => {
                    // A malformed frame never terminates the connection.
                    tracing::warn!(?err, client = id, "Malformed board snapshot dropped.");
                }
            }
            None
        }
        TOP_OUT => {
            let reports = state.room.lock().await.resolve(id).await;
            report_outcomes(state, &reports);
            None
        }
        tag => {
            tracing::warn!(tag, client = id, "Illegal frame tag from client.");
            None
        }
    }
}

/// Hands the match outcomes to the profile reporter. Fire and forget, the
/// room reset never waits for the service.
fn report_outcomes(state: &AppState, reports: &[OutcomeReport]) {
    for report in reports {
        state.reporter.game_result(&report.name, report.won);
        state
            .reporter
            .apm(&report.name, report.attacks, report.elapsed_secs);
    }
}

/// Removes the client from the room. A participant vanishing mid-match
/// forfeits it first, then the departure is broadcast and the profile
/// service learns the new player count.
async fn cleanup(state: &Arc<AppState>, id: ClientId, name: &str, reason: &'static str) {
    let (reports, removed, player_count) = {
        let mut room = state.room.lock().await;
        let reports = room.resolve(id).await;
        let removed = room.remove(id);
        (reports, removed, room.player_count())
    };
    report_outcomes(state, &reports);
    if removed.is_some() {
        tracing::info!(player = %name, reason, "Connection closed.");
        state
            .reporter
            .player_count(&state.config.room_addr, player_count);
    }
}

/// The shared start timestamp: epoch seconds as a decimal string, so both
/// opponents compute elapsed time from the same number.
fn epoch_stamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
