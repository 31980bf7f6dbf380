//! The room every connection of this process belongs to. It owns the
//! registry, the ready set, the pending-state slots and the penalty
//! ledgers behind a single mutex, because all of them mutate in the same
//! causal step (a removal touches every one of them).
//!
//! Lifecycle: `Waiting -> Starting -> Running -> back to Waiting`. The
//! ready check of the protocol is simply `Waiting` with a non-empty ready
//! set, and game-over resolution completes under the lock before the phase
//! lands in `Waiting` again.

use crate::config::RelayConfig;
use bytes::Bytes;
use profile_client::{ProfileClient, ProfileReporter};
use protocol::{
    Frame, GAME_STARTED, GameVerdict, PLAYER_JOINED, PLAYER_LEFT, PenaltyLedger, PlayerStanding,
    READY_QUORUM, START_STAMP, VERDICT,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify, mpsc};

/// Stable identifier of one admitted connection.
pub type ClientId = u16;

/// The single pending-state slot of one connection. A newer payload
/// overwrites an undelivered older one, so a slow consumer skips frames
/// instead of falling behind without bound.
#[derive(Default)]
pub struct StateSlot {
    cell: Mutex<Option<Bytes>>,
    notify: Notify,
}

impl StateSlot {
    /// Stores a payload, replacing whatever was still pending.
    pub async fn offer(&self, payload: Bytes) {
        *self.cell.lock().await = Some(payload);
        self.notify.notify_one();
    }

    /// Removes and returns the pending payload.
    pub async fn take(&self) -> Option<Bytes> {
        self.cell.lock().await.take()
    }

    /// Drops a pending payload without delivering it.
    pub async fn clear(&self) {
        *self.cell.lock().await = None;
    }

    /// Resolves once a payload has been offered since the last `take`.
    pub async fn armed(&self) {
        self.notify.notified().await;
    }
}

/// Everything the room keeps per admitted connection.
pub struct ClientHandle {
    /// Display name received during admission.
    pub name: String,
    /// Whether the player currently sits in the ready set.
    pub ready: bool,
    /// Matches won since the connection was admitted.
    pub wins: u32,
    /// Relay-side mirror of the penalty line exchange.
    pub ledger: PenaltyLedger,
    /// Total penalty lines produced this match, reported as APM afterwards.
    pub attacks: u64,
    outbox: mpsc::Sender<Bytes>,
    slot: Arc<StateSlot>,
}

impl ClientHandle {
    /// Queues a control frame for the writer task. The outbox is bounded;
    /// when it overflows the frame is dropped with a warning rather than
    /// stalling the room.
    fn push_control(&self, payload: Bytes) {
        if let Err(err) = self.outbox.try_send(payload) {
            tracing::warn!(player = %self.name, ?err, "Control outbox full, dropping frame.");
        }
    }
}

/// Match lifecycle of the room.
pub enum RoomPhase {
    /// No match running. Players connect, chat and toggle readiness.
    Waiting,
    /// Quorum reached, the start handshake is in flight. `pending` holds
    /// the participants that still owe us their acknowledgment.
    Starting {
        stamp: String,
        pending: HashSet<ClientId>,
        participants: HashSet<ClientId>,
    },
    /// The match runs, board frames get relayed.
    Running {
        stamp: String,
        started_at: Instant,
        participants: HashSet<ClientId>,
    },
}

/// Outcome of one participant, handed to the profile reporter after a
/// match resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeReport {
    pub name: String,
    pub won: bool,
    pub attacks: u64,
    pub elapsed_secs: f64,
}

/// The one room of this server process.
pub struct Room {
    clients: HashMap<ClientId, ClientHandle>,
    next_client_id: ClientId,
    phase: RoomPhase,
}

impl Default for Room {
    fn default() -> Self {
        Room::new()
    }
}

impl Room {
    pub fn new() -> Self {
        Room {
            clients: HashMap::new(),
            next_client_id: 1,
            phase: RoomPhase::Waiting,
        }
    }

    /// Admits a connection that finished its handshake and announces the
    /// new player to everybody, the newcomer included.
    pub fn admit(
        &mut self,
        name: String,
        outbox: mpsc::Sender<Bytes>,
        slot: Arc<StateSlot>,
    ) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id = self.next_client_id.wrapping_add(1);

        self.clients.insert(
            id,
            ClientHandle {
                name: name.clone(),
                ready: false,
                wins: 0,
                ledger: PenaltyLedger::default(),
                attacks: 0,
                outbox,
                slot,
            },
        );

        let joined = Frame::text(PLAYER_JOINED, &name).encode_to_bytes();
        self.broadcast_control(joined);
        id
    }

    /// Removes a connection from all tracking structures in one step and
    /// broadcasts the departure. Ready flag, slot and ledger leave together
    /// with the handle, so a concurrent flush can never observe a partial
    /// removal.
    pub fn remove(&mut self, id: ClientId) -> Option<String> {
        let handle = self.clients.remove(&id)?;
        let left = Frame::text(PLAYER_LEFT, &handle.name).encode_to_bytes();
        self.broadcast_control(left);
        Some(handle.name)
    }

    /// Toggles the readiness of a player. The second toggle takes the
    /// player out of the ready set again. Returns true exactly when the
    /// toggle filled the quorum, the caller then stamps and starts the
    /// match under the same lock.
    pub fn toggle_ready(&mut self, id: ClientId) -> bool {
        if !matches!(self.phase, RoomPhase::Waiting) {
            tracing::debug!(client = id, "Ready toggle outside the waiting phase ignored.");
            return false;
        }
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        client.ready = !client.ready;
        let went_ready = client.ready;

        let ready_count = self.clients.values().filter(|c| c.ready).count();
        went_ready && ready_count == READY_QUORUM
    }

    /// Fires the start handshake: remembers the participants, sends every
    /// ready player the started sentinel and waits for their acknowledgment
    /// before the shared timestamp goes out.
    pub fn begin_start(&mut self, stamp: String) {
        if !matches!(self.phase, RoomPhase::Waiting) {
            return;
        }

        let mut participants = HashSet::new();
        let started = Frame::empty(GAME_STARTED).encode_to_bytes();
        for (id, client) in &self.clients {
            if client.ready {
                participants.insert(*id);
                client.push_control(started.clone());
            }
        }
        tracing::info!(players = participants.len(), stamp = %stamp, "Match starting.");
        self.phase = RoomPhase::Starting {
            stamp,
            pending: participants.clone(),
            participants,
        };
    }

    /// Books the start acknowledgment of one participant and answers it
    /// with the shared timestamp. Once everybody acknowledged, the match
    /// is running.
    pub fn ack_start(&mut self, id: ClientId) {
        let RoomPhase::Starting {
            stamp,
            pending,
            participants,
        } = &mut self.phase
        else {
            return;
        };
        if !pending.remove(&id) {
            return;
        }

        let stamp_frame = Frame::text(START_STAMP, stamp).encode_to_bytes();
        if let Some(client) = self.clients.get(&id) {
            client.push_control(stamp_frame);
        }

        if pending.is_empty() {
            let stamp = stamp.clone();
            let participants = participants.clone();
            tracing::info!("All participants acknowledged, match running.");
            self.phase = RoomPhase::Running {
                stamp,
                started_at: Instant::now(),
                participants,
            };
        }
    }

    /// Fans a board frame out to every other connection (latest payload
    /// wins) and books the announced penalty lines: the sender owes them,
    /// every opponent receives them, then the touched ledgers net.
    pub async fn apply_snapshot(&mut self, from: ClientId, raw: Bytes, lines: u32) {
        if !matches!(self.phase, RoomPhase::Running { .. }) {
            tracing::debug!(client = from, "Board frame outside a running match dropped.");
            return;
        }

        for (id, client) in self.clients.iter_mut() {
            if *id == from {
                client.ledger.to_send += lines;
                client.attacks += lines as u64;
            } else {
                client.slot.offer(raw.clone()).await;
                client.ledger.absorb(lines);
            }
        }

        // Once per relay cycle the counters net against each other.
        if lines > 0 {
            for client in self.clients.values_mut() {
                client.ledger.reconcile();
            }
        }
    }

    /// Ends the match with the given player as the loser. Every other
    /// participant gets a winning verdict and a session win, the loser the
    /// losing one. Slots, ready set and ledgers are cleared and the room is
    /// waiting again. Returns the outcome reports for the profile service.
    pub async fn resolve(&mut self, loser: ClientId) -> Vec<OutcomeReport> {
        let (participants, elapsed_secs) = match &self.phase {
            RoomPhase::Waiting => return Vec::new(),
            RoomPhase::Starting { participants, .. } => (participants.clone(), 0.0),
            RoomPhase::Running {
                participants,
                started_at,
                ..
            } => (participants.clone(), started_at.elapsed().as_secs_f64()),
        };
        if !participants.contains(&loser) {
            return Vec::new();
        }

        let win = Frame::binary(VERDICT, &GameVerdict::win())
            .expect("Could not serialize verdict.")
            .encode_to_bytes();
        let lose = Frame::binary(VERDICT, &GameVerdict::lose())
            .expect("Could not serialize verdict.")
            .encode_to_bytes();

        let mut reports = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            if !participants.contains(id) {
                continue;
            }
            let won = *id != loser;
            if won {
                client.wins += 1;
            }
            client.push_control(if won { win.clone() } else { lose.clone() });
            reports.push(OutcomeReport {
                name: client.name.clone(),
                won,
                attacks: client.attacks,
                elapsed_secs,
            });
        }

        self.reset_after_game().await;
        tracing::info!(loser = loser, "Match resolved, room waiting again.");
        reports
    }

    /// Clears everything a finished match leaves behind. Board frames that
    /// are still in flight get dropped by the dispatcher because the phase
    /// is no longer running.
    async fn reset_after_game(&mut self) {
        for client in self.clients.values_mut() {
            client.ready = false;
            client.ledger = PenaltyLedger::default();
            client.attacks = 0;
            client.slot.clear().await;
        }
        self.phase = RoomPhase::Waiting;
    }

    /// Queues a control frame for every connection.
    pub fn broadcast_control(&self, payload: Bytes) {
        for client in self.clients.values() {
            client.push_control(payload.clone());
        }
    }

    /// Whether the given connection plays in the currently running match.
    /// Only those sockets read with the forfeit timeout, a silent spectator
    /// is not a forfeit.
    pub fn is_running_participant(&self, id: ClientId) -> bool {
        match &self.phase {
            RoomPhase::Running { participants, .. } => participants.contains(&id),
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, RoomPhase::Running { .. })
    }

    /// How long the current match has been running.
    pub fn running_for(&self) -> Option<std::time::Duration> {
        match &self.phase {
            RoomPhase::Running { started_at, .. } => Some(started_at.elapsed()),
            _ => None,
        }
    }

    pub fn phase(&self) -> &RoomPhase {
        &self.phase
    }

    pub fn player_count(&self) -> usize {
        self.clients.len()
    }

    /// The session win counts sent to a freshly connecting client.
    pub fn win_tally(&self) -> Vec<PlayerStanding> {
        self.clients
            .values()
            .map(|client| PlayerStanding {
                name: client.name.clone(),
                wins: client.wins,
            })
            .collect()
    }

    /// The names currently in the ready set.
    pub fn ready_names(&self) -> Vec<String> {
        self.clients
            .values()
            .filter(|client| client.ready)
            .map(|client| client.name.clone())
            .collect()
    }

    pub fn client_name(&self, id: ClientId) -> Option<&str> {
        self.clients.get(&id).map(|client| client.name.as_str())
    }
}

/// The application state shared by the accept loop and all sessions.
pub struct AppState {
    pub config: RelayConfig,
    pub room: Mutex<Room>,
    pub reporter: ProfileReporter,
}

impl AppState {
    /// Builds the state and spawns the profile report drain task, so this
    /// has to run inside the runtime.
    pub fn new(config: RelayConfig) -> Self {
        let client = ProfileClient::new(config.profile_base_url.clone());
        let reporter = ProfileReporter::spawn(client, config.report_queue);
        AppState {
            config,
            room: Mutex::new(Room::new()),
            reporter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{BOARD_STATE, BoardSnapshot, FrameCodec};

    struct TestClient {
        id: ClientId,
        outbox: mpsc::Receiver<Bytes>,
        slot: Arc<StateSlot>,
    }

    fn join(room: &mut Room, name: &str) -> TestClient {
        let (tx, rx) = mpsc::channel(64);
        let slot = Arc::new(StateSlot::default());
        let id = room.admit(name.to_string(), tx, slot.clone());
        TestClient {
            id,
            outbox: rx,
            slot,
        }
    }

    fn drain_frames(client: &mut TestClient) -> Vec<Frame> {
        let mut codec = FrameCodec::new();
        while let Ok(payload) = client.outbox.try_recv() {
            codec.feed(&payload);
        }
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode_next().unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn snapshot_frame(lines: u32) -> (Bytes, u32) {
        let mut snapshot = BoardSnapshot::blank(0);
        snapshot.lines_sent = lines;
        let raw = Frame::binary(BOARD_STATE, &snapshot)
            .unwrap()
            .encode_to_bytes();
        (raw, lines)
    }

    async fn start_match(room: &mut Room, a: &TestClient, b: &TestClient) {
        assert!(!room.toggle_ready(a.id));
        assert!(room.toggle_ready(b.id));
        room.begin_start("123.456".to_string());
        room.ack_start(a.id);
        room.ack_start(b.id);
        assert!(room.is_running());
    }

    #[tokio::test]
    async fn quorum_of_two_starts_the_match() {
        let mut room = Room::new();
        let a = join(&mut room, "alice");
        let b = join(&mut room, "bob");

        assert!(!room.toggle_ready(a.id));
        assert!(matches!(room.phase(), RoomPhase::Waiting));
        assert!(room.toggle_ready(b.id));
    }

    #[tokio::test]
    async fn ready_toggle_is_symmetric() {
        let mut room = Room::new();
        let a = join(&mut room, "alice");

        assert!(!room.toggle_ready(a.id));
        assert_eq!(room.ready_names(), vec!["alice".to_string()]);
        assert!(!room.toggle_ready(a.id));
        assert!(room.ready_names().is_empty());
    }

    #[tokio::test]
    async fn third_ready_player_cannot_disturb_the_start() {
        let mut room = Room::new();
        let a = join(&mut room, "alice");
        let b = join(&mut room, "bob");
        let c = join(&mut room, "carol");

        room.toggle_ready(a.id);
        assert!(room.toggle_ready(b.id));
        room.begin_start("42.0".to_string());

        // The start is in flight, a late toggle must neither re-trigger nor
        // cancel it.
        assert!(!room.toggle_ready(c.id));
        assert!(matches!(room.phase(), RoomPhase::Starting { .. }));

        room.ack_start(a.id);
        room.ack_start(b.id);
        assert!(room.is_running());
        assert!(!room.is_running_participant(c.id));
    }

    #[tokio::test]
    async fn both_participants_get_the_same_stamp() {
        let mut room = Room::new();
        let mut a = join(&mut room, "alice");
        let mut b = join(&mut room, "bob");
        start_match(&mut room, &a, &b).await;

        let stamp_of = |frames: Vec<Frame>| {
            frames
                .into_iter()
                .find(|f| f.tag == START_STAMP)
                .map(|f| f.payload_text())
        };
        let stamp_a = stamp_of(drain_frames(&mut a)).unwrap();
        let stamp_b = stamp_of(drain_frames(&mut b)).unwrap();
        assert_eq!(stamp_a, "123.456");
        assert_eq!(stamp_a, stamp_b);
    }

    #[tokio::test]
    async fn newest_board_frame_wins_the_slot() {
        let mut room = Room::new();
        let a = join(&mut room, "alice");
        let b = join(&mut room, "bob");
        start_match(&mut room, &a, &b).await;

        let (first, _) = snapshot_frame(0);
        let (second, _) = snapshot_frame(1);
        room.apply_snapshot(a.id, first, 0).await;
        room.apply_snapshot(a.id, second.clone(), 1).await;

        // Two frames before any flush: only the newest one is delivered.
        assert_eq!(b.slot.take().await, Some(second));
        assert_eq!(b.slot.take().await, None);
        // The sender's own slot stays untouched.
        assert_eq!(a.slot.take().await, None);
    }

    #[tokio::test]
    async fn penalty_lines_net_between_the_opponents() {
        let mut room = Room::new();
        let a = join(&mut room, "alice");
        let b = join(&mut room, "bob");
        start_match(&mut room, &a, &b).await;

        let (raw, lines) = snapshot_frame(2);
        room.apply_snapshot(a.id, raw, lines).await;

        let tally: HashMap<String, u32> = room
            .clients
            .values()
            .map(|c| (c.name.clone(), c.ledger.received))
            .collect();
        assert_eq!(tally["bob"], 2);
        assert_eq!(tally["alice"], 0);
        assert_eq!(room.clients[&a.id].attacks, 2);
    }

    #[tokio::test]
    async fn board_frames_outside_a_match_are_dropped() {
        let mut room = Room::new();
        let a = join(&mut room, "alice");
        let b = join(&mut room, "bob");

        let (raw, lines) = snapshot_frame(1);
        room.apply_snapshot(a.id, raw, lines).await;
        assert_eq!(b.slot.take().await, None);
    }

    #[tokio::test]
    async fn top_out_resolves_and_resets_the_room() {
        let mut room = Room::new();
        let mut a = join(&mut room, "alice");
        let mut b = join(&mut room, "bob");
        start_match(&mut room, &a, &b).await;

        let (raw, lines) = snapshot_frame(4);
        room.apply_snapshot(a.id, raw, lines).await;

        let mut reports = room.resolve(a.id).await;
        reports.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].name, "alice");
        assert!(!reports[0].won);
        assert_eq!(reports[0].attacks, 4);
        assert_eq!(reports[1].name, "bob");
        assert!(reports[1].won);

        let verdict_of = |frames: Vec<Frame>| {
            frames
                .into_iter()
                .filter(|f| f.tag == VERDICT)
                .map(|f| postcard::from_bytes::<GameVerdict>(&f.payload).unwrap())
                .next_back()
        };
        assert_eq!(verdict_of(drain_frames(&mut a)), Some(GameVerdict::lose()));
        assert_eq!(verdict_of(drain_frames(&mut b)), Some(GameVerdict::win()));

        // The room is waiting again with everything cleared.
        assert!(matches!(room.phase(), RoomPhase::Waiting));
        assert!(room.ready_names().is_empty());
        assert_eq!(b.slot.take().await, None);
        let wins: HashMap<String, u32> = room
            .win_tally()
            .into_iter()
            .map(|s| (s.name, s.wins))
            .collect();
        assert_eq!(wins["bob"], 1);
        assert_eq!(wins["alice"], 0);
    }

    #[tokio::test]
    async fn removal_is_atomic() {
        let mut room = Room::new();
        let a = join(&mut room, "alice");
        let mut b = join(&mut room, "bob");
        start_match(&mut room, &a, &b).await;

        let reports = room.resolve(a.id).await;
        assert_eq!(reports.len(), 2);
        let name = room.remove(a.id);
        assert_eq!(name.as_deref(), Some("alice"));

        assert!(room.win_tally().iter().all(|s| s.name != "alice"));
        assert!(room.ready_names().is_empty());
        assert!(room.client_name(a.id).is_none());

        let frames = drain_frames(&mut b);
        assert!(
            frames
                .iter()
                .any(|f| f.tag == PLAYER_LEFT && f.payload_text() == "alice")
        );
    }

    #[tokio::test]
    async fn resolve_without_a_match_is_a_no_op() {
        let mut room = Room::new();
        let a = join(&mut room, "alice");
        assert!(room.resolve(a.id).await.is_empty());
    }
}
