//! The core entry point of the multiplayer layer. The engine pumps the
//! [`MatchLink`] once per frame; it walks the admission handshake on its
//! own, answers the start handshake, paces the outgoing board snapshots
//! and translates everything inbound into polled [`MatchEvent`]s.

use crate::cadence::{Cadence, SilenceWatch};
use crate::tcp_interface::RelayConnection;
use protocol::{
    ACK, BOARD_STATE, BOARD_WIDTH, BoardGrid, BoardSnapshot, CONTROL_TEXT, DISCONNECT_COMMAND,
    Frame, GAME_STARTED, GameVerdict, PLAYER_JOINED, PLAYER_LEFT, PenaltyLedger, PlayerStanding,
    READY_PREFIX, READY_ROSTER, SERVER_ERROR, START_STAMP, TOP_OUT, VERDICT, WIN_TALLY, empty_grid,
};
use rand::Rng;
use std::collections::VecDeque;
use std::net::ToSocketAddrs;

/// Seconds between two outgoing board snapshots.
pub const SEND_INTERVAL_SECS: f32 = 1.0;

/// Seconds of opponent silence after which the match counts as won by
/// forfeit. The relay reaches the same conclusion on its own read timeout.
pub const SILENCE_LIMIT_SECS: f32 = 2.0;

/// The different phases we may be in concerning the connection.
#[derive(Clone, PartialEq, Debug)]
pub enum ConnectionState {
    /// When we are disconnected we may have an error string, that tells the
    /// reason why we went to disconnection.
    Disconnected { error_string: Option<String> },
    /// Connected, waiting for the session win tally of the room.
    AwaitingStandings,
    /// Tally acknowledged, waiting for the ready roster.
    AwaitingRoster,
    /// Part of the room. Readiness can be toggled here.
    Lobby,
    /// The started sentinel arrived and was acknowledged, the shared
    /// timestamp is still missing.
    Starting,
    /// A match runs. `epoch` is the stamp both opponents measure from.
    InMatch { epoch: String },
}

/// Everything the network side wants the frontend to know, polled one
/// event at a time.
#[derive(Clone, Debug, PartialEq)]
pub enum MatchEvent {
    /// The session win counts as received during admission.
    Standings(Vec<PlayerStanding>),
    /// The names that were already ready when we joined.
    ReadyRoster(Vec<String>),
    PlayerJoined(String),
    PlayerLeft(String),
    /// Forwarded control text of another player (ready toggles, declined
    /// invites). The frontend decides what to show.
    ControlNotice(String),
    /// The match started, both sides share this epoch string.
    Started { epoch: String },
    /// A fresh snapshot of the opponent's playfield.
    OpponentState(BoardSnapshot),
    /// Netted penalty lines to materialize on the own board. The hole
    /// column is chosen locally, it is presentation and never reconciled
    /// with the opponent's view.
    GarbageIncoming { rows: u32, hole_column: usize },
    /// The match ended for us, by verdict of the relay or by forfeit of a
    /// silent opponent.
    Finished { won: bool },
}

/// The engine-facing connection handle. Create it before the game loop,
/// call [`update`](MatchLink::update) once per frame, poll events after.
pub struct MatchLink {
    connection: Option<RelayConnection>,
    connection_state: ConnectionState,
    events: VecDeque<MatchEvent>,
    display_name: String,
    skin: u16,
    /// The latest visible playfield, staged by the engine.
    board: BoardGrid,
    ledger: PenaltyLedger,
    send_cadence: Cadence,
    silence: SilenceWatch,
}

impl MatchLink {
    pub fn new(display_name: String, skin: u16) -> Self {
        MatchLink {
            connection: None,
            connection_state: ConnectionState::Disconnected { error_string: None },
            events: VecDeque::new(),
            display_name,
            skin,
            board: empty_grid(),
            ledger: PenaltyLedger::default(),
            send_cadence: Cadence::new(SEND_INTERVAL_SECS),
            silence: SilenceWatch::new(SILENCE_LIMIT_SECS),
        }
    }

    /// Connects to a relay. Should only be done in disconnected state.
    pub fn connect(&mut self, addr: impl ToSocketAddrs) {
        assert!(
            matches!(
                self.connection_state,
                ConnectionState::Disconnected { error_string: _ }
            ),
            "Only in disconnected state is a connect allowed."
        );
        match RelayConnection::connect(addr) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.connection_state = ConnectionState::AwaitingStandings;
            }
            Err(error) => {
                self.mark_error(error);
            }
        }
    }

    /// Asks explicitly for a disconnection. Should be placed on a leave
    /// room button.
    pub fn disconnect(&mut self) {
        if self.connection.is_some() {
            self.send(Frame::text(CONTROL_TEXT, DISCONNECT_COMMAND));
            self.mark_error("Disconnected from server".to_string());
        }
    }

    /// Toggles the own readiness. Only meaningful in the lobby.
    pub fn toggle_ready(&mut self) {
        if matches!(self.connection_state, ConnectionState::Lobby) {
            let text = format!("{}{}", READY_PREFIX, self.display_name);
            self.send(Frame::text(CONTROL_TEXT, &text));
        }
    }

    /// Reports the own top out. The losing verdict comes back from the
    /// relay, the frontend should wait for [`MatchEvent::Finished`].
    pub fn report_top_out(&mut self) {
        if matches!(self.connection_state, ConnectionState::InMatch { .. }) {
            self.send(Frame::empty(TOP_OUT));
        }
    }

    /// Stages the currently visible playfield for the next snapshot.
    pub fn stage_board(&mut self, grid: BoardGrid) {
        self.board = grid;
    }

    /// Books a line clear through the penalty mapping and returns the
    /// penalty rows it produced.
    pub fn record_line_clear(&mut self, cleared: u32) -> u32 {
        self.ledger.queue_clear(cleared)
    }

    /// Gets the next event if existent, to be processed by the frontend.
    /// They can be polled once at a time to pace animations.
    pub fn next_event(&mut self) -> Option<MatchEvent> {
        self.events.pop_front()
    }

    /// Probes the current connection state. Especially interesting for
    /// dropping back to disconnected state for error handling.
    pub fn connection_state(&self) -> &ConnectionState {
        &self.connection_state
    }

    /// The update should be called once a frame from the main program,
    /// typically at the beginning. Afterwards the events can be polled.
    pub fn update(&mut self, delta_time: f32) {
        if matches!(
            self.connection_state,
            ConnectionState::Disconnected { error_string: _ }
        ) {
            return;
        }
        self.pump_inbound();
        self.run_match_clocks(delta_time);
        self.reconcile_garbage();
    }

    /// Global function to mark error and drop the connection.
    fn mark_error(&mut self, error: String) {
        self.connection_state = ConnectionState::Disconnected {
            error_string: Some(error),
        };
        self.connection = None; // Drops the stream, closes the connection.
    }

    fn send(&mut self, frame: Frame) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if let Err(error) = connection.send_frame(&frame) {
            self.mark_error(error);
        }
    }

    /// Collects everything the socket has and routes it frame by frame.
    fn pump_inbound(&mut self) {
        let mut inbound = Vec::new();
        let mut failure = None;
        if let Some(connection) = self.connection.as_mut() {
            if let Err(error) = connection.pump_outgoing() {
                failure = Some(error);
            } else {
                loop {
                    match connection.try_recv_frame() {
                        Ok(Some(frame)) => inbound.push(frame),
                        Ok(None) => break,
                        Err(error) => {
                            failure = Some(error);
                            break;
                        }
                    }
                }
            }
        }

        // Anything inbound counts as a sign of life for the watchdog.
        if !inbound.is_empty() {
            self.silence.reset();
        }
        for frame in inbound {
            self.process_frame(frame);
        }
        if let Some(error) = failure {
            self.mark_error(error);
        }
    }

    fn process_frame(&mut self, frame: Frame) {
        match frame.tag {
            WIN_TALLY => match postcard::from_bytes::<Vec<PlayerStanding>>(&frame.payload) {
                Ok(standings) => {
                    self.events.push_back(MatchEvent::Standings(standings));
                    if matches!(self.connection_state, ConnectionState::AwaitingStandings) {
                        self.send(Frame::empty(ACK));
                        self.connection_state = ConnectionState::AwaitingRoster;
                    }
                }
                Err(err) => tracing::warn!(?err, "Malformed win tally dropped."),
            },
            READY_ROSTER => match postcard::from_bytes::<Vec<String>>(&frame.payload) {
                Ok(roster) => {
                    self.events.push_back(MatchEvent::ReadyRoster(roster));
                    if matches!(self.connection_state, ConnectionState::AwaitingRoster) {
                        let name_frame = Frame::text(CONTROL_TEXT, &self.display_name);
                        self.send(name_frame);
                        self.connection_state = ConnectionState::Lobby;
                    }
                }
                Err(err) => tracing::warn!(?err, "Malformed ready roster dropped."),
            },
            PLAYER_JOINED => {
                self.events
                    .push_back(MatchEvent::PlayerJoined(frame.payload_text()));
            }
            PLAYER_LEFT => {
                self.events
                    .push_back(MatchEvent::PlayerLeft(frame.payload_text()));
            }
            CONTROL_TEXT => {
                self.events
                    .push_back(MatchEvent::ControlNotice(frame.payload_text()));
            }
            GAME_STARTED => {
                if matches!(self.connection_state, ConnectionState::Lobby) {
                    self.send(Frame::empty(ACK));
                    self.connection_state = ConnectionState::Starting;
                }
            }
            START_STAMP => {
                if matches!(self.connection_state, ConnectionState::Starting) {
                    let epoch = frame.payload_text();
                    self.send_cadence.reset();
                    self.silence.reset();
                    self.ledger = PenaltyLedger::default();
                    self.connection_state = ConnectionState::InMatch {
                        epoch: epoch.clone(),
                    };
                    self.events.push_back(MatchEvent::Started { epoch });
                }
            }
            BOARD_STATE => match postcard::from_bytes::<BoardSnapshot>(&frame.payload) {
                Ok(snapshot) => {
                    self.ledger.absorb(snapshot.lines_sent);
                    self.events.push_back(MatchEvent::OpponentState(snapshot));
                }
                Err(err) => tracing::warn!(?err, "Malformed opponent snapshot dropped."),
            },
            VERDICT => match postcard::from_bytes::<GameVerdict>(&frame.payload) {
                Ok(verdict) => {
                    self.events.push_back(MatchEvent::Finished {
                        won: verdict.won,
                    });
                    self.connection_state = ConnectionState::Lobby;
                }
                Err(err) => tracing::warn!(?err, "Malformed verdict dropped."),
            },
            SERVER_ERROR => {
                self.mark_error(frame.payload_text());
            }
            tag => {
                tracing::warn!(tag, "Illegal frame tag from the relay.");
            }
        }
    }

    /// Sends the snapshot on its cadence and watches for opponent silence.
    fn run_match_clocks(&mut self, delta_time: f32) {
        if !matches!(self.connection_state, ConnectionState::InMatch { .. }) {
            return;
        }

        if self.send_cadence.tick(delta_time) {
            let snapshot = BoardSnapshot {
                grid: self.board,
                lines_sent: self.ledger.take_to_send(),
                skin: self.skin,
            };
            match Frame::binary(BOARD_STATE, &snapshot) {
                Ok(frame) => self.send(frame),
                Err(err) => tracing::error!(?err, "Could not serialize the board snapshot."),
            }
        }

        if self.silence.tick(delta_time) {
            self.events.push_back(MatchEvent::Finished { won: true });
            self.connection_state = ConnectionState::Lobby;
        }
    }

    /// Nets the penalty counters once per frame and turns the excess into
    /// garbage rows with a locally chosen hole column.
    fn reconcile_garbage(&mut self) {
        if !matches!(self.connection_state, ConnectionState::InMatch { .. }) {
            return;
        }
        if self.ledger.received == 0 {
            return;
        }
        self.ledger.reconcile();
        let rows = self.ledger.take_received();
        if rows > 0 {
            let hole_column = rand::thread_rng().gen_range(0..BOARD_WIDTH);
            self.events
                .push_back(MatchEvent::GarbageIncoming { rows, hole_column });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> MatchLink {
        MatchLink::new("alice".to_string(), 0)
    }

    fn drain(link: &mut MatchLink) -> Vec<MatchEvent> {
        let mut events = Vec::new();
        while let Some(event) = link.next_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn admission_walks_to_the_lobby() {
        let mut link = link();
        link.connection_state = ConnectionState::AwaitingStandings;

        let tally = vec![PlayerStanding {
            name: "bob".to_string(),
            wins: 1,
        }];
        link.process_frame(Frame::binary(WIN_TALLY, &tally).unwrap());
        assert_eq!(link.connection_state, ConnectionState::AwaitingRoster);

        let roster: Vec<String> = vec!["bob".to_string()];
        link.process_frame(Frame::binary(READY_ROSTER, &roster).unwrap());
        assert_eq!(link.connection_state, ConnectionState::Lobby);

        let events = drain(&mut link);
        assert_eq!(events[0], MatchEvent::Standings(tally));
        assert_eq!(events[1], MatchEvent::ReadyRoster(roster));
    }

    #[test]
    fn start_handshake_enters_the_match() {
        let mut link = link();
        link.connection_state = ConnectionState::Lobby;

        link.process_frame(Frame::empty(GAME_STARTED));
        assert_eq!(link.connection_state, ConnectionState::Starting);

        link.process_frame(Frame::text(START_STAMP, "123.5"));
        assert_eq!(
            link.connection_state,
            ConnectionState::InMatch {
                epoch: "123.5".to_string()
            }
        );
        assert!(
            drain(&mut link).contains(&MatchEvent::Started {
                epoch: "123.5".to_string()
            })
        );
    }

    #[test]
    fn incoming_lines_net_against_queued_ones() {
        let mut link = link();
        link.connection_state = ConnectionState::InMatch {
            epoch: "0".to_string(),
        };

        // A triple queues two lines for the opponent.
        assert_eq!(link.record_line_clear(3), 2);

        let mut snapshot = BoardSnapshot::blank(0);
        snapshot.lines_sent = 5;
        link.process_frame(Frame::binary(BOARD_STATE, &snapshot).unwrap());
        link.update(0.0);

        let events = drain(&mut link);
        assert!(events.contains(&MatchEvent::OpponentState(snapshot)));
        let garbage = events.iter().find_map(|event| match event {
            MatchEvent::GarbageIncoming { rows, hole_column } => Some((*rows, *hole_column)),
            _ => None,
        });
        let (rows, hole_column) = garbage.expect("No garbage event");
        assert_eq!(rows, 3);
        assert!(hole_column < BOARD_WIDTH);
        assert_eq!(link.ledger, PenaltyLedger::default());
    }

    #[test]
    fn snapshot_cadence_drains_the_outgoing_lines() {
        let mut link = link();
        link.connection_state = ConnectionState::InMatch {
            epoch: "0".to_string(),
        };

        link.record_line_clear(4);
        assert_eq!(link.ledger.to_send, 4);
        link.update(SEND_INTERVAL_SECS);
        assert_eq!(link.ledger.to_send, 0);
    }

    #[test]
    fn opponent_silence_wins_the_match() {
        let mut link = link();
        link.connection_state = ConnectionState::InMatch {
            epoch: "0".to_string(),
        };

        link.update(SILENCE_LIMIT_SECS / 2.0);
        assert!(drain(&mut link).is_empty());
        link.update(SILENCE_LIMIT_SECS / 2.0);

        assert!(drain(&mut link).contains(&MatchEvent::Finished { won: true }));
        assert_eq!(link.connection_state, ConnectionState::Lobby);
    }

    #[test]
    fn verdict_returns_to_the_lobby() {
        let mut link = link();
        link.connection_state = ConnectionState::InMatch {
            epoch: "0".to_string(),
        };

        link.process_frame(Frame::binary(VERDICT, &GameVerdict::lose()).unwrap());
        assert!(drain(&mut link).contains(&MatchEvent::Finished { won: false }));
        assert_eq!(link.connection_state, ConnectionState::Lobby);
    }
}
