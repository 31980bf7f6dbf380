//! The multiplayer layer of the game client. It sits between the engine's
//! heartbeat-driven game loop and the relay server:
//!
//! ```text
//! Engine (rendering, input, rules) -> MatchLink -> Relay Server
//! ```
//!
//! The engine creates a [`MatchLink`] before entering its loop and calls
//! [`MatchLink::update`] once per frame. Commands (ready toggle, board
//! staging, line clears, topping out) go in through methods, everything
//! that happened on the network comes back out as polled [`MatchEvent`]s,
//! one at a time so the frontend can pace animations.
//!
//! A rough usage example looks like this:
//!
//! ```text
//! let mut link = MatchLink::new("alice".to_string(), skin);
//! link.connect("203.0.113.7:44444");
//! loop {
//!     link.update(get_frame_time());
//!     link.stage_board(engine.visible_grid());
//!     while let Some(event) = link.next_event() {
//!         match event {
//!             MatchEvent::Started { epoch } => engine.begin_match(&epoch),
//!             MatchEvent::OpponentState(snapshot) => engine.show_opponent(snapshot),
//!             MatchEvent::GarbageIncoming { rows, hole_column } => {
//!                 engine.push_garbage(rows, hole_column)
//!             }
//!             MatchEvent::Finished { won } => engine.end_match(won),
//!             _ => {}
//!         }
//!     }
//!     if engine.cleared_lines > 0 {
//!         link.record_line_clear(engine.cleared_lines);
//!     }
//! }
//! ```
//!
//! While the link is disconnected the frontend should show the lobby UI
//! together with the error string, the same way the connection states of
//! the relay protocol suggest.

mod cadence;
mod match_link;
mod tcp_interface;

pub use cadence::{Cadence, SilenceWatch};
pub use match_link::{
    ConnectionState, MatchEvent, MatchLink, SEND_INTERVAL_SECS, SILENCE_LIMIT_SECS,
};
pub use tcp_interface::RelayConnection;
