//! The frame tags and shared message structures for the relay protocol.
//! They are used consistent across the relay server and the game client.
//! Also contains the penalty line bookkeeping both sides have to agree on.

mod frame;
mod garbage;
mod messages;

pub use frame::{FRAME_HEADER_SIZE, Frame, FrameCodec, MAX_FRAME_SIZE};
pub use garbage::{PenaltyLedger, penalty_for_clear};
pub use messages::{
    BOARD_HEIGHT, BOARD_WIDTH, BoardGrid, BoardSnapshot, ControlCommand, DISCONNECT_COMMAND,
    EMPTY_CELL, GameVerdict, PlayerStanding, READY_PREFIX, empty_grid, parse_control,
};

/// The buffer size for the bounded per connection control outbox.
pub const CONTROL_BUFFER_SIZE: usize = 64;

/// The port the relay listens on if nothing else is configured.
pub const DEFAULT_PORT: u16 = 44444;

/// The amount of simultaneously ready players needed to start a match.
pub const READY_QUORUM: usize = 2;

// Client -> Server.

/// Plain UTF-8 control text: `Ready%<name>`, `disconnect`, the display name
/// during admission, or a declined-invite notice that gets relayed verbatim.
pub const CONTROL_TEXT: u8 = 0;

/// A postcard [`BoardSnapshot`]. Relayed to every other connection as an
/// opaque payload; only the embedded line count is interpreted.
pub const BOARD_STATE: u8 = 1;

/// Empty payload, the sender reports its own game over (topped out).
pub const TOP_OUT: u8 = 2;

/// Acknowledgment with an ignored payload. Sent during the admission
/// handshake and as the answer to [`GAME_STARTED`].
pub const ACK: u8 = 3;

// Server -> Client.

/// A postcard `Vec<PlayerStanding>` with the session win counts. First
/// message a freshly accepted connection receives.
pub const WIN_TALLY: u8 = 4;

/// A postcard `Vec<String>` listing the names that are currently ready.
pub const READY_ROSTER: u8 = 5;

/// UTF-8 name of a player that joined the room.
pub const PLAYER_JOINED: u8 = 6;

/// UTF-8 name of a player that left the room.
pub const PLAYER_LEFT: u8 = 7;

/// Empty sentinel, first step of the start handshake. The client answers
/// with [`ACK`] and gets the shared [`START_STAMP`] back.
pub const GAME_STARTED: u8 = 8;

/// UTF-8 decimal epoch-seconds string. Identical for all participants so
/// both opponents compute elapsed time from the same epoch.
pub const START_STAMP: u8 = 9;

/// A postcard [`GameVerdict`] ending the match for the receiver.
pub const VERDICT: u8 = 10;

/// UTF-8 closing message sent right before the server drops a connection.
pub const SERVER_ERROR: u8 = 11;
