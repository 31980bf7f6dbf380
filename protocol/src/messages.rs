//! The typed payloads and the control text grammar. The board snapshot is
//! opaque to the relay except for the embedded line count; everything here
//! still lives in the shared crate so client and server never disagree on
//! the encoding.

use serde::{Deserialize, Serialize};

/// Columns of the playfield.
pub const BOARD_WIDTH: usize = 10;

/// Visible rows of the playfield.
pub const BOARD_HEIGHT: usize = 20;

/// Cell label for an unoccupied cell. Occupied cells carry the first letter
/// of their piece kind (`I`, `J`, `L`, `O`, `S`, `T`, `Z`, `G` for garbage).
pub const EMPTY_CELL: u8 = b'N';

/// Prefix of the ready toggle control text.
pub const READY_PREFIX: &str = "Ready%";

/// Control text announcing a deliberate departure.
pub const DISCONNECT_COMMAND: &str = "disconnect";

/// One visible playfield, a single letter per cell.
pub type BoardGrid = [[u8; BOARD_WIDTH]; BOARD_HEIGHT];

/// A grid with every cell empty.
pub fn empty_grid() -> BoardGrid {
    [[EMPTY_CELL; BOARD_WIDTH]; BOARD_HEIGHT]
}

/// One player's visible playfield as sent once per relay interval, plus the
/// penalty lines generated since the previous snapshot and the cosmetic
/// skin the opponent should render it with.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BoardSnapshot {
    pub grid: BoardGrid,
    pub lines_sent: u32,
    pub skin: u16,
}

impl BoardSnapshot {
    /// An empty board, useful as the very first snapshot of a match.
    pub fn blank(skin: u16) -> Self {
        BoardSnapshot {
            grid: empty_grid(),
            lines_sent: 0,
            skin,
        }
    }
}

/// The final word of the relay for one participant.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct GameVerdict {
    /// Whether the receiver won the match.
    pub won: bool,
    /// Garbage lines attached to the verdict. Always zero today, the slot
    /// exists because the original protocol carried it.
    pub garbage: u32,
}

impl GameVerdict {
    pub fn win() -> Self {
        GameVerdict {
            won: true,
            garbage: 0,
        }
    }

    pub fn lose() -> Self {
        GameVerdict {
            won: false,
            garbage: 0,
        }
    }
}

/// One entry of the session win tally sent to a freshly admitted client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PlayerStanding {
    pub name: String,
    pub wins: u32,
}

/// The interpreted forms a control text can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `Ready%<name>` toggles the sender's readiness.
    ReadyToggle { name: String },
    /// `disconnect` announces a deliberate departure.
    Disconnect,
    /// Anything else is a notice handled upstream of the relay (declined
    /// invites) and gets forwarded to the other connections verbatim.
    Notice(String),
}

/// Interprets a control text. The grammar is the one the original clients
/// speak, so unknown texts are notices rather than errors.
pub fn parse_control(text: &str) -> ControlCommand {
    if let Some(name) = text.strip_prefix(READY_PREFIX) {
        return ControlCommand::ReadyToggle {
            name: name.to_string(),
        };
    }
    if text == DISCONNECT_COMMAND {
        return ControlCommand::Disconnect;
    }
    ControlCommand::Notice(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_grammar() {
        assert_eq!(
            parse_control("Ready%alice"),
            ControlCommand::ReadyToggle {
                name: "alice".to_string()
            }
        );
        assert_eq!(parse_control("disconnect"), ControlCommand::Disconnect);
        assert_eq!(
            parse_control("bob"),
            ControlCommand::Notice("bob".to_string())
        );
    }

    #[test]
    fn snapshot_postcard_roundtrip() {
        let mut snapshot = BoardSnapshot::blank(3);
        snapshot.grid[19][0] = b'I';
        snapshot.lines_sent = 2;

        let raw = postcard::to_stdvec(&snapshot).unwrap();
        let back: BoardSnapshot = postcard::from_bytes(&raw).unwrap();
        assert_eq!(snapshot, back);
    }

    #[test]
    fn blank_board_is_all_empty() {
        let snapshot = BoardSnapshot::blank(0);
        assert!(
            snapshot
                .grid
                .iter()
                .all(|row| row.iter().all(|&cell| cell == EMPTY_CELL))
        );
    }
}
