//! Penalty line bookkeeping. The mapping from simultaneous clears to
//! penalty rows and the netting of outgoing against incoming lines are
//! design invariants: the relay and both peers must land on identical
//! numbers or the two views of a match drift apart.

use serde::{Deserialize, Serialize};

/// Penalty rows generated by clearing `cleared` rows at once.
///
/// `floor((cleared / 2)^2)`: a single clear sends nothing, a double one
/// line, a triple two and a tetris four.
pub fn penalty_for_clear(cleared: u32) -> u32 {
    (cleared * cleared) / 4
}

/// Pending penalty lines of one player: what they still owe the opponent
/// and what the opponent has charged them with since the last netting.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PenaltyLedger {
    /// Lines waiting to be sent to the opponent.
    pub to_send: u32,
    /// Lines received from the opponent, not yet materialized on the board.
    pub received: u32,
}

impl PenaltyLedger {
    /// Books a line clear through the penalty mapping.
    pub fn queue_clear(&mut self, cleared: u32) -> u32 {
        let penalty = penalty_for_clear(cleared);
        self.to_send += penalty;
        penalty
    }

    /// Books penalty lines announced by the opponent.
    pub fn absorb(&mut self, lines: u32) {
        self.received += lines;
    }

    /// Nets the two counters: the larger side absorbs the smaller, keeps
    /// the excess and the smaller side resets to zero.
    pub fn reconcile(&mut self) {
        if self.received >= self.to_send {
            self.received -= self.to_send;
            self.to_send = 0;
        } else {
            self.to_send -= self.received;
            self.received = 0;
        }
    }

    /// Drains the outgoing counter for the next snapshot.
    pub fn take_to_send(&mut self) -> u32 {
        std::mem::take(&mut self.to_send)
    }

    /// Drains the incoming counter once the rows get added to the board.
    pub fn take_received(&mut self) -> u32 {
        std::mem::take(&mut self.received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_mapping_is_exact() {
        assert_eq!(penalty_for_clear(0), 0);
        assert_eq!(penalty_for_clear(1), 0);
        assert_eq!(penalty_for_clear(2), 1);
        assert_eq!(penalty_for_clear(3), 2);
        assert_eq!(penalty_for_clear(4), 4);
    }

    #[test]
    fn netting_keeps_the_excess_on_the_larger_side() {
        let mut ledger = PenaltyLedger {
            to_send: 3,
            received: 5,
        };
        ledger.reconcile();
        assert_eq!(ledger.to_send, 0);
        assert_eq!(ledger.received, 2);

        let mut ledger = PenaltyLedger {
            to_send: 5,
            received: 3,
        };
        ledger.reconcile();
        assert_eq!(ledger.to_send, 2);
        assert_eq!(ledger.received, 0);
    }

    #[test]
    fn netting_always_zeroes_one_side() {
        for to_send in 0..8u32 {
            for received in 0..8u32 {
                let mut ledger = PenaltyLedger { to_send, received };
                ledger.reconcile();
                assert!(ledger.to_send == 0 || ledger.received == 0);
                assert_eq!(
                    ledger.to_send + ledger.received,
                    to_send.abs_diff(received)
                );
            }
        }
    }

    #[test]
    fn equal_counters_cancel_completely() {
        let mut ledger = PenaltyLedger {
            to_send: 4,
            received: 4,
        };
        ledger.reconcile();
        assert_eq!(ledger, PenaltyLedger::default());
    }

    #[test]
    fn queue_clear_accumulates() {
        let mut ledger = PenaltyLedger::default();
        assert_eq!(ledger.queue_clear(4), 4);
        assert_eq!(ledger.queue_clear(2), 1);
        assert_eq!(ledger.to_send, 5);
        assert_eq!(ledger.take_to_send(), 5);
        assert_eq!(ledger.to_send, 0);
    }
}
