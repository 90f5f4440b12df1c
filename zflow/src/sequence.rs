//! Per-flow message ordering.

use crate::FlowError;

/// Which way a message travels, relative to the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the peer.
    Inbound,
    /// Sent to the peer.
    Outbound,
}

/// Enforces contiguous sequence numbers from 0, independently per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceValidator {
    /// Next expected inbound `seq`.
    inbound: u64,
    /// Next outbound `seq`.
    outbound: u64,
}

impl SequenceValidator {
    /// A validator expecting 0 in both directions.
    pub const fn new() -> Self {
        Self {
            inbound: 0,
            outbound: 0,
        }
    }

    /// The `seq` the next message in `direction` must carry.
    pub const fn next_expected(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Inbound => self.inbound,
            Direction::Outbound => self.outbound,
        }
    }

    /// Accepts `seq` if it is exactly the next expected value.
    ///
    /// A gap, a duplicate, or a missing number is rejected and leaves the
    /// counter untouched.
    pub fn observe(&mut self, direction: Direction, seq: Option<u64>) -> Result<(), FlowError> {
        let slot = match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        };
        if seq != Some(*slot) {
            return Err(FlowError::Sequence {
                expected: *slot,
                got: seq,
            });
        }
        *slot += 1;
        Ok(())
    }

    /// Allocates the `seq` for the next outbound message.
    pub const fn next_outbound(&mut self) -> u64 {
        let seq = self.outbound;
        self.outbound += 1;
        seq
    }

    /// Marks the peer's open message (`seq` 0) as received.
    ///
    /// For a responder that has already checked the open by other means.
    pub const fn accept_open(&mut self) {
        if self.inbound == 0 {
            self.inbound = 1;
        }
    }

    /// Returns `seq` and every later outbound number to the pool.
    ///
    /// Used when a message was numbered but never sent, so the next
    /// message reuses its number and the peer sees no gap.
    pub const fn rewind_outbound(&mut self, seq: u64) {
        if seq < self.outbound {
            self.outbound = seq;
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn accepts_contiguous_run() {
        let mut v = SequenceValidator::new();
        for seq in 0..5 {
            v.observe(Direction::Inbound, Some(seq)).unwrap();
        }
        assert_eq!(v.next_expected(Direction::Inbound), 5);
        assert_eq!(v.next_expected(Direction::Outbound), 0);
    }

    #[test]
    fn rejects_gap_duplicate_and_missing() {
        let mut v = SequenceValidator::new();
        v.observe(Direction::Inbound, Some(0)).unwrap();

        for bad in [Some(2), Some(0), None] {
            assert_eq!(
                v.observe(Direction::Inbound, bad),
                Err(FlowError::Sequence {
                    expected: 1,
                    got: bad
                })
            );
        }
        v.observe(Direction::Inbound, Some(1)).unwrap();
    }

    #[test]
    fn directions_are_independent() {
        let mut v = SequenceValidator::new();
        assert_eq!(v.next_outbound(), 0);
        assert_eq!(v.next_outbound(), 1);
        v.observe(Direction::Inbound, Some(0)).unwrap();
        assert_eq!(v.next_expected(Direction::Outbound), 2);
        assert_eq!(v.next_expected(Direction::Inbound), 1);
    }

    #[test]
    fn accepted_open_expects_one() {
        let mut v = SequenceValidator::new();
        v.accept_open();
        v.accept_open();
        assert_eq!(v.next_expected(Direction::Inbound), 1);
        v.observe(Direction::Inbound, Some(1)).unwrap();
    }

    #[test]
    fn rewound_numbers_are_reused() {
        let mut v = SequenceValidator::new();
        for _ in 0..4 {
            v.next_outbound();
        }
        v.rewind_outbound(2);
        assert_eq!(v.next_outbound(), 2);
        // never moves forward
        v.rewind_outbound(7);
        assert_eq!(v.next_outbound(), 3);
    }

    proptest! {
        #[test]
        fn inbound_accepts_only_the_next_number(
            offsets in prop::collection::vec(prop::option::weighted(0.9, -2i64..=2), 0..100)
        ) {
            let mut v = SequenceValidator::new();
            let mut expected = 0u64;
            for offset in offsets {
                let seq = offset.and_then(|d| expected.checked_add_signed(d));
                let result = v.observe(Direction::Inbound, seq);
                if seq == Some(expected) {
                    prop_assert!(result.is_ok());
                    expected += 1;
                } else {
                    prop_assert_eq!(result, Err(FlowError::Sequence { expected, got: seq }));
                }
                prop_assert_eq!(v.next_expected(Direction::Inbound), expected);
                prop_assert_eq!(v.next_expected(Direction::Outbound), 0);
            }
        }
    }
}
