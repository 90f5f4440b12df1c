//! Per-flow credit accounting.
//!
//! Credits are the protocol's only backpressure: a sender may put at most
//! `remote` body bytes on the wire before the peer grants more. This works
//! over push-style transports that have no acknowledgement of their own.

use crate::FlowError;

/// Credit balance of one flow, in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditLedger {
    /// Body bytes we may still send to the peer.
    remote: u64,
    /// Body bytes the peer may still send to us.
    local: u64,
    /// Hand received credits straight back to the sender.
    grant_on_receive: bool,
}

impl CreditLedger {
    /// A ledger that has offered `local` credits to the peer and holds none.
    pub const fn new(local: u64, grant_on_receive: bool) -> Self {
        Self {
            remote: 0,
            local,
            grant_on_receive,
        }
    }

    /// Credits available for sending.
    pub const fn remote(&self) -> u64 {
        self.remote
    }

    /// Credits the peer holds on our behalf, as far as we know.
    pub const fn local(&self) -> u64 {
        self.local
    }

    /// Adds `n` credits granted by the peer.
    pub const fn grant(&mut self, n: u64) {
        self.remote = self.remote.saturating_add(n);
    }

    /// How many of `desired` bytes may be sent right now.
    pub fn reserve(&self, desired: u64) -> u64 {
        desired.min(self.remote)
    }

    /// Consumes `n` credits after sending `n` body bytes.
    pub fn debit(&mut self, n: u64) -> Result<(), FlowError> {
        if n > self.remote {
            return Err(FlowError::Credit {
                requested: n,
                available: self.remote,
            });
        }
        self.remote -= n;
        Ok(())
    }

    /// Records `n` body bytes received from the peer.
    ///
    /// Returns the grant to send back, if the policy calls for one. Sending
    /// it restores the peer's view of our credits to what it was before the
    /// bytes were consumed.
    pub const fn observe_received(&mut self, n: u64) -> Option<u64> {
        self.local = self.local.saturating_sub(n);
        if n == 0 || !self.grant_on_receive {
            return None;
        }
        self.local = self.local.saturating_add(n);
        Some(n)
    }

    /// Records credits handed to the peer outside of
    /// [`observe_received`](Self::observe_received), such as an initial offer.
    pub const fn offer(&mut self, n: u64) {
        self.local = self.local.saturating_add(n);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn reserve_is_bounded_and_pure() {
        let mut ledger = CreditLedger::new(0, true);
        ledger.grant(100);
        assert_eq!(ledger.reserve(40), 40);
        assert_eq!(ledger.reserve(400), 100);
        assert_eq!(ledger.remote(), 100);
    }

    #[test]
    fn debit_refuses_overdraft() {
        let mut ledger = CreditLedger::new(0, true);
        ledger.grant(10);
        ledger.debit(4).unwrap();
        assert_eq!(
            ledger.debit(7),
            Err(FlowError::Credit {
                requested: 7,
                available: 6
            })
        );
        assert_eq!(ledger.remote(), 6);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Grant(u64),
        ReserveAndDebit(u64),
        Debit(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..700).prop_map(Op::Grant),
            (0u64..700).prop_map(Op::ReserveAndDebit),
            (0u64..700).prop_map(Op::Debit),
        ]
    }

    proptest! {
        #[test]
        fn balance_matches_grants_minus_debits(ops in prop::collection::vec(op_strategy(), 0..200)) {
            let mut ledger = CreditLedger::new(0, false);
            let mut granted = 0u64;
            let mut debited = 0u64;
            for op in ops {
                let before = ledger.remote();
                match op {
                    Op::Grant(n) => {
                        ledger.grant(n);
                        granted += n;
                    }
                    Op::ReserveAndDebit(n) => {
                        let allowed = ledger.reserve(n);
                        prop_assert!(allowed <= before);
                        prop_assert!(ledger.debit(allowed).is_ok());
                        debited += allowed;
                    }
                    Op::Debit(n) => {
                        if ledger.debit(n).is_ok() {
                            debited += n;
                        } else {
                            prop_assert!(n > before);
                            prop_assert_eq!(ledger.remote(), before);
                        }
                    }
                }
                prop_assert!(debited <= granted);
                prop_assert_eq!(ledger.remote(), granted - debited);
            }
        }
    }

    #[test]
    fn grant_back_restores_local_view() {
        let mut ledger = CreditLedger::new(200_000, true);
        assert_eq!(ledger.observe_received(500), Some(500));
        assert_eq!(ledger.local(), 200_000);
    }

    #[test]
    fn no_grant_when_policy_disabled() {
        let mut ledger = CreditLedger::new(1000, false);
        assert_eq!(ledger.observe_received(500), None);
        assert_eq!(ledger.local(), 500);
        assert_eq!(ledger.observe_received(0), None);
    }
}
