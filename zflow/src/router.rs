//! Reply-address discovery.
//!
//! A flow is opened by sending to "the server", but every later message
//! must reach the specific peer instance that picked the flow up. That
//! peer's address is learned from the first inbound message of the flow
//! and is fixed from then on: flows are never re-homed.

use std::collections::HashMap;

use crate::flow::FlowId;

/// Transport-level address of a peer.
pub type Address = String;

/// Maps live flows to the address their follow-up messages must go to.
#[derive(Debug, Default)]
pub struct ReplyRouter {
    /// Learned addresses, one per flow.
    addresses: HashMap<FlowId, Address>,
}

impl ReplyRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `address` for `flow` if none is known yet.
    ///
    /// Returns `true` when the address was newly learned. A different
    /// address for an already homed flow is ignored.
    pub fn record_address(&mut self, flow: &FlowId, address: &str) -> bool {
        match self.addresses.get(flow) {
            Some(known) => {
                if known != address {
                    tracing::warn!(%flow, %known, ignored = address, "reply address change ignored");
                }
                false
            }
            None => {
                tracing::debug!(%flow, address, "reply address learned");
                self.addresses.insert(flow.clone(), address.to_owned());
                true
            }
        }
    }

    /// Address for `flow`, if learned.
    pub fn address_for(&self, flow: &FlowId) -> Option<&str> {
        self.addresses.get(flow).map(String::as_str)
    }

    /// Drops the entry for a finished flow.
    pub fn forget(&mut self, flow: &FlowId) {
        self.addresses.remove(flow);
    }

    /// Number of homed flows.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether no flow is homed.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_address_wins() {
        let mut router = ReplyRouter::new();
        let flow = FlowId::from("f1");
        assert_eq!(router.address_for(&flow), None);

        assert!(router.record_address(&flow, "worker-a"));
        assert!(!router.record_address(&flow, "worker-b"));
        assert_eq!(router.address_for(&flow), Some("worker-a"));

        router.forget(&flow);
        assert!(router.is_empty());
    }
}
