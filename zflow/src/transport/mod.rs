//! Message transports.
//!
//! The protocol needs very little from a transport: a way to reach "the
//! server" with an open message, a way to reach one previously seen peer,
//! and an ordered stream of inbound payloads. Delivery may be lossy and
//! push-style; credits provide the backpressure.

mod mem;
mod tcp;

use std::future::Future;
use std::sync::Arc;

pub use mem::{MemClient, MemNetwork, MemServer};
pub use tcp::{TcpClient, TcpServer};
use tokio::sync::mpsc;

use crate::Result;
use crate::engine::Outbound;
use crate::router::Address;

/// One received payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Inbound {
    /// Who sent it, if the transport addresses peers symmetrically.
    pub sender: Option<Address>,
    /// Encoded message.
    pub payload: Vec<u8>,
}

impl Inbound {
    /// An inbound payload.
    pub const fn new(sender: Option<Address>, payload: Vec<u8>) -> Self {
        Self { sender, payload }
    }
}

/// Delivery primitives the engines run over.
pub trait Transport: Send + Sync + 'static {
    /// Resolves once messages sent now will be delivered, such as after a
    /// subscription has been acknowledged.
    fn ready(&self) -> impl Future<Output = Result<()>> + Send;

    /// Sends a flow-open message to whichever server instance takes it.
    fn send_to_server(&self, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Sends to a previously learned peer address.
    fn send_to_address(
        &self,
        address: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Waits for the next payload.
    ///
    /// Must be cancel safe: dropping the future loses no payload. Fails
    /// with [`Error::TransportClosed`](crate::Error::TransportClosed) once
    /// nothing more can arrive.
    fn recv(&self) -> impl Future<Output = Result<Inbound>> + Send;
}

/// Sends queued payloads in order until every sender is gone.
///
/// Run as the single writer of an endpoint, so that nothing holding
/// protocol state ever waits on the transport.
pub(crate) async fn write_queued<T: Transport>(
    transport: Arc<T>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = queue.recv().await {
        let sent = match out {
            Outbound::ToServer(payload) => transport.send_to_server(payload).await,
            Outbound::ToAddress { address, payload } => {
                transport.send_to_address(&address, payload).await
            }
        };
        if let Err(err) = sent {
            tracing::warn!(%err, "send failed");
        }
    }
    tracing::debug!("writer stopped");
}
