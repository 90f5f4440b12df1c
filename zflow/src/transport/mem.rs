//! In-process transport.
//!
//! A [`MemNetwork`] is a hub of named inboxes. Clients push open messages
//! to a bound server name; every endpoint can address any other by name,
//! and each delivery is tagged with the sender's name.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use super::{Inbound, Transport};
use crate::router::Address;
use crate::{Error, Result};

const CHANNEL_CAPACITY: usize = 256;

type Inboxes = HashMap<Address, mpsc::Sender<Inbound>>;

/// Hub connecting in-process endpoints.
#[derive(Debug, Clone, Default)]
pub struct MemNetwork {
    inboxes: Arc<Mutex<Inboxes>>,
}

impl MemNetwork {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a server under `name`.
    pub fn bind_server(&self, name: &str) -> Result<MemServer> {
        Ok(MemServer {
            endpoint: self.register(name)?,
        })
    }

    /// Registers a client under `address`, talking to the server `server`.
    pub fn connect_client(&self, address: &str, server: &str) -> Result<MemClient> {
        Ok(MemClient {
            endpoint: self.register(address)?,
            server: server.to_owned(),
        })
    }

    fn register(&self, address: &str) -> Result<Endpoint> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut inboxes = self.lock();
        if inboxes.contains_key(address) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("address `{address}` already bound"),
            )));
        }
        inboxes.insert(address.to_owned(), tx);
        drop(inboxes);
        Ok(Endpoint {
            network: self.clone(),
            address: address.to_owned(),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inboxes> {
        self.inboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inbox(&self, address: &str) -> Option<mpsc::Sender<Inbound>> {
        self.lock().get(address).cloned()
    }
}

/// Shared half of clients and servers.
#[derive(Debug)]
struct Endpoint {
    network: MemNetwork,
    address: Address,
    rx: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
}

impl Endpoint {
    /// Delivers to `to`. Payloads for unbound addresses are dropped, as on
    /// a publish/subscribe bus with no subscriber.
    async fn deliver(&self, to: &str, payload: Vec<u8>) -> Result<()> {
        let Some(inbox) = self.network.inbox(to) else {
            tracing::debug!(from = %self.address, to, "no such address, payload dropped");
            return Ok(());
        };
        let inbound = Inbound::new(Some(self.address.clone()), payload);
        if inbox.send(inbound).await.is_err() {
            tracing::debug!(to, "receiver gone, payload dropped");
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Inbound> {
        self.rx.lock().await.recv().await.ok_or(Error::TransportClosed)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.network.lock().remove(&self.address);
    }
}

/// Client end of a [`MemNetwork`].
#[derive(Debug)]
pub struct MemClient {
    endpoint: Endpoint,
    server: Address,
}

impl MemClient {
    /// This client's address.
    pub fn address(&self) -> &str {
        &self.endpoint.address
    }
}

impl Transport for MemClient {
    async fn ready(&self) -> Result<()> {
        if self.endpoint.network.inbox(&self.server).is_none() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no server bound at `{}`", self.server),
            )));
        }
        Ok(())
    }

    async fn send_to_server(&self, payload: Vec<u8>) -> Result<()> {
        self.endpoint.deliver(&self.server, payload).await
    }

    async fn send_to_address(&self, address: &str, payload: Vec<u8>) -> Result<()> {
        self.endpoint.deliver(address, payload).await
    }

    async fn recv(&self) -> Result<Inbound> {
        self.endpoint.recv().await
    }
}

/// Server end of a [`MemNetwork`].
#[derive(Debug)]
pub struct MemServer {
    endpoint: Endpoint,
}

impl MemServer {
    /// The name clients reach this server by.
    pub fn address(&self) -> &str {
        &self.endpoint.address
    }
}

impl Transport for MemServer {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn send_to_server(&self, _payload: Vec<u8>) -> Result<()> {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "a server does not open flows",
        )))
    }

    async fn send_to_address(&self, address: &str, payload: Vec<u8>) -> Result<()> {
        self.endpoint.deliver(address, payload).await
    }

    async fn recv(&self) -> Result<Inbound> {
        self.endpoint.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_routes_by_name() {
        let net = MemNetwork::new();
        let server = net.bind_server("srv").unwrap();
        let client = net.connect_client("c1", "srv").unwrap();
        client.ready().await.unwrap();

        client.send_to_server(b"open".to_vec()).await.unwrap();
        let got = server.recv().await.unwrap();
        assert_eq!(got.sender.as_deref(), Some("c1"));
        assert_eq!(got.payload, b"open");

        server.send_to_address("c1", b"reply".to_vec()).await.unwrap();
        let got = client.recv().await.unwrap();
        assert_eq!(got.sender.as_deref(), Some("srv"));

        // nobody listening: dropped, not an error
        server.send_to_address("c2", b"lost".to_vec()).await.unwrap();
        assert!(server.send_to_server(Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn names_are_exclusive_until_dropped() {
        let net = MemNetwork::new();
        let client = net.connect_client("c1", "srv").unwrap();
        assert!(client.ready().await.is_err());
        assert!(net.connect_client("c1", "srv").is_err());
        drop(client);
        net.connect_client("c1", "srv").unwrap();
    }
}
