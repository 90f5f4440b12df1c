//! TCP transport using length-prefixed frames.
//!
//! A client holds one connection and sends everything over it. A server
//! names each accepted connection `conn-N` and uses that name as the
//! sender address of everything read from it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zflow_proto::{recv_frame, send_frame};

use super::{Inbound, Transport};
use crate::router::Address;
use crate::{Error, Result};

const CHANNEL_CAPACITY: usize = 256;

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Reads frames until the connection ends, tagging each with `sender`.
async fn read_loop(mut reader: OwnedReadHalf, sender: Option<Address>, tx: mpsc::Sender<Inbound>) {
    loop {
        match recv_frame(&mut reader).await {
            Ok(payload) => {
                if tx.send(Inbound::new(sender.clone(), payload)).await.is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
            Err(e) => {
                tracing::warn!(sender = sender.as_deref(), err = %e, "connection read failed");
                return;
            }
        }
    }
}

async fn write(writer: &Writer, payload: &[u8]) -> Result<()> {
    send_frame(&mut *writer.lock().await, payload).await?;
    Ok(())
}

/// Client side: one connection to a server.
#[derive(Debug)]
pub struct TcpClient {
    writer: Writer,
    rx: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    reader: JoinHandle<()>,
}

impl TcpClient {
    /// Connects to a server.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Ok(Self {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            rx: tokio::sync::Mutex::new(rx),
            reader: tokio::spawn(read_loop(reader, None, tx)),
        })
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Transport for TcpClient {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn send_to_server(&self, payload: Vec<u8>) -> Result<()> {
        write(&self.writer, &payload).await
    }

    /// There is only one peer; the address is not needed to reach it.
    async fn send_to_address(&self, _address: &str, payload: Vec<u8>) -> Result<()> {
        write(&self.writer, &payload).await
    }

    async fn recv(&self) -> Result<Inbound> {
        self.rx.lock().await.recv().await.ok_or(Error::TransportClosed)
    }
}

/// Server side: accepts any number of client connections.
#[derive(Debug)]
pub struct TcpServer {
    local_addr: SocketAddr,
    writers: Arc<Mutex<HashMap<Address, Writer>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    acceptor: JoinHandle<()>,
}

impl TcpServer {
    /// Binds and starts accepting connections.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let writers: Arc<Mutex<HashMap<Address, Writer>>> = Arc::default();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let acceptor = tokio::spawn(accept_loop(listener, Arc::clone(&writers), tx));
        tracing::info!(%local_addr, "listening");
        Ok(Self {
            local_addr,
            writers,
            rx: tokio::sync::Mutex::new(rx),
            acceptor,
        })
    }

    /// Address the listener is bound to.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn writer(&self, address: &str) -> Option<Writer> {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }
}

async fn accept_loop(
    listener: TcpListener,
    writers: Arc<Mutex<HashMap<Address, Writer>>>,
    tx: mpsc::Sender<Inbound>,
) {
    let next = AtomicU64::new(1);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(err = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(err = %e, "set_nodelay failed");
        }
        let address = format!("conn-{}", next.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%peer, %address, "connection accepted");
        let (reader, writer) = stream.into_split();
        writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone(), Arc::new(tokio::sync::Mutex::new(writer)));

        let writers = Arc::clone(&writers);
        let tx = tx.clone();
        tokio::spawn(async move {
            read_loop(reader, Some(address.clone()), tx).await;
            writers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&address);
            tracing::debug!(%address, "connection closed");
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl Transport for TcpServer {
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
        let Some(writer) = self.writer(address) else {
            tracing::debug!(address, "connection gone, payload dropped");
            return Ok(());
        };
        write(&writer, &payload).await
    }

    async fn recv(&self) -> Result<Inbound> {
        self.rx.lock().await.recv().await.ok_or(Error::TransportClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_a_real_socket() {
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let client = TcpClient::connect(server.local_addr()).await.unwrap();

        client.send_to_server(b"open".to_vec()).await.unwrap();
        let got = server.recv().await.unwrap();
        assert_eq!(got.payload, b"open");
        let address = got.sender.unwrap();
        assert!(address.starts_with("conn-"));

        server.send_to_address(&address, b"reply".to_vec()).await.unwrap();
        let got = client.recv().await.unwrap();
        assert_eq!(got.sender, None);
        assert_eq!(got.payload, b"reply");
    }

    #[tokio::test]
    async fn client_sees_server_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { drop(listener.accept().await.unwrap()) });
        let client = TcpClient::connect(addr).await.unwrap();
        accept.await.unwrap();
        assert!(matches!(client.recv().await, Err(Error::TransportClosed)));
    }
}
