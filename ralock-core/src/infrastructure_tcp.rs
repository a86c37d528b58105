//! TCP transport: one short-lived connection per message.
//!
//! Enable with the `tcp` feature flag:
//! ```toml
//! ralock-core = { path = "../ralock-core", features = ["tcp"] }
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::timeout;

use crate::infrastructure::{Inbound, Messenger};
use crate::topology::Topology;
use crate::types::{Message, NodeId, SendOutcome};
use crate::wire::MAX_MESSAGE_BYTES;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long an accepted connection may take to deliver its payload.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Sends each message over a fresh connection to the address the topology
/// lists for the recipient.
#[derive(Clone)]
pub struct TcpMessenger {
    topology: Arc<Topology>,
    connect_timeout: Duration,
}

impl TcpMessenger {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self {
            topology,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn try_send(&self, to: NodeId, message: Message) -> io::Result<()> {
        let address = self.topology.get(to).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("node {to} has no address"))
        })?;

        let mut stream = timeout(
            self.connect_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {address} timed out")))??;

        stream.write_all(message.encode().as_bytes()).await?;
        stream.shutdown().await
    }
}

impl Messenger for TcpMessenger {
    async fn send(&self, to: NodeId, message: Message) -> SendOutcome {
        match self.try_send(to, message).await {
            Ok(()) => SendOutcome::Delivered,
            Err(e) => SendOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }
}

/// Listening side of the TCP transport.
pub struct TcpInbound;

impl TcpInbound {
    /// Binds `addr` and starts accepting in the background. The returned
    /// stream yields one payload per connection, truncated to
    /// [`MAX_MESSAGE_BYTES`]. Accepting stops once the stream is dropped.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<(SocketAddr, Inbound)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(accept_loop(listener, tx));

        Ok((local_addr, rx))
    }
}

async fn accept_loop(listener: TcpListener, tx: UnboundedSender<Vec<u8>>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        if tx.is_closed() {
            break;
        }

        let tx = tx.clone();
        tokio::spawn(async move {
            match timeout(READ_TIMEOUT, read_payload(stream)).await {
                Ok(Ok(payload)) if !payload.is_empty() => {
                    let _ = tx.send(payload);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!(%peer, error = %e, "Failed to read inbound message"),
                Err(_) => tracing::debug!(%peer, "Inbound connection timed out"),
            }
        });
    }
}

async fn read_payload(stream: TcpStream) -> io::Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(MAX_MESSAGE_BYTES);
    stream
        .take(MAX_MESSAGE_BYTES as u64)
        .read_to_end(&mut payload)
        .await?;
    Ok(payload)
}
