//! TCP tunnel handler: one local socket per broker-announced connection.
//!
//! Each connection runs two independent copy loops. End-of-stream in one
//! direction only half-closes; the connection is torn down once both
//! directions are done, or as soon as either reports an error.

use base64::Engine;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::session::{FrameHandler, FrameSender};
use crate::error::{Result, TunnelError};
use crate::protocol::{ConnectionId, TcpEvent};

const CHUNK_SIZE: usize = 16 * 1024;
/// Broker chunks queued per connection before it is closed as too slow
const INBOUND_CAPACITY: usize = 64;
const OVERFLOW_REASON: &str = "receive buffer overflow";

/// Broker-to-local traffic for one connection
enum Inbound {
    Data(Vec<u8>),
    End,
}

/// Early teardown of a single connection
#[derive(Clone)]
struct Teardown {
    cancel: CancellationToken,
    overflowed: Arc<AtomicBool>,
}

impl Teardown {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            overflowed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn overflow(&self) {
        self.overflowed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst)
    }
}

struct ConnectionHandle {
    tx: mpsc::Sender<Inbound>,
    teardown: Teardown,
}

type Connections = Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>;

pub struct TcpForwarder {
    local_host: String,
    local_port: u16,
    sender: FrameSender,
    cancel: CancellationToken,
    tasks: TaskTracker,
    connections: Connections,
}

impl TcpForwarder {
    /// `cancel` ends every connection of this forwarder.
    pub fn new(
        local_host: &str,
        local_port: u16,
        sender: FrameSender,
        cancel: CancellationToken,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            local_host: local_host.to_string(),
            local_port,
            sender,
            cancel,
            tasks,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn open(&self, connection_id: ConnectionId) {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&connection_id) {
            warn!(connection_id = %connection_id, "Duplicate open for live connection");
            return;
        }

        // Registered before dialing so early data queues up in order
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let teardown = Teardown::new(self.cancel.child_token());
        connections.insert(
            connection_id.clone(),
            ConnectionHandle {
                tx,
                teardown: teardown.clone(),
            },
        );
        drop(connections);

        info!(
            connection_id = %connection_id,
            "TCP connect -> {}:{}", self.local_host, self.local_port
        );

        self.tasks.spawn(run_connection(
            connection_id,
            self.local_host.clone(),
            self.local_port,
            rx,
            self.sender.clone(),
            teardown,
            self.connections.clone(),
        ));
    }

    /// Queue without waiting; the session loop must never block on one
    /// slow local socket.
    async fn deliver(&self, connection_id: &ConnectionId, inbound: Inbound) {
        let connections = self.connections.read().await;
        let Some(conn) = connections.get(connection_id) else {
            warn!(connection_id = %connection_id, "TCP data for unknown connection");
            return;
        };

        match conn.tx.try_send(inbound) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %connection_id, "Local side is not keeping up, closing connection");
                conn.teardown.overflow();
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %connection_id, "Local side already finished");
            }
        }
    }
}

impl FrameHandler for TcpForwarder {
    async fn on_frame(&mut self, payload: serde_json::Value) {
        let event: TcpEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring malformed TCP frame: {}", e);
                return;
            }
        };

        match event {
            TcpEvent::Open { connection_id } => self.open(connection_id).await,
            TcpEvent::Data {
                connection_id,
                data,
            } => match base64::engine::general_purpose::STANDARD.decode(&data) {
                Ok(bytes) => {
                    debug!(connection_id = %connection_id, "TCP data received: {} bytes", bytes.len());
                    self.deliver(&connection_id, Inbound::Data(bytes)).await;
                }
                Err(e) => warn!(connection_id = %connection_id, "Undecodable TCP data: {}", e),
            },
            TcpEvent::End { connection_id } => self.deliver(&connection_id, Inbound::End).await,
            TcpEvent::Close {
                connection_id,
                reason,
            } => {
                let removed = self.connections.write().await.remove(&connection_id);
                if let Some(conn) = removed {
                    conn.teardown.cancel.cancel();
                }
                info!(
                    connection_id = %connection_id,
                    "TCP connection closed by broker: {}",
                    reason.as_deref().unwrap_or("no reason")
                );
            }
            TcpEvent::Connected { connection_id } => {
                debug!(connection_id = %connection_id, "Ignoring unexpected connected event");
            }
        }
    }
}

async fn run_connection(
    connection_id: ConnectionId,
    local_host: String,
    local_port: u16,
    rx: mpsc::Receiver<Inbound>,
    sender: FrameSender,
    teardown: Teardown,
    connections: Connections,
) {
    let cancel = &teardown.cancel;
    let dialed = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let reason = if teardown.overflowed() { OVERFLOW_REASON } else { "shutdown" };
            finish(&connection_id, &connections, &sender, reason).await;
            return;
        }
        result = TcpStream::connect((local_host.as_str(), local_port)) => result,
    };

    let stream = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            let err = TunnelError::LocalService(format!(
                "connect to {}:{} failed: {}",
                local_host, local_port, e
            ));
            warn!(connection_id = %connection_id, "{}", err);
            finish(&connection_id, &connections, &sender, &format!("Connection failed: {}", e)).await;
            return;
        }
    };

    if let Err(e) = sender
        .send_payload(&TcpEvent::Connected {
            connection_id: connection_id.clone(),
        })
        .await
    {
        debug!(connection_id = %connection_id, "Channel gone before connect ack: {}", e);
        connections.write().await.remove(&connection_id);
        return;
    }

    let (read_half, write_half) = stream.into_split();

    let (to_local, to_remote) = tokio::join!(
        copy_to_local(rx, write_half, cancel),
        copy_to_remote(read_half, &connection_id, &sender, cancel),
    );

    let reason = match (&to_local, &to_remote) {
        _ if teardown.overflowed() => OVERFLOW_REASON.to_string(),
        (Err(e), _) | (_, Err(e)) => e.to_string(),
        _ if cancel.is_cancelled() => "shutdown".to_string(),
        _ => "closed".to_string(),
    };

    info!(
        connection_id = %connection_id,
        bytes_to_local = to_local.as_ref().copied().unwrap_or(0),
        bytes_to_remote = to_remote.as_ref().copied().unwrap_or(0),
        "TCP forward completed: {}",
        reason
    );

    finish(&connection_id, &connections, &sender, &reason).await;
}

/// Unregister the connection; tell the broker unless it closed it first
async fn finish(
    connection_id: &ConnectionId,
    connections: &Connections,
    sender: &FrameSender,
    reason: &str,
) {
    let still_registered = connections.write().await.remove(connection_id).is_some();
    if still_registered {
        let _ = sender
            .send_payload(&TcpEvent::close(connection_id, reason))
            .await;
    }
}

/// Broker -> local. Stops on `End` with a half-close of the local socket.
async fn copy_to_local(
    mut rx: mpsc::Receiver<Inbound>,
    mut write_half: OwnedWriteHalf,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut total = 0u64;

    loop {
        let inbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            inbound = rx.recv() => inbound.or(Some(Inbound::End)),
        };

        match inbound {
            Some(Inbound::Data(bytes)) => {
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    written = write_half.write_all(&bytes) => written,
                };
                if let Err(e) = written {
                    cancel.cancel();
                    return Err(e.into());
                }
                total += bytes.len() as u64;
            }
            Some(Inbound::End) | None => break,
        }
    }

    // Signal end-of-stream rather than resetting
    let _ = write_half.shutdown().await;
    Ok(total)
}

/// Local -> broker, in bounded chunks. Waiting for channel capacity only
/// suspends this direction.
async fn copy_to_remote(
    mut read_half: OwnedReadHalf,
    connection_id: &ConnectionId,
    sender: &FrameSender,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut total = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(total),
            read = read_half.read(&mut buf) => read,
        };

        let sent = match read {
            Ok(0) => {
                debug!(connection_id = %connection_id, "Local side finished writing");
                return sender
                    .send_payload(&TcpEvent::End {
                        connection_id: connection_id.clone(),
                    })
                    .await
                    .map(|_| total)
                    .inspect_err(|_| cancel.cancel());
            }
            Ok(n) => {
                total += n as u64;
                sender
                    .send_payload(&TcpEvent::data(connection_id, &buf[..n]))
                    .await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = sent {
            cancel.cancel();
            return Err(e);
        }
    }
}
