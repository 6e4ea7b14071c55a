//! The relay session: one WebSocket channel to the broker per tunnel.
//!
//! The session is the only writer on the channel. Forwarders hand it frames
//! through a [`FrameSender`], and inbound frames are dispatched to a
//! [`FrameHandler`] strictly in arrival order.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, AUTHORIZATION};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::control::TunnelDescriptor;
use crate::error::{Result, TunnelError};
use crate::protocol::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Serialized outbound path onto the channel
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
}

impl FrameSender {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TunnelError::SessionClosed {
                reason: "channel writer has stopped".to_string(),
            })
    }

    pub async fn send_payload<T: Serialize>(&self, payload: &T) -> Result<()> {
        self.send(Frame::data(payload)?).await
    }
}

/// Receives the payload of every inbound data frame.
///
/// Called inline by the session loop, so implementations must hand long
/// work off to their own tasks.
pub trait FrameHandler {
    async fn on_frame(&mut self, payload: serde_json::Value);
}

pub struct Session {
    descriptor: TunnelDescriptor,
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    outbound_tx: Option<mpsc::Sender<Frame>>,
    outbound_rx: mpsc::Receiver<Frame>,
    state: SessionState,
    frames_received: u64,
    drain_deadline: Option<Instant>,
}

impl Session {
    /// Perform the channel handshake. One attempt, no retries.
    pub async fn open(descriptor: TunnelDescriptor, channel_url: &Url, token: &str) -> Result<Self> {
        info!(tunnel_id = %descriptor.id, "Connecting to {}", channel_url);

        let mut request = channel_url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| TunnelError::Protocol("API token contains invalid characters".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, response) = connect_async(request).await?;
        debug!("Channel handshake completed: {}", response.status());

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        Ok(Self {
            descriptor,
            sink,
            stream,
            outbound_tx: Some(outbound_tx),
            outbound_rx,
            state: SessionState::Open,
            frames_received: 0,
            drain_deadline: None,
        })
    }

    pub fn descriptor(&self) -> &TunnelDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Data frames handed to the handler so far
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Set once cancellation started the drain
    pub fn drain_deadline(&self) -> Option<Instant> {
        self.drain_deadline
    }

    /// Handle for queueing frames onto the channel
    pub fn sender(&self) -> FrameSender {
        let tx = match &self.outbound_tx {
            Some(tx) => tx.clone(),
            // Once running, the channel only lives as long as existing senders
            None => mpsc::channel(1).0,
        };
        FrameSender::new(tx)
    }

    /// Event loop. Returns `Ok(())` after a cancellation has drained all
    /// outstanding senders, `SessionClosed` when the broker ends the
    /// session, `Network` on transport failure. The channel is closed on
    /// every path.
    pub async fn run<H: FrameHandler>(
        &mut self,
        handler: H,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Result<()> {
        let result = self.pump(handler, cancel, grace).await;
        self.close().await;
        result
    }

    async fn pump<H: FrameHandler>(
        &mut self,
        handler: H,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Result<()> {
        // Remaining senders belong to the handler and its tasks
        self.outbound_tx = None;

        let tunnel_id = self.descriptor.id.clone();
        let mut handler = Some(handler);
        let mut outbound_done = false;

        loop {
            if self.drain_deadline.is_some() && outbound_done {
                info!(tunnel_id = %tunnel_id, "In-flight work drained");
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if self.drain_deadline.is_none() => {
                    info!(tunnel_id = %tunnel_id, "Stopping relay, draining in-flight work");
                    self.state = SessionState::Closing;
                    self.drain_deadline = Some(Instant::now() + grace);
                    handler = None;
                }

                outbound = self.outbound_rx.recv(), if !outbound_done => match outbound {
                    Some(frame) => {
                        let json = frame.to_json()?;
                        self.sink.send(Message::Text(json)).await?;
                    }
                    None => outbound_done = true,
                },

                inbound = self.stream.next(), if self.drain_deadline.is_none() => match inbound {
                    Some(Ok(Message::Text(text))) => match Frame::from_json(&text) {
                        Ok(Frame::Data { payload }) => {
                            self.frames_received += 1;
                            if let Some(handler) = handler.as_mut() {
                                handler.on_frame(payload).await;
                            }
                        }
                        Ok(Frame::Error { message }) => {
                            error!(tunnel_id = %tunnel_id, "Broker error: {}", message);
                            return Err(TunnelError::SessionClosed { reason: message });
                        }
                        Err(e) => warn!("Ignoring undecodable frame: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        debug!("Received ping, sending pong");
                        self.sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "broker closed the channel".to_string());
                        info!(tunnel_id = %tunnel_id, "Server closed connection: {}", reason);
                        return Err(TunnelError::SessionClosed { reason });
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("Received binary message (ignoring)");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket read error: {}", e);
                        return Err(e.into());
                    }
                    None => {
                        return Err(TunnelError::SessionClosed {
                            reason: "channel closed".to_string(),
                        });
                    }
                },

                _ = tokio::time::sleep_until(self.drain_deadline.unwrap_or_else(Instant::now)),
                    if self.drain_deadline.is_some() =>
                {
                    warn!(tunnel_id = %tunnel_id, "Shutdown grace period elapsed with work still in flight");
                    return Ok(());
                }
            }
        }
    }

    /// Close the channel. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;

        let closing = async {
            let _ = self.sink.send(Message::Close(None)).await;
            let _ = self.sink.close().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            debug!("Timed out closing channel");
        }

        self.state = SessionState::Closed;
        debug!(tunnel_id = %self.descriptor.id, "Channel closed");
    }
}
