use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::Client;
use shared::{
    domain::{ConversationId, Message, UserId},
    protocol::{AckPayload, ClientFrame, ClientRequest, ServerEvent, ServerFrame, UnreadSnapshot},
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{info, warn};

use crate::ClientTuning;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("socket send failed: {0}")]
    Socket(String),
    #[error("no acknowledgment within {0:?}")]
    AckTimeout(Duration),
    #[error("http fallback failed: {0}")]
    Http(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub expect_ack: bool,
    pub timeout: Duration,
}

impl SendOptions {
    pub fn ack(timeout: Duration) -> Self {
        Self {
            expect_ack: true,
            timeout,
        }
    }

    /// No ack wait and no HTTP fallback; used for heartbeats only.
    pub fn fire_and_forget() -> Self {
        Self {
            expect_ack: false,
            timeout: Duration::ZERO,
        }
    }
}

/// Write half of an open socket connection.
#[async_trait]
pub trait SocketSink: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<()>;
}

/// Factory for the persistent bidirectional connection. Each `open` call
/// yields a fresh sink plus the inbound frame stream for that connection;
/// the stream ending means the connection dropped.
#[async_trait]
pub trait SocketChannel: Send + Sync {
    async fn open(&self) -> Result<(Box<dyn SocketSink>, mpsc::Receiver<ServerFrame>)>;
}

/// The stateless request/response channel. `submit` carries the same logical
/// payload a socket frame would; the fetch methods back reconciliation.
#[async_trait]
pub trait HttpChannel: Send + Sync {
    async fn submit(&self, sender: &UserId, request: &ClientRequest) -> Result<AckPayload>;
    async fn fetch_messages(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
    ) -> Result<Vec<Message>>;
    async fn fetch_unread(&self, sender: &UserId) -> Result<UnreadSnapshot>;
}

pub struct MissingSocketChannel;

#[async_trait]
impl SocketChannel for MissingSocketChannel {
    async fn open(&self) -> Result<(Box<dyn SocketSink>, mpsc::Receiver<ServerFrame>)> {
        Err(anyhow!("socket channel is unavailable"))
    }
}

pub struct MissingHttpChannel;

#[async_trait]
impl HttpChannel for MissingHttpChannel {
    async fn submit(&self, _sender: &UserId, _request: &ClientRequest) -> Result<AckPayload> {
        Err(anyhow!("http channel is unavailable"))
    }

    async fn fetch_messages(
        &self,
        _sender: &UserId,
        _conversation: &ConversationId,
    ) -> Result<Vec<Message>> {
        Err(anyhow!("http channel is unavailable"))
    }

    async fn fetch_unread(&self, _sender: &UserId) -> Result<UnreadSnapshot> {
        Err(anyhow!("http channel is unavailable"))
    }
}

/// Delay before reconnect attempt `attempt` (0-based): capped exponential
/// backoff with jitter, widening to a slow steady interval once the rapid
/// attempts are spent. Never signals "give up".
pub fn backoff_delay(tuning: &ClientTuning, attempt: u32) -> Duration {
    if attempt >= tuning.reconnect_rapid_attempts {
        return tuning.reconnect_idle;
    }
    let exp = tuning
        .reconnect_initial
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(tuning.reconnect_cap);
    let jitter_cap = (exp.as_millis() / 4).max(1) as u64;
    let jitter = rand::thread_rng().gen_range(0..jitter_cap);
    exp + Duration::from_millis(jitter)
}

/// Dual-channel transport: socket-first with ack wait, HTTP fallback.
///
/// Owned explicitly and injected into the delivery pipeline and reconnect
/// manager; connection lifecycle belongs to whoever constructed it, never to
/// module-level globals.
pub struct Transport {
    user_id: UserId,
    socket: Arc<dyn SocketChannel>,
    http: Arc<dyn HttpChannel>,
    tuning: ClientTuning,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<ServerEvent>,
    sink: Mutex<Option<Box<dyn SocketSink>>>,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<AckPayload>>>,
    next_request_id: AtomicU64,
}

impl Transport {
    /// Builds the transport and hands back the push-event stream consumed by
    /// the client's event pump.
    pub fn new(
        user_id: UserId,
        socket: Arc<dyn SocketChannel>,
        http: Arc<dyn HttpChannel>,
        tuning: ClientTuning,
    ) -> (Arc<Self>, mpsc::Receiver<ServerEvent>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(256);
        let transport = Arc::new(Self {
            user_id,
            socket,
            http,
            tuning,
            state_tx,
            events_tx,
            sink: Mutex::new(None),
            pending_acks: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        });
        (transport, events_rx)
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    pub fn http(&self) -> Arc<dyn HttpChannel> {
        Arc::clone(&self.http)
    }

    /// Connection maintenance loop. Runs until the owning client shuts the
    /// task down; a session that stays alive keeps retrying forever.
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            let _ = self.state_tx.send(ConnectionState::Connecting);
            match self.socket.open().await {
                Ok((sink, mut inbound)) => {
                    attempt = 0;
                    *self.sink.lock().await = Some(sink);
                    let _ = self.state_tx.send(ConnectionState::Connected);
                    info!("transport: connected");

                    while let Some(frame) = inbound.recv().await {
                        match frame {
                            ServerFrame::Ack { request_id, ack } => {
                                if let Some(waiter) =
                                    self.pending_acks.lock().await.remove(&request_id)
                                {
                                    let _ = waiter.send(ack);
                                }
                            }
                            ServerFrame::Event(event) => {
                                if self.events_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }

                    *self.sink.lock().await = None;
                    // Abandoned waiters see a closed channel and fall back.
                    self.pending_acks.lock().await.clear();
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    warn!("transport: connection lost");
                }
                Err(err) => {
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    let delay = backoff_delay(&self.tuning, attempt);
                    warn!(attempt, ?delay, "transport: connect failed: {err}");
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Sends one logical event. Socket-first when connected, awaiting an ack
    /// within the timeout; falls back to HTTP on ack timeout or socket error
    /// when an ack is expected. With the socket down, goes straight to HTTP.
    /// Fire-and-forget sends never fall back.
    pub async fn send(
        &self,
        request: ClientRequest,
        options: SendOptions,
    ) -> Result<AckPayload, TransportError> {
        if self.is_connected() {
            match self.send_over_socket(&request, options).await {
                Ok(ack) => return Ok(ack),
                Err(err) if options.expect_ack => {
                    warn!("transport: socket send failed, using http fallback: {err}");
                }
                Err(err) => return Err(err),
            }
        } else if !options.expect_ack {
            return Err(TransportError::NotConnected);
        }

        self.http
            .submit(&self.user_id, &request)
            .await
            .map_err(|err| TransportError::Http(err.to_string()))
    }

    async fn send_over_socket(
        &self,
        request: &ClientRequest,
        options: SendOptions,
    ) -> Result<AckPayload, TransportError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = ClientFrame {
            request_id,
            sender_id: self.user_id.clone(),
            request: request.clone(),
        };

        let ack_rx = if options.expect_ack {
            let (tx, rx) = oneshot::channel();
            self.pending_acks.lock().await.insert(request_id, tx);
            Some(rx)
        } else {
            None
        };

        let send_result = {
            let mut sink = self.sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink.send(frame).await,
                None => Err(anyhow!("socket sink closed")),
            }
        };
        if let Err(err) = send_result {
            self.pending_acks.lock().await.remove(&request_id);
            return Err(TransportError::Socket(err.to_string()));
        }

        let Some(ack_rx) = ack_rx else {
            return Ok(AckPayload::Ok);
        };

        match tokio::time::timeout(options.timeout, ack_rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => {
                // Connection dropped while waiting; waiter was cleared.
                Err(TransportError::Socket("connection lost".into()))
            }
            Err(_) => {
                self.pending_acks.lock().await.remove(&request_id);
                Err(TransportError::AckTimeout(options.timeout))
            }
        }
    }
}

/// tokio-tungstenite implementation of the persistent channel.
pub struct WsSocketChannel {
    ws_url: String,
}

impl WsSocketChannel {
    pub fn new(server_url: &str, user_id: &UserId) -> Result<Self> {
        let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        Ok(Self {
            ws_url: format!("{ws_base}/ws?user_id={user_id}"),
        })
    }
}

struct WsSink {
    writer: futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        WsMessage,
    >,
}

#[async_trait]
impl SocketSink for WsSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let text = serde_json::to_string(&frame)?;
        self.writer
            .send(WsMessage::Text(text))
            .await
            .context("websocket send failed")
    }
}

#[async_trait]
impl SocketChannel for WsSocketChannel {
    async fn open(&self) -> Result<(Box<dyn SocketSink>, mpsc::Receiver<ServerFrame>)> {
        let (stream, _) = connect_async(&self.ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.ws_url))?;
        let (writer, mut reader) = stream.split();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => {
                                if tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!("transport: invalid server frame: {err}"),
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok((Box::new(WsSink { writer }), rx))
    }
}

/// reqwest implementation of the request/response channel. Every operation
/// posts the same `ClientRequest` payload a socket frame would carry.
pub struct HttpApi {
    http: Client,
    server_url: String,
}

impl HttpApi {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }
}

#[async_trait]
impl HttpChannel for HttpApi {
    async fn submit(&self, sender: &UserId, request: &ClientRequest) -> Result<AckPayload> {
        let ack: AckPayload = self
            .http
            .post(format!("{}/requests", self.server_url))
            .query(&[("user_id", sender.as_str())])
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ack)
    }

    async fn fetch_messages(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
    ) -> Result<Vec<Message>> {
        let (kind, id) = match conversation {
            ConversationId::Direct(user) => ("direct", user.as_str()),
            ConversationId::Group(group) => ("group", group.as_str()),
        };
        let messages: Vec<Message> = self
            .http
            .get(format!("{}/messages", self.server_url))
            .query(&[
                ("user_id", sender.as_str()),
                ("conversation_kind", kind),
                ("conversation_id", id),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    async fn fetch_unread(&self, sender: &UserId) -> Result<UnreadSnapshot> {
        let snapshot: UnreadSnapshot = self
            .http
            .get(format!("{}/unread", self.server_url))
            .query(&[("user_id", sender.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_widens() {
        let tuning = ClientTuning::default();
        let first = backoff_delay(&tuning, 0);
        assert!(first >= tuning.reconnect_initial);
        assert!(first < tuning.reconnect_initial * 2);

        let capped = backoff_delay(&tuning, tuning.reconnect_rapid_attempts - 1);
        assert!(capped <= tuning.reconnect_cap + tuning.reconnect_cap / 4);

        let idle = backoff_delay(&tuning, tuning.reconnect_rapid_attempts);
        assert_eq!(idle, tuning.reconnect_idle);
        // Never gives up: far past the rapid window it still yields a delay.
        assert_eq!(backoff_delay(&tuning, 10_000), tuning.reconnect_idle);
    }
}
