use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, Message, MessageId, UserId},
    protocol::{AckPayload, ClientFrame, ClientRequest, ServerFrame, UnreadSnapshot},
};
use tokio::sync::{mpsc, Mutex};

use crate::{
    transport::{
        ConnectionState, HttpChannel, SendOptions, SocketChannel, SocketSink, Transport,
        TransportError,
    },
    ClientTuning,
};

fn fast_tuning() -> ClientTuning {
    ClientTuning {
        ack_timeout: Duration::from_millis(40),
        reconnect_initial: Duration::from_millis(10),
        reconnect_cap: Duration::from_millis(50),
        reconnect_rapid_attempts: 3,
        reconnect_idle: Duration::from_millis(100),
        poll_interval: Duration::from_millis(100),
        staleness_threshold: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(100),
    }
}

#[derive(Clone, Copy)]
enum SinkMode {
    /// Every frame gets an immediate `Ok` ack.
    AckEverything,
    /// Frames are accepted but never acknowledged.
    SwallowFrames,
    /// Every send fails at the socket layer.
    FailSends,
}

struct ScriptedSocket {
    mode: SinkMode,
    refuse_connections: AtomicBool,
    opens: AtomicU32,
}

impl ScriptedSocket {
    fn new(mode: SinkMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            refuse_connections: AtomicBool::new(false),
            opens: AtomicU32::new(0),
        })
    }

    fn refusing() -> Arc<Self> {
        let socket = Self::new(SinkMode::AckEverything);
        socket.refuse_connections.store(true, Ordering::SeqCst);
        socket
    }
}

#[async_trait]
impl SocketChannel for ScriptedSocket {
    async fn open(&self) -> Result<(Box<dyn SocketSink>, mpsc::Receiver<ServerFrame>)> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let (tx, rx) = mpsc::channel(16);
        Ok((
            Box::new(ScriptedSink {
                mode: self.mode,
                frames: tx,
            }),
            rx,
        ))
    }
}

struct ScriptedSink {
    mode: SinkMode,
    frames: mpsc::Sender<ServerFrame>,
}

#[async_trait]
impl SocketSink for ScriptedSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        match self.mode {
            SinkMode::AckEverything => {
                let _ = self
                    .frames
                    .send(ServerFrame::Ack {
                        request_id: frame.request_id,
                        ack: AckPayload::Ok,
                    })
                    .await;
                Ok(())
            }
            SinkMode::SwallowFrames => Ok(()),
            SinkMode::FailSends => Err(anyhow!("broken pipe")),
        }
    }
}

#[derive(Default)]
struct RecordingHttp {
    requests: Mutex<Vec<ClientRequest>>,
}

impl RecordingHttp {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn recorded(&self) -> Vec<ClientRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl HttpChannel for RecordingHttp {
    async fn submit(&self, _sender: &UserId, request: &ClientRequest) -> Result<AckPayload> {
        self.requests.lock().await.push(request.clone());
        Ok(AckPayload::Ok)
    }

    async fn fetch_messages(
        &self,
        _sender: &UserId,
        _conversation: &ConversationId,
    ) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn fetch_unread(&self, _sender: &UserId) -> Result<UnreadSnapshot> {
        Ok(UnreadSnapshot::default())
    }
}

async fn connected(
    socket: Arc<ScriptedSocket>,
    http: Arc<RecordingHttp>,
) -> Arc<Transport> {
    let (transport, _events) = Transport::new(
        UserId::new("alice"),
        socket,
        http,
        fast_tuning(),
    );
    tokio::spawn(Arc::clone(&transport).run());
    let mut state = transport.state();
    while *state.borrow() != ConnectionState::Connected {
        state.changed().await.expect("transport task alive");
    }
    transport
}

fn seen_request() -> ClientRequest {
    ClientRequest::MessageSeen {
        message_ids: vec![MessageId::new("m1")],
    }
}

#[tokio::test(start_paused = true)]
async fn socket_ack_means_no_http_fallback() {
    let http = RecordingHttp::new();
    let transport = connected(ScriptedSocket::new(SinkMode::AckEverything), Arc::clone(&http)).await;

    let ack = transport
        .send(seen_request(), SendOptions::ack(fast_tuning().ack_timeout))
        .await
        .expect("acked over socket");
    assert_eq!(ack, AckPayload::Ok);
    assert!(http.recorded().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn ack_timeout_falls_back_to_http() {
    let http = RecordingHttp::new();
    let transport = connected(ScriptedSocket::new(SinkMode::SwallowFrames), Arc::clone(&http)).await;

    let ack = transport
        .send(seen_request(), SendOptions::ack(fast_tuning().ack_timeout))
        .await
        .expect("confirmed via fallback");
    assert_eq!(ack, AckPayload::Ok);
    assert_eq!(http.recorded().await, vec![seen_request()]);
}

#[tokio::test(start_paused = true)]
async fn socket_error_falls_back_to_http() {
    let http = RecordingHttp::new();
    let transport = connected(ScriptedSocket::new(SinkMode::FailSends), Arc::clone(&http)).await;

    transport
        .send(seen_request(), SendOptions::ack(fast_tuning().ack_timeout))
        .await
        .expect("confirmed via fallback");
    assert_eq!(http.recorded().await, vec![seen_request()]);
}

#[tokio::test(start_paused = true)]
async fn disconnected_sends_go_straight_to_http() {
    let http = RecordingHttp::new();
    let (transport, _events) = Transport::new(
        UserId::new("alice"),
        ScriptedSocket::refusing(),
        http.clone(),
        fast_tuning(),
    );

    transport
        .send(seen_request(), SendOptions::ack(fast_tuning().ack_timeout))
        .await
        .expect("http path");
    assert_eq!(http.recorded().await, vec![seen_request()]);
}

#[tokio::test(start_paused = true)]
async fn fire_and_forget_never_falls_back() {
    // While disconnected the heartbeat is simply skipped.
    let http = RecordingHttp::new();
    let (transport, _events) = Transport::new(
        UserId::new("alice"),
        ScriptedSocket::refusing(),
        http.clone(),
        fast_tuning(),
    );
    let result = transport
        .send(ClientRequest::Heartbeat, SendOptions::fire_and_forget())
        .await;
    assert!(matches!(result, Err(TransportError::NotConnected)));
    assert!(http.recorded().await.is_empty());

    // Connected but unacknowledged: still no fallback, success is local.
    let http = RecordingHttp::new();
    let transport = connected(ScriptedSocket::new(SinkMode::SwallowFrames), Arc::clone(&http)).await;
    let ack = transport
        .send(ClientRequest::Heartbeat, SendOptions::fire_and_forget())
        .await
        .expect("sent without waiting");
    assert_eq!(ack, AckPayload::Ok);
    assert!(http.recorded().await.is_empty());
}
