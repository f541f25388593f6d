use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use shared::{
    domain::{
        ConversationId, DeleteScope, GroupId, Message, MessageId, MessageStatus, Presence, UserId,
    },
    protocol::{AckPayload, ClientRequest, ServerEvent, UnreadSnapshot},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::warn;

pub mod delivery;
pub mod ledger;
pub mod reconnect;
pub mod transport;
pub mod unread;

pub use delivery::{DeliveryPipeline, MessageDraft};
pub use ledger::{LedgerError, MessageStore};
pub use reconnect::{PendingEdit, PendingQueues, ReconnectManager};
pub use transport::{
    ConnectionState, HttpApi, HttpChannel, SendOptions, SocketChannel, Transport, WsSocketChannel,
};
pub use unread::{UnreadAggregator, UnreadTotals};

use transport::TransportError;

/// Tunables for the real-time layer. Defaults follow the protocol's
/// recommended intervals; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct ClientTuning {
    /// How long a socket send waits for its ack before the HTTP fallback.
    pub ack_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_cap: Duration,
    /// Rapid backoff attempts before widening to `reconnect_idle`.
    pub reconnect_rapid_attempts: u32,
    pub reconnect_idle: Duration,
    /// Safety-net poll cadence for the open conversation.
    pub poll_interval: Duration,
    /// How old the last confirmed arrival may get before a poll fires even
    /// while connected.
    pub staleness_threshold: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ClientTuning {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(4),
            reconnect_initial: Duration::from_millis(300),
            reconnect_cap: Duration::from_secs(10),
            reconnect_rapid_attempts: 15,
            reconnect_idle: Duration::from_secs(30),
            poll_interval: Duration::from_secs(8),
            staleness_threshold: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(45),
        }
    }
}

/// Which conversation the user is looking at, and how fresh its data is.
#[derive(Debug, Default)]
pub struct SessionState {
    pub active_conversation: Option<ConversationId>,
    pub last_arrival: Option<tokio::time::Instant>,
}

impl SessionState {
    pub fn note_arrival(&mut self) {
        self.last_arrival = Some(tokio::time::Instant::now());
    }
}

/// Events surfaced to the UI layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connection(ConnectionState),
    ConversationUpdated(ConversationId),
    ChatListChanged,
    SendFailed {
        conversation: ConversationId,
        message_id: MessageId,
    },
    UnreadChanged(UnreadSnapshot),
    PresenceChanged,
    Mentioned {
        message_id: MessageId,
        group_id: GroupId,
        sender_name: String,
        group_name: String,
    },
    Error(String),
}

/// The real-time messaging client: owns the transport, the message store,
/// the unread/presence aggregator and the pending-operation queues, and maps
/// server pushes onto them. All mutation funnels through the mutexes here,
/// so concurrent socket callbacks never race on the same conversation.
pub struct ChatClient {
    user_id: UserId,
    transport: Arc<Transport>,
    store: Arc<Mutex<MessageStore>>,
    unread: Arc<Mutex<UnreadAggregator>>,
    queues: Arc<Mutex<PendingQueues>>,
    session: Arc<Mutex<SessionState>>,
    delivery: DeliveryPipeline,
    events: broadcast::Sender<ClientEvent>,
    tuning: ClientTuning,
    push_rx: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(user_id: UserId, server_url: &str, tuning: ClientTuning) -> Result<Arc<Self>> {
        let socket = Arc::new(WsSocketChannel::new(server_url, &user_id)?);
        let http = Arc::new(HttpApi::new(server_url));
        Ok(Self::new_with_dependencies(user_id, socket, http, tuning))
    }

    pub fn new_with_dependencies(
        user_id: UserId,
        socket: Arc<dyn SocketChannel>,
        http: Arc<dyn HttpChannel>,
        tuning: ClientTuning,
    ) -> Arc<Self> {
        let (transport, push_rx) = Transport::new(user_id.clone(), socket, http, tuning);
        let store = Arc::new(Mutex::new(MessageStore::default()));
        let (events, _) = broadcast::channel(1024);
        let delivery = DeliveryPipeline::new(
            user_id.clone(),
            Arc::clone(&transport),
            Arc::clone(&store),
            events.clone(),
            tuning,
        );
        Arc::new(Self {
            user_id,
            transport,
            store,
            unread: Arc::new(Mutex::new(UnreadAggregator::default())),
            queues: Arc::new(Mutex::new(PendingQueues::default())),
            session: Arc::new(Mutex::new(SessionState::default())),
            delivery,
            events,
            tuning,
            push_rx: Mutex::new(Some(push_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.transport.state().borrow()
    }

    /// Starts the background tasks: connection maintenance, push-event pump,
    /// reconnect reconciliation, poll safety net, heartbeat.
    pub async fn connect(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        tasks.push(tokio::spawn(Arc::clone(&self.transport).run()));

        if let Some(mut push_rx) = self.push_rx.lock().await.take() {
            let client = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = push_rx.recv().await {
                    client.handle_server_event(event).await;
                }
            }));
        }

        let reconnect = Arc::new(ReconnectManager::new(
            self.user_id.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
            Arc::clone(&self.unread),
            Arc::clone(&self.queues),
            Arc::clone(&self.session),
            self.events.clone(),
            self.tuning,
        ));
        tasks.push(tokio::spawn(Arc::clone(&reconnect).run()));
        tasks.push(tokio::spawn(reconnect.run_poll_loop()));

        {
            let client = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(client.tuning.heartbeat_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    // Genuinely fire-and-forget; skipped while offline.
                    match client
                        .transport
                        .send(ClientRequest::Heartbeat, SendOptions::fire_and_forget())
                        .await
                    {
                        Ok(_) | Err(TransportError::NotConnected) => {}
                        Err(err) => warn!("heartbeat failed: {err}"),
                    }
                }
            }));
        }

        {
            let client = Arc::clone(self);
            let mut state = self.transport.state();
            tasks.push(tokio::spawn(async move {
                loop {
                    let current = *state.borrow();
                    let _ = client.events.send(ClientEvent::Connection(current));
                    if state.changed().await.is_err() {
                        return;
                    }
                }
            }));
        }
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    // ----- user-facing operations -----

    pub async fn send_message(
        &self,
        conversation: ConversationId,
        draft: MessageDraft,
    ) -> Result<MessageId> {
        self.delivery.send(conversation, draft).await
    }

    pub async fn retry_send(
        &self,
        conversation: ConversationId,
        failed_id: &MessageId,
    ) -> Result<MessageId> {
        self.delivery.retry(conversation, failed_id).await
    }

    /// Edits a message. Window/ownership rules are enforced locally first so
    /// invalid edits fail fast with no partial state; a confirmed-valid edit
    /// that cannot reach the server is queued for the next reconnect.
    pub async fn edit_message(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
        text: impl Into<String>,
    ) -> Result<(), LedgerError> {
        let text = text.into();
        self.store
            .lock()
            .await
            .log_mut(conversation)
            .apply_edit(message_id, &self.user_id, text.clone(), Utc::now())?;
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated(conversation.clone()));

        let ack = self
            .transport
            .send(
                ClientRequest::MessageEdited {
                    message_id: message_id.clone(),
                    text: text.clone(),
                },
                SendOptions::ack(self.tuning.ack_timeout),
            )
            .await;
        match ack {
            Ok(AckPayload::Message { message }) => {
                self.store
                    .lock()
                    .await
                    .log_mut(conversation)
                    .upsert_authoritative(message);
            }
            Ok(AckPayload::Error(api_error)) => {
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("edit rejected: {}", api_error.message)));
            }
            Ok(other) => warn!("unexpected edit ack: {other:?}"),
            Err(err) => {
                warn!("edit not confirmed, queueing for reconnect: {err}");
                self.queues.lock().await.queue_edit(PendingEdit {
                    message_id: message_id.clone(),
                    text,
                });
            }
        }
        Ok(())
    }

    pub async fn delete_message(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
        scope: DeleteScope,
    ) -> Result<(), LedgerError> {
        self.store
            .lock()
            .await
            .log_mut(conversation)
            .apply_delete(message_id, scope, &self.user_id, Utc::now())?;
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated(conversation.clone()));

        let ack = self
            .transport
            .send(
                ClientRequest::MessageDeleted {
                    message_id: message_id.clone(),
                    scope,
                },
                SendOptions::ack(self.tuning.ack_timeout),
            )
            .await;
        if let Err(err) = ack {
            let _ = self
                .events
                .send(ClientEvent::Error(format!("delete not confirmed: {err}")));
        }
        Ok(())
    }

    pub async fn react_to_message(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), LedgerError> {
        self.store
            .lock()
            .await
            .log_mut(conversation)
            .apply_reaction(message_id, &self.user_id, emoji)?;
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated(conversation.clone()));

        let ack = self
            .transport
            .send(
                ClientRequest::ReactToMessage {
                    message_id: message_id.clone(),
                    emoji: emoji.to_string(),
                },
                SendOptions::ack(self.tuning.ack_timeout),
            )
            .await;
        match ack {
            Ok(AckPayload::Reactions {
                message_id,
                reactions,
            }) => {
                self.store
                    .lock()
                    .await
                    .log_mut(conversation)
                    .set_reactions(&message_id, reactions);
                let _ = self
                    .events
                    .send(ClientEvent::ConversationUpdated(conversation.clone()));
            }
            Ok(other) => warn!("unexpected reaction ack: {other:?}"),
            Err(err) => {
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("reaction not confirmed: {err}")));
            }
        }
        Ok(())
    }

    /// Opens (or closes, with `None`) a conversation. Opening resets its
    /// unread counters optimistically, acknowledges everything unseen in it,
    /// and asks the server for the authoritative counter snapshot.
    pub async fn open_conversation(&self, conversation: Option<ConversationId>) {
        {
            let mut session = self.session.lock().await;
            session.active_conversation = conversation.clone();
        }
        let Some(conversation) = conversation else {
            return;
        };

        {
            let mut unread = self.unread.lock().await;
            unread.reset(&conversation);
            let snapshot = unread.snapshot();
            let _ = self.events.send(ClientEvent::UnreadChanged(snapshot));
        }

        let unseen: Vec<MessageId> = {
            let store = self.store.lock().await;
            store
                .log(&conversation)
                .map(|log| {
                    log.iter()
                        .filter(|m| {
                            m.sender_id != self.user_id
                                && m.status != MessageStatus::Seen
                                && !m.id.is_temporary()
                        })
                        .map(|m| m.id.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        if !unseen.is_empty() {
            self.send_seen(unseen).await;
        }

        self.mark_chat_read(&conversation, None).await;
    }

    /// Tells the server the conversation was read; the authoritative snapshot
    /// in the ack replaces local counters wholesale, healing optimistic drift.
    pub async fn mark_chat_read(
        &self,
        conversation: &ConversationId,
        message_id: Option<MessageId>,
    ) {
        let ack = self
            .transport
            .send(
                ClientRequest::MarkChatAsRead {
                    conversation: conversation.clone(),
                    message_id,
                },
                SendOptions::ack(self.tuning.ack_timeout),
            )
            .await;
        match ack {
            Ok(AckPayload::Unread { snapshot }) => {
                self.unread.lock().await.apply_snapshot(snapshot.clone());
                let _ = self.events.send(ClientEvent::UnreadChanged(snapshot));
            }
            Ok(other) => warn!("unexpected mark-read ack: {other:?}"),
            Err(err) => warn!("mark-read not confirmed: {err}"),
        }
    }

    // ----- snapshots for the UI -----

    pub async fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.store
            .lock()
            .await
            .log(conversation)
            .map(|log| log.to_vec())
            .unwrap_or_default()
    }

    pub async fn unread_snapshot(&self) -> UnreadSnapshot {
        self.unread.lock().await.snapshot()
    }

    pub async fn unread_totals(&self) -> UnreadTotals {
        self.unread.lock().await.totals()
    }

    pub async fn presence_of(&self, user: &UserId) -> Option<Presence> {
        self.unread.lock().await.presence(user).cloned()
    }

    // ----- push-event handling -----

    /// Normalizes an incoming message at the boundary: a direct message
    /// addressed to us is filed under the sender, so both sides key the same
    /// conversation and nothing downstream re-derives identities.
    fn normalize_incoming(&self, mut message: Message) -> Message {
        if let ConversationId::Direct(user) = &message.conversation {
            if user == &self.user_id {
                message.conversation = ConversationId::Direct(message.sender_id.clone());
            }
        }
        message
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage { message } => self.handle_new_message(message, false).await,
            ServerEvent::NewChat { message } => self.handle_new_message(message, true).await,
            ServerEvent::MessageStatusUpdate {
                message_ids,
                status,
                timestamp,
            } => {
                let changed = {
                    let mut store = self.store.lock().await;
                    store.apply_status_bulk(&message_ids, status, timestamp)
                };
                if !changed.is_empty() {
                    let conversations: Vec<ConversationId> = {
                        let store = self.store.lock().await;
                        let mut seen = Vec::new();
                        for id in &changed {
                            if let Some((conv, _)) = store.find(id) {
                                if !seen.contains(conv) {
                                    seen.push(conv.clone());
                                }
                            }
                        }
                        seen
                    };
                    for conversation in conversations {
                        let _ = self
                            .events
                            .send(ClientEvent::ConversationUpdated(conversation));
                    }
                }
            }
            ServerEvent::MessageReaction {
                message_id,
                reactions,
            } => {
                let conversation = {
                    let mut store = self.store.lock().await;
                    let conversation = store.find(&message_id).map(|(conv, _)| conv.clone());
                    if let Some(conv) = &conversation {
                        store.log_mut(conv).set_reactions(&message_id, reactions);
                    }
                    conversation
                };
                if let Some(conversation) = conversation {
                    let _ = self
                        .events
                        .send(ClientEvent::ConversationUpdated(conversation));
                }
            }
            ServerEvent::MessageEdited { message } => {
                let message = self.normalize_incoming(message);
                let conversation = message.conversation.clone();
                self.store
                    .lock()
                    .await
                    .log_mut(&conversation)
                    .upsert_authoritative(message);
                let _ = self
                    .events
                    .send(ClientEvent::ConversationUpdated(conversation));
            }
            ServerEvent::MessageDeleted { message_id, scope } => {
                let conversation = {
                    let mut store = self.store.lock().await;
                    let conversation = store.find(&message_id).map(|(conv, _)| conv.clone());
                    if let Some(conv) = &conversation {
                        store
                            .log_mut(conv)
                            .apply_remote_delete(&message_id, scope, Utc::now());
                    }
                    conversation
                };
                if let Some(conversation) = conversation {
                    let _ = self
                        .events
                        .send(ClientEvent::ConversationUpdated(conversation));
                }
            }
            ServerEvent::UserStatusUpdate(update) => {
                self.unread.lock().await.patch_presence(update);
                let _ = self.events.send(ClientEvent::PresenceChanged);
            }
            ServerEvent::UnreadCountUpdate { snapshot } => {
                self.unread.lock().await.apply_snapshot(snapshot.clone());
                let _ = self.events.send(ClientEvent::UnreadChanged(snapshot));
            }
            ServerEvent::UserMentioned {
                message_id,
                group_id,
                sender_name,
                group_name,
            } => {
                let _ = self.events.send(ClientEvent::Mentioned {
                    message_id,
                    group_id,
                    sender_name,
                    group_name,
                });
            }
            ServerEvent::RefreshChats => {
                let _ = self.events.send(ClientEvent::ChatListChanged);
            }
        }
    }

    async fn handle_new_message(&self, message: Message, new_chat: bool) {
        let message = self.normalize_incoming(message);
        let conversation = message.conversation.clone();
        let from_me = message.sender_id == self.user_id;
        let mentioned = message
            .mentions
            .iter()
            .any(|span| span.user_id == self.user_id);
        let message_id = message.id.clone();

        self.store
            .lock()
            .await
            .log_mut(&conversation)
            .upsert_authoritative(message);
        self.session.lock().await.note_arrival();

        if !from_me {
            self.send_delivered(vec![message_id.clone()]).await;

            let active = {
                let session = self.session.lock().await;
                session.active_conversation.as_ref() == Some(&conversation)
            };
            if active {
                self.send_seen(vec![message_id]).await;
            } else {
                let snapshot = {
                    let mut unread = self.unread.lock().await;
                    unread.increment(&conversation, mentioned);
                    unread.snapshot()
                };
                let _ = self.events.send(ClientEvent::UnreadChanged(snapshot));
            }
        }

        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated(conversation));
        if new_chat {
            let _ = self.events.send(ClientEvent::ChatListChanged);
        }
    }

    /// Confirms receipt to the server; queued for reconnect replay when the
    /// confirmation cannot be delivered right now.
    async fn send_delivered(&self, ids: Vec<MessageId>) {
        let result = self
            .transport
            .send(
                ClientRequest::MessageDelivered {
                    message_ids: ids.clone(),
                },
                SendOptions::ack(self.tuning.ack_timeout),
            )
            .await;
        if result.is_err() {
            self.queues.lock().await.queue_delivered(ids);
        }
    }

    async fn send_seen(&self, ids: Vec<MessageId>) {
        let result = self
            .transport
            .send(
                ClientRequest::MessageSeen {
                    message_ids: ids.clone(),
                },
                SendOptions::ack(self.tuning.ack_timeout),
            )
            .await;
        if result.is_err() {
            self.queues.lock().await.queue_seen(ids);
        }
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod client_tests;

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod transport_tests;
