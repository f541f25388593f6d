use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::{ConversationId, Message, MessageId, UserId},
    protocol::{AckPayload, ClientRequest},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{
    ledger::MessageStore,
    transport::{ConnectionState, SendOptions, Transport},
    unread::UnreadAggregator,
    ClientEvent, ClientTuning, SessionState,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdit {
    pub message_id: MessageId,
    pub text: String,
}

/// Operations attempted but not yet confirmed by the server. Entries leave
/// the queue only on confirmation, so they survive any number of outages.
#[derive(Debug, Default)]
pub struct PendingQueues {
    pub delivered_acks: Vec<MessageId>,
    pub seen_acks: Vec<MessageId>,
    pub edits: Vec<PendingEdit>,
}

impl PendingQueues {
    pub fn queue_delivered(&mut self, ids: impl IntoIterator<Item = MessageId>) {
        for id in ids {
            if !self.delivered_acks.contains(&id) {
                self.delivered_acks.push(id);
            }
        }
    }

    pub fn queue_seen(&mut self, ids: impl IntoIterator<Item = MessageId>) {
        for id in ids {
            if !self.seen_acks.contains(&id) {
                self.seen_acks.push(id);
            }
        }
    }

    /// Later edits to the same message replace the queued one; only the
    /// final text matters.
    pub fn queue_edit(&mut self, edit: PendingEdit) {
        self.edits.retain(|e| e.message_id != edit.message_id);
        self.edits.push(edit);
    }

    pub fn is_empty(&self) -> bool {
        self.delivered_acks.is_empty() && self.seen_acks.is_empty() && self.edits.is_empty()
    }
}

/// Restores consistency after a transport outage: replays unconfirmed status
/// operations and refreshes authoritative state, without a full reload.
pub struct ReconnectManager {
    user_id: UserId,
    transport: Arc<Transport>,
    store: Arc<Mutex<MessageStore>>,
    unread: Arc<Mutex<UnreadAggregator>>,
    queues: Arc<Mutex<PendingQueues>>,
    session: Arc<Mutex<SessionState>>,
    events: broadcast::Sender<ClientEvent>,
    tuning: ClientTuning,
}

impl ReconnectManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        transport: Arc<Transport>,
        store: Arc<Mutex<MessageStore>>,
        unread: Arc<Mutex<UnreadAggregator>>,
        queues: Arc<Mutex<PendingQueues>>,
        session: Arc<Mutex<SessionState>>,
        events: broadcast::Sender<ClientEvent>,
        tuning: ClientTuning,
    ) -> Self {
        Self {
            user_id,
            transport,
            store,
            unread,
            queues,
            session,
            events,
            tuning,
        }
    }

    /// Watches connection transitions and runs the reconcile sequence on
    /// every `connected` edge, the very first connect included.
    pub async fn run(self: Arc<Self>) {
        let mut state = self.transport.state();
        loop {
            if *state.borrow() == ConnectionState::Connected {
                self.on_connected().await;
                if state.changed().await.is_err() {
                    return;
                }
            } else if state.changed().await.is_err() {
                return;
            }
        }
    }

    async fn on_connected(&self) {
        info!("reconnect: connection restored, reconciling");
        if let Err(err) = self.refresh_presence().await {
            warn!("reconnect: presence refresh failed: {err}");
        }
        if let Err(err) = self.drain_pending().await {
            warn!("reconnect: pending drain interrupted, remainder stays queued: {err}");
        }
        if let Err(err) = self.refresh_authoritative().await {
            warn!("reconnect: authoritative refresh failed: {err}");
        }
    }

    async fn refresh_presence(&self) -> Result<()> {
        let ack = self
            .transport
            .send(
                ClientRequest::GetUserStatuses,
                SendOptions::ack(self.tuning.ack_timeout),
            )
            .await?;
        if let AckPayload::Statuses { statuses } = ack {
            self.unread.lock().await.replace_presence(statuses);
            let _ = self.events.send(ClientEvent::PresenceChanged);
        }
        Ok(())
    }

    /// Drains the three pending queues in order. A failure mid-drain stops
    /// immediately; everything unconfirmed is still queued for the next
    /// reconnect (replays are safe: status transitions are idempotent).
    pub async fn drain_pending(&self) -> Result<()> {
        let delivered: Vec<MessageId> = self.queues.lock().await.delivered_acks.clone();
        if !delivered.is_empty() {
            self.transport
                .send(
                    ClientRequest::MessageDelivered {
                        message_ids: delivered.clone(),
                    },
                    SendOptions::ack(self.tuning.ack_timeout),
                )
                .await?;
            self.queues
                .lock()
                .await
                .delivered_acks
                .retain(|id| !delivered.contains(id));
        }

        let seen: Vec<MessageId> = self.queues.lock().await.seen_acks.clone();
        if !seen.is_empty() {
            self.transport
                .send(
                    ClientRequest::MessageSeen {
                        message_ids: seen.clone(),
                    },
                    SendOptions::ack(self.tuning.ack_timeout),
                )
                .await?;
            self.queues
                .lock()
                .await
                .seen_acks
                .retain(|id| !seen.contains(id));
        }

        let edits: Vec<PendingEdit> = self.queues.lock().await.edits.clone();
        for edit in edits {
            let ack = self
                .transport
                .send(
                    ClientRequest::MessageEdited {
                        message_id: edit.message_id.clone(),
                        text: edit.text.clone(),
                    },
                    SendOptions::ack(self.tuning.ack_timeout),
                )
                .await?;
            match ack {
                AckPayload::Message { message } => {
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
                AckPayload::Error(api_error) => {
                    // Permanently rejected (window expired while offline,
                    // say); retrying cannot succeed.
                    let _ = self.events.send(ClientEvent::Error(format!(
                        "queued edit of {} rejected: {}",
                        edit.message_id, api_error.message
                    )));
                }
                other => {
                    warn!("reconnect: unexpected edit ack: {other:?}");
                }
            }
            // Remove exactly the replayed entry. A newer edit to the same
            // message may have been queued while this one was in flight and
            // must survive for the next drain.
            self.queues.lock().await.edits.retain(|e| e != &edit);
        }

        Ok(())
    }

    /// Re-fetches the active conversation and the unread counters; server
    /// data wins over anything held locally for the same ids.
    async fn refresh_authoritative(&self) -> Result<()> {
        let active = self.session.lock().await.active_conversation.clone();
        if let Some(conversation) = active {
            let messages = self
                .transport
                .http()
                .fetch_messages(&self.user_id, &conversation)
                .await?;
            let changed = self.merge_and_acknowledge(&conversation, messages).await;
            if changed {
                let _ = self
                    .events
                    .send(ClientEvent::ConversationUpdated(conversation));
            }
        }

        let snapshot = self.transport.http().fetch_unread(&self.user_id).await?;
        self.unread.lock().await.apply_snapshot(snapshot.clone());
        let _ = self.events.send(ClientEvent::UnreadChanged(snapshot));
        Ok(())
    }

    /// Polling safety net, independent of the socket layer: while the
    /// connection is down, or when the active conversation has gone stale,
    /// re-fetch it over HTTP. One timer exists per client regardless of how
    /// often conversations are switched.
    pub async fn run_poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tuning.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let (active, stale) = {
                let session = self.session.lock().await;
                let stale = session
                    .last_arrival
                    .map(|at| at.elapsed() > self.tuning.staleness_threshold)
                    .unwrap_or(true);
                (session.active_conversation.clone(), stale)
            };
            let Some(conversation) = active else {
                continue;
            };
            if self.transport.is_connected() && !stale {
                continue;
            }
            match self
                .transport
                .http()
                .fetch_messages(&self.user_id, &conversation)
                .await
            {
                Ok(messages) => {
                    let changed = self.merge_and_acknowledge(&conversation, messages).await;
                    if changed {
                        let _ = self
                            .events
                            .send(ClientEvent::ConversationUpdated(conversation));
                    }
                }
                Err(err) => warn!("poll: refresh failed: {err}"),
            }
        }
    }

    /// Merges a fetched history into the store and confirms what the fetch
    /// brought in, exactly as the push path would have: messages from others
    /// that are new to the local log get a delivered confirmation, plus a
    /// seen confirmation while their conversation is the open one. Without
    /// the confirmations a message that arrives by refetch instead of push
    /// would stall on the sender's side. Unconfirmed ids go to the pending
    /// queues like any other failed status send.
    pub async fn merge_and_acknowledge(
        &self,
        conversation: &ConversationId,
        messages: Vec<Message>,
    ) -> bool {
        let fresh: Vec<MessageId> = {
            let store = self.store.lock().await;
            let log = store.log(conversation);
            messages
                .iter()
                .filter(|m| m.sender_id != self.user_id)
                .filter(|m| log.map_or(true, |log| !log.contains(&m.id)))
                .map(|m| m.id.clone())
                .collect()
        };
        let changed = self
            .store
            .lock()
            .await
            .log_mut(conversation)
            .merge_authoritative(messages);
        self.session.lock().await.note_arrival();

        if !fresh.is_empty() {
            if self
                .transport
                .send(
                    ClientRequest::MessageDelivered {
                        message_ids: fresh.clone(),
                    },
                    SendOptions::ack(self.tuning.ack_timeout),
                )
                .await
                .is_err()
            {
                self.queues.lock().await.queue_delivered(fresh.clone());
            }

            let viewing =
                self.session.lock().await.active_conversation.as_ref() == Some(conversation);
            if viewing
                && self
                    .transport
                    .send(
                        ClientRequest::MessageSeen {
                            message_ids: fresh.clone(),
                        },
                        SendOptions::ack(self.tuning.ack_timeout),
                    )
                    .await
                    .is_err()
            {
                self.queues.lock().await.queue_seen(fresh);
            }
        }
        changed
    }
}
