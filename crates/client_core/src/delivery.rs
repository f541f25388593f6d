use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use shared::{
    domain::{ConversationId, MediaRef, MentionSpan, Message, MessageId, MessageStatus, ReplyRef, UserId},
    protocol::{AckPayload, ClientRequest, SendMessagePayload},
};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::{
    ledger::MessageStore,
    transport::{SendOptions, Transport},
    ClientEvent, ClientTuning,
};

/// What the user composed; everything else on the optimistic record is
/// filled in by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub text: Option<String>,
    pub media: Option<MediaRef>,
    pub reply_to: Option<ReplyRef>,
    pub mentions: Vec<MentionSpan>,
}

/// Turns a send intent into a confirmed message: optimistic local insert,
/// transport send with ack-or-fallback, reconcile-or-fail.
pub struct DeliveryPipeline {
    user_id: UserId,
    transport: Arc<Transport>,
    store: Arc<Mutex<MessageStore>>,
    events: broadcast::Sender<ClientEvent>,
    tuning: ClientTuning,
}

impl DeliveryPipeline {
    pub fn new(
        user_id: UserId,
        transport: Arc<Transport>,
        store: Arc<Mutex<MessageStore>>,
        events: broadcast::Sender<ClientEvent>,
        tuning: ClientTuning,
    ) -> Self {
        Self {
            user_id,
            transport,
            store,
            events,
            tuning,
        }
    }

    /// Sends a new message. The optimistic record is visible (status
    /// `sending`) before any network activity; the returned id is the
    /// server-assigned one. On failure the record stays behind as `failed`
    /// with an explicit retry affordance, never silently dropped.
    pub async fn send(
        &self,
        conversation: ConversationId,
        draft: MessageDraft,
    ) -> Result<MessageId> {
        if draft.text.is_none() && draft.media.is_none() {
            return Err(anyhow!("message needs text or media"));
        }

        let temp_id = MessageId::temporary();
        let optimistic = Message {
            id: temp_id.clone(),
            conversation: conversation.clone(),
            sender_id: self.user_id.clone(),
            text: draft.text.clone(),
            media: draft.media.clone(),
            created_at: Utc::now(),
            status: MessageStatus::Sending,
            delivered_at: None,
            seen_at: None,
            edited: false,
            edited_at: None,
            original_text: None,
            deleted: false,
            delete_scope: None,
            deleted_at: None,
            reactions: Vec::new(),
            reply_to: draft.reply_to.clone(),
            mentions: draft.mentions.clone(),
        };

        {
            let mut store = self.store.lock().await;
            store.log_mut(&conversation).insert(optimistic);
        }
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated(conversation.clone()));

        let payload = SendMessagePayload {
            temp_id: temp_id.clone(),
            conversation: conversation.clone(),
            text: draft.text,
            media: draft.media,
            reply_to: draft.reply_to.map(|r| r.message_id),
            mentions: draft.mentions,
        };

        let ack = self
            .transport
            .send(
                ClientRequest::SendMessage(payload),
                SendOptions::ack(self.tuning.ack_timeout),
            )
            .await;

        match ack {
            Ok(AckPayload::Message { message }) => {
                {
                    let mut store = self.store.lock().await;
                    store.log_mut(&conversation).replace_temp(&temp_id, message.clone());
                }
                let _ = self
                    .events
                    .send(ClientEvent::ConversationUpdated(conversation));
                Ok(message.id)
            }
            Ok(AckPayload::Error(api_error)) => {
                self.fail(&conversation, &temp_id).await;
                Err(anyhow!("send rejected: {}", api_error.message))
            }
            Ok(other) => {
                self.fail(&conversation, &temp_id).await;
                Err(anyhow!("unexpected send acknowledgment: {other:?}"))
            }
            Err(err) => {
                warn!(temp_id = %temp_id, "delivery: send failed: {err}");
                self.fail(&conversation, &temp_id).await;
                Err(err.into())
            }
        }
    }

    /// Re-runs the send algorithm for a failed message with a fresh temp id.
    /// The failed record is consumed; its content becomes the new draft.
    pub async fn retry(
        &self,
        conversation: ConversationId,
        failed_id: &MessageId,
    ) -> Result<MessageId> {
        let draft = {
            let mut store = self.store.lock().await;
            let log = store.log_mut(&conversation);
            match log.get(failed_id) {
                Some(message) if message.status == MessageStatus::Failed => {
                    let draft = MessageDraft {
                        text: message.text.clone(),
                        media: message.media.clone(),
                        reply_to: message.reply_to.clone(),
                        mentions: message.mentions.clone(),
                    };
                    log.remove(failed_id);
                    draft
                }
                Some(_) => return Err(anyhow!("message {failed_id} is not in a failed state")),
                None => return Err(anyhow!("message {failed_id} not found")),
            }
        };
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated(conversation.clone()));
        self.send(conversation, draft).await
    }

    async fn fail(&self, conversation: &ConversationId, temp_id: &MessageId) {
        {
            let mut store = self.store.lock().await;
            store.log_mut(conversation).mark_failed(temp_id);
        }
        let _ = self.events.send(ClientEvent::SendFailed {
            conversation: conversation.clone(),
            message_id: temp_id.clone(),
        });
    }
}
