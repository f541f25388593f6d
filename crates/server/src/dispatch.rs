use chrono::Utc;
use shared::{
    domain::{
        ConversationId, DeleteScope, Message, MessageId, MessageStatus, Reaction, ReplyRef, UserId,
    },
    error::{ApiException, ErrorCode},
    protocol::{AckPayload, ClientRequest, SendMessagePayload, ServerEvent},
};
use storage::Storage;
use uuid::Uuid;

/// Editing is allowed for this long after a message was created.
pub const EDIT_WINDOW_SECS: i64 = 15 * 60;
/// Delete-for-everyone is allowed for this long after creation.
pub const DELETE_EVERYONE_WINDOW_SECS: i64 = 24 * 60 * 60;

/// What one request produced: the ack for the requester and the push events
/// owed to other users. The connection layer decides how each push travels.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub ack: AckPayload,
    pub pushes: Vec<(UserId, ServerEvent)>,
}

impl DispatchOutcome {
    fn ack_only(ack: AckPayload) -> Self {
        Self {
            ack,
            pushes: Vec::new(),
        }
    }
}

fn internal(err: impl std::fmt::Display) -> ApiException {
    ApiException::new(ErrorCode::Internal, err.to_string())
}

/// Applies one client request against storage. The same entry point backs the
/// socket frames and the HTTP fallback, so both channels stay semantically
/// identical.
pub async fn dispatch(
    storage: &Storage,
    sender: &UserId,
    request: ClientRequest,
) -> Result<DispatchOutcome, ApiException> {
    match request {
        ClientRequest::SendMessage(payload) => send_message(storage, sender, payload).await,
        ClientRequest::MessageDelivered { message_ids } => {
            advance_status(storage, sender, &message_ids, MessageStatus::Delivered).await
        }
        ClientRequest::MessageSeen { message_ids } => {
            advance_status(storage, sender, &message_ids, MessageStatus::Seen).await
        }
        ClientRequest::MessageEdited { message_id, text } => {
            edit_message(storage, sender, &message_id, text).await
        }
        ClientRequest::MessageDeleted { message_id, scope } => {
            delete_message(storage, sender, &message_id, scope).await
        }
        ClientRequest::ReactToMessage { message_id, emoji } => {
            react_to_message(storage, sender, &message_id, &emoji).await
        }
        ClientRequest::MarkChatAsRead {
            conversation,
            message_id,
        } => mark_chat_read(storage, sender, &conversation, message_id).await,
        ClientRequest::Heartbeat => {
            // Keeps the reporter's presence row fresh; last_seen is preserved
            // by the upsert.
            storage
                .set_presence(sender, true, None)
                .await
                .map_err(internal)?;
            Ok(DispatchOutcome::ack_only(AckPayload::Ok))
        }
        ClientRequest::GetUserStatuses => {
            let statuses = storage.presence_snapshot().await.map_err(internal)?;
            Ok(DispatchOutcome::ack_only(AckPayload::Statuses { statuses }))
        }
        ClientRequest::GetOnlineUsers => {
            let statuses = storage
                .presence_snapshot()
                .await
                .map_err(internal)?
                .into_iter()
                .filter(|entry| entry.presence.is_online)
                .collect();
            Ok(DispatchOutcome::ack_only(AckPayload::Statuses { statuses }))
        }
    }
}

/// The other users who can see a message.
async fn counterparties(
    storage: &Storage,
    message: &Message,
    exclude: &UserId,
) -> Result<Vec<UserId>, ApiException> {
    let mut users = match &message.conversation {
        ConversationId::Direct(peer) => vec![message.sender_id.clone(), peer.clone()],
        ConversationId::Group(group) => storage
            .group_members(group)
            .await
            .map_err(internal)?
            .into_iter()
            .map(|member| member.user_id)
            .collect(),
    };
    users.retain(|user| user != exclude);
    users.dedup();
    Ok(users)
}

async fn send_message(
    storage: &Storage,
    sender: &UserId,
    payload: SendMessagePayload,
) -> Result<DispatchOutcome, ApiException> {
    let has_text = payload
        .text
        .as_deref()
        .is_some_and(|text| !text.trim().is_empty());
    if !has_text && payload.media.is_none() {
        return Err(ApiException::new(
            ErrorCode::Validation,
            "message needs text or media",
        ));
    }

    let recipients = match &payload.conversation {
        ConversationId::Direct(peer) => vec![peer.clone()],
        ConversationId::Group(group) => {
            if !storage
                .is_group_member(group, sender)
                .await
                .map_err(internal)?
            {
                return Err(ApiException::new(
                    ErrorCode::Forbidden,
                    "not a member of this group",
                ));
            }
            storage
                .group_members(group)
                .await
                .map_err(internal)?
                .into_iter()
                .map(|member| member.user_id)
                .filter(|user| user != sender)
                .collect()
        }
    };

    let reply_to = match payload.reply_to {
        Some(quoted_id) => storage
            .get_message(&quoted_id)
            .await
            .map_err(internal)?
            .map(|quoted| {
                let preview = quoted.preview_text();
                ReplyRef {
                    message_id: quoted.id,
                    preview,
                }
            }),
        None => None,
    };

    // A first message between two users opens the conversation on the
    // recipient's side.
    let first_contact = match &payload.conversation {
        ConversationId::Direct(_) => storage
            .list_messages(sender, &payload.conversation)
            .await
            .map_err(internal)?
            .is_empty(),
        ConversationId::Group(_) => false,
    };

    let message = Message {
        id: MessageId::new(Uuid::new_v4().to_string()),
        conversation: payload.conversation.clone(),
        sender_id: sender.clone(),
        text: payload.text,
        media: payload.media,
        created_at: Utc::now(),
        status: MessageStatus::Sent,
        delivered_at: None,
        seen_at: None,
        edited: false,
        edited_at: None,
        original_text: None,
        deleted: false,
        delete_scope: None,
        deleted_at: None,
        reactions: Vec::new(),
        reply_to,
        mentions: payload.mentions,
    };
    storage.insert_message(&message).await.map_err(internal)?;

    // Counters are keyed from the recipient's perspective: a direct message
    // lands under the sender's id.
    let counter_conversation = match &message.conversation {
        ConversationId::Direct(_) => ConversationId::Direct(sender.clone()),
        ConversationId::Group(group) => ConversationId::Group(group.clone()),
    };

    let sender_name = storage
        .display_name(sender)
        .await
        .map_err(internal)?
        .unwrap_or_else(|| sender.to_string());

    let mut pushes = Vec::new();
    for recipient in &recipients {
        let mentioned = message
            .mentions
            .iter()
            .any(|span| &span.user_id == recipient);
        storage
            .bump_unread(recipient, &counter_conversation, mentioned)
            .await
            .map_err(internal)?;

        let event = if first_contact {
            ServerEvent::NewChat {
                message: message.clone(),
            }
        } else {
            ServerEvent::NewMessage {
                message: message.clone(),
            }
        };
        pushes.push((recipient.clone(), event));

        let snapshot = storage
            .unread_snapshot(recipient)
            .await
            .map_err(internal)?;
        pushes.push((
            recipient.clone(),
            ServerEvent::UnreadCountUpdate { snapshot },
        ));

        if mentioned {
            if let ConversationId::Group(group) = &message.conversation {
                let group_name = storage
                    .group_name(group)
                    .await
                    .map_err(internal)?
                    .unwrap_or_else(|| group.to_string());
                pushes.push((
                    recipient.clone(),
                    ServerEvent::UserMentioned {
                        message_id: message.id.clone(),
                        group_id: group.clone(),
                        sender_name: sender_name.clone(),
                        group_name,
                    },
                ));
            }
        }
    }

    Ok(DispatchOutcome {
        ack: AckPayload::Message { message },
        pushes,
    })
}

/// Delivered/seen confirmations. Idempotent: already-advanced messages match
/// nothing, and only real changes produce pushes back to their senders. Each
/// confirmation is recorded per reporter; a group message only advances once
/// every other member has reported.
async fn advance_status(
    storage: &Storage,
    reporter: &UserId,
    message_ids: &[MessageId],
    status: MessageStatus,
) -> Result<DispatchOutcome, ApiException> {
    let timestamp = Utc::now();
    let affected = storage
        .advance_status(reporter, message_ids, status, timestamp)
        .await
        .map_err(internal)?;

    // The aggregate a message landed on can trail the reported status (a
    // group seen receipt may only complete delivery), so pushes group by
    // sender and resulting status.
    let mut grouped: Vec<(UserId, MessageStatus, Vec<MessageId>)> = Vec::new();
    for (message_id, message_sender, new_status) in affected {
        match grouped
            .iter_mut()
            .find(|(user, existing, _)| *user == message_sender && *existing == new_status)
        {
            Some((_, _, ids)) => ids.push(message_id),
            None => grouped.push((message_sender, new_status, vec![message_id])),
        }
    }

    let pushes = grouped
        .into_iter()
        .map(|(user, status, message_ids)| {
            (
                user,
                ServerEvent::MessageStatusUpdate {
                    message_ids,
                    status,
                    timestamp,
                },
            )
        })
        .collect();

    Ok(DispatchOutcome {
        ack: AckPayload::Ok,
        pushes,
    })
}

async fn edit_message(
    storage: &Storage,
    sender: &UserId,
    message_id: &MessageId,
    text: String,
) -> Result<DispatchOutcome, ApiException> {
    let mut message = storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiException::new(ErrorCode::NotFound, "message not found"))?;

    if message.deleted {
        return Err(ApiException::new(
            ErrorCode::Validation,
            "message was deleted",
        ));
    }
    if &message.sender_id != sender {
        return Err(ApiException::new(
            ErrorCode::Forbidden,
            "only the sender may edit a message",
        ));
    }
    let now = Utc::now();
    if (now - message.created_at).num_seconds() > EDIT_WINDOW_SECS {
        return Err(ApiException::new(
            ErrorCode::Validation,
            "messages can only be edited within 15 minutes of sending",
        ));
    }

    if !message.edited {
        message.original_text = message.text.clone();
    }
    message.text = Some(text);
    message.edited = true;
    message.edited_at = Some(now);
    storage.update_message(&message).await.map_err(internal)?;

    let pushes = counterparties(storage, &message, sender)
        .await?
        .into_iter()
        .map(|user| {
            (
                user,
                ServerEvent::MessageEdited {
                    message: message.clone(),
                },
            )
        })
        .collect();

    Ok(DispatchOutcome {
        ack: AckPayload::Message { message },
        pushes,
    })
}

async fn delete_message(
    storage: &Storage,
    sender: &UserId,
    message_id: &MessageId,
    scope: DeleteScope,
) -> Result<DispatchOutcome, ApiException> {
    // Delete-for-me only affects the requester's view; the shared record
    // stays intact.
    if scope == DeleteScope::Me {
        return Ok(DispatchOutcome::ack_only(AckPayload::Ok));
    }

    let mut message = storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiException::new(ErrorCode::NotFound, "message not found"))?;

    if message.deleted {
        return Err(ApiException::new(
            ErrorCode::Validation,
            "message was already deleted",
        ));
    }
    if &message.sender_id != sender {
        return Err(ApiException::new(
            ErrorCode::Forbidden,
            "only the sender may delete for everyone",
        ));
    }
    let now = Utc::now();
    if (now - message.created_at).num_seconds() > DELETE_EVERYONE_WINDOW_SECS {
        return Err(ApiException::new(
            ErrorCode::Validation,
            "messages can only be deleted for everyone within 24 hours of sending",
        ));
    }

    message.text = None;
    message.media = None;
    message.original_text = None;
    message.deleted = true;
    message.delete_scope = Some(scope);
    message.deleted_at = Some(now);
    storage.update_message(&message).await.map_err(internal)?;

    let pushes = counterparties(storage, &message, sender)
        .await?
        .into_iter()
        .map(|user| {
            (
                user,
                ServerEvent::MessageDeleted {
                    message_id: message.id.clone(),
                    scope,
                },
            )
        })
        .collect();

    Ok(DispatchOutcome {
        ack: AckPayload::Ok,
        pushes,
    })
}

async fn react_to_message(
    storage: &Storage,
    sender: &UserId,
    message_id: &MessageId,
    emoji: &str,
) -> Result<DispatchOutcome, ApiException> {
    let mut message = storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiException::new(ErrorCode::NotFound, "message not found"))?;

    if message.deleted {
        return Err(ApiException::new(
            ErrorCode::Validation,
            "cannot react to a deleted message",
        ));
    }

    // One reaction per user; repeating the same emoji removes it.
    let existing = message
        .reactions
        .iter()
        .position(|reaction| &reaction.user_id == sender);
    match existing {
        Some(index) if message.reactions[index].emoji == emoji => {
            message.reactions.remove(index);
        }
        Some(index) => {
            message.reactions.remove(index);
            message.reactions.push(Reaction {
                user_id: sender.clone(),
                emoji: emoji.to_string(),
            });
        }
        None => message.reactions.push(Reaction {
            user_id: sender.clone(),
            emoji: emoji.to_string(),
        }),
    }
    storage
        .set_reactions(&message.id, &message.reactions)
        .await
        .map_err(internal)?;

    let pushes = counterparties(storage, &message, sender)
        .await?
        .into_iter()
        .map(|user| {
            (
                user,
                ServerEvent::MessageReaction {
                    message_id: message.id.clone(),
                    reactions: message.reactions.clone(),
                },
            )
        })
        .collect();

    Ok(DispatchOutcome {
        ack: AckPayload::Reactions {
            message_id: message.id,
            reactions: message.reactions,
        },
        pushes,
    })
}

async fn mark_chat_read(
    storage: &Storage,
    sender: &UserId,
    conversation: &ConversationId,
    message_id: Option<MessageId>,
) -> Result<DispatchOutcome, ApiException> {
    let mut outcome = match message_id {
        Some(id) => advance_status(storage, sender, &[id], MessageStatus::Seen).await?,
        None => DispatchOutcome::ack_only(AckPayload::Ok),
    };

    storage
        .reset_unread(sender, conversation)
        .await
        .map_err(internal)?;
    let snapshot = storage.unread_snapshot(sender).await.map_err(internal)?;
    outcome.ack = AckPayload::Unread { snapshot };
    Ok(outcome)
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
