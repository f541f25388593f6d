use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{
    ConversationId, DeleteScope, Message, MessageId, MessageStatus, Reaction, UserId,
};
use thiserror::Error;

/// Editing is allowed for this long after a message was created.
pub const EDIT_WINDOW_SECS: i64 = 15 * 60;
/// Delete-for-everyone is allowed for this long after creation.
pub const DELETE_EVERYONE_WINDOW_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("message {0} not found")]
    UnknownMessage(MessageId),
    #[error("only the original sender may do this")]
    NotSender,
    #[error("message was deleted")]
    MessageDeleted,
    #[error("messages can only be edited within 15 minutes of sending")]
    EditWindowExpired,
    #[error("messages can only be deleted for everyone within 24 hours of sending")]
    DeleteWindowExpired,
}

/// Per-conversation message history: an id-indexed map plus a separately
/// maintained creation-time order, so lookups and in-place updates never scan
/// the whole sequence.
#[derive(Debug, Default)]
pub struct ConversationLog {
    messages: HashMap<MessageId, Message>,
    order: Vec<MessageId>,
}

impl ConversationLog {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    /// Messages in creation-time order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.order.iter().filter_map(|id| self.messages.get(id))
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    /// Inserts a new message at its timestamp position. Returns false if the
    /// id is already present.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.messages.contains_key(&message.id) {
            return false;
        }
        let position = self
            .order
            .partition_point(|id| match self.messages.get(id) {
                Some(existing) => {
                    (existing.created_at, &existing.id) <= (message.created_at, &message.id)
                }
                None => true,
            });
        self.order.insert(position, message.id.clone());
        self.messages.insert(message.id.clone(), message);
        true
    }

    /// Replaces any existing record with the same id wholesale; server data
    /// wins over locally-held optimistic state. Inserts when the id is new.
    /// Delete-for-me markers survive the merge: they never reach the server,
    /// so its copy cannot be trusted about them.
    pub fn upsert_authoritative(&mut self, mut message: Message) -> bool {
        match self.messages.get(&message.id) {
            Some(existing)
                if existing.delete_scope == Some(DeleteScope::Me) && !message.deleted =>
            {
                message.deleted = true;
                message.delete_scope = existing.delete_scope;
                message.deleted_at = existing.deleted_at;
                if *existing == message {
                    return false;
                }
                self.messages.insert(message.id.clone(), message);
                self.resort();
                true
            }
            Some(existing) if *existing == message => false,
            Some(_) => {
                self.messages.insert(message.id.clone(), message);
                self.resort();
                true
            }
            None => self.insert(message),
        }
    }

    /// Reconciles an optimistic entry with the authoritative record returned
    /// by the server: removes the temp entry, inserts the authoritative one,
    /// and re-sorts the full sequence to absorb any concurrent arrivals.
    pub fn replace_temp(&mut self, temp_id: &MessageId, authoritative: Message) -> bool {
        if self.messages.remove(temp_id).is_none() {
            // Retried or already reconciled; still accept the server record.
            self.upsert_authoritative(authoritative);
            return false;
        }
        self.order.retain(|id| id != temp_id);
        self.messages
            .insert(authoritative.id.clone(), authoritative.clone());
        self.order.push(authoritative.id);
        self.resort();
        true
    }

    /// Removes a message entirely. Used when a failed optimistic record is
    /// consumed by a retry; server history is only ever soft-deleted.
    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let removed = self.messages.remove(id);
        if removed.is_some() {
            self.order.retain(|entry| entry != id);
        }
        removed
    }

    /// Marks a message deleted on behalf of a server push. Authorization and
    /// window checks already happened server-side.
    pub fn apply_remote_delete(
        &mut self,
        id: &MessageId,
        scope: DeleteScope,
        deleted_at: DateTime<Utc>,
    ) -> bool {
        let Some(message) = self.messages.get_mut(id) else {
            return false;
        };
        if scope == DeleteScope::Everyone {
            message.text = None;
            message.media = None;
            message.original_text = None;
        }
        message.deleted = true;
        message.delete_scope = Some(scope);
        message.deleted_at = Some(deleted_at);
        true
    }

    /// Explicit full re-sort by creation timestamp (ties break on id).
    pub fn resort(&mut self) {
        let messages = &self.messages;
        self.order.sort_by(|a, b| {
            let ka = messages.get(a).map(|m| (m.created_at, &m.id));
            let kb = messages.get(b).map(|m| (m.created_at, &m.id));
            ka.cmp(&kb)
        });
    }

    /// Merges a server-fetched message list: authoritative records replace
    /// local ones with the same id, local-only entries (in-flight optimistic
    /// sends, failed drafts) are kept.
    pub fn merge_authoritative(&mut self, messages: Vec<Message>) -> bool {
        let mut changed = false;
        for message in messages {
            changed |= self.upsert_authoritative(message);
        }
        changed
    }

    /// Advances a message's lifecycle status. No-op unless the new status is
    /// strictly later on the ladder; replays and out-of-order downgrades are
    /// absorbed without touching timestamps. Returns whether anything changed.
    pub fn apply_status(
        &mut self,
        id: &MessageId,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let Some(message) = self.messages.get_mut(id) else {
            return false;
        };
        if !status.advances(message.status) {
            return false;
        }
        message.status = status;
        match status {
            MessageStatus::Delivered => message.delivered_at = Some(timestamp),
            MessageStatus::Seen => {
                message.seen_at = Some(timestamp);
                // Jumping straight from sent to seen is legal; keep
                // delivered_at <= seen_at for consumers that read both.
                if message.delivered_at.is_none() {
                    message.delivered_at = Some(timestamp);
                }
            }
            _ => {}
        }
        true
    }

    /// Marks an optimistic send as failed. Terminal and user-facing; retry
    /// creates a fresh attempt with a new temp id.
    pub fn mark_failed(&mut self, id: &MessageId) -> bool {
        match self.messages.get_mut(id) {
            Some(message) if message.status == MessageStatus::Sending => {
                message.status = MessageStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// Sets or toggles `user_id`'s reaction. A user holds at most one
    /// reaction per message; repeating the same emoji removes it.
    pub fn apply_reaction(
        &mut self,
        id: &MessageId,
        user_id: &UserId,
        emoji: &str,
    ) -> Result<Vec<Reaction>, LedgerError> {
        let message = self
            .messages
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownMessage(id.clone()))?;
        let existing = message
            .reactions
            .iter()
            .position(|r| &r.user_id == user_id);
        match existing {
            Some(index) if message.reactions[index].emoji == emoji => {
                message.reactions.remove(index);
            }
            Some(index) => {
                message.reactions.remove(index);
                message.reactions.push(Reaction {
                    user_id: user_id.clone(),
                    emoji: emoji.to_string(),
                });
            }
            None => message.reactions.push(Reaction {
                user_id: user_id.clone(),
                emoji: emoji.to_string(),
            }),
        }
        Ok(message.reactions.clone())
    }

    /// Replaces the reaction list with the server's authoritative copy.
    pub fn set_reactions(&mut self, id: &MessageId, reactions: Vec<Reaction>) -> bool {
        match self.messages.get_mut(id) {
            Some(message) => {
                message.reactions = reactions;
                true
            }
            None => false,
        }
    }

    /// Edits a message's text. Rejected for deleted messages, non-senders,
    /// and anything older than the edit window. The pre-edit text is captured
    /// in `original_text` on the first edit only.
    pub fn apply_edit(
        &mut self,
        id: &MessageId,
        actor: &UserId,
        text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let message = self
            .messages
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownMessage(id.clone()))?;
        if message.deleted {
            return Err(LedgerError::MessageDeleted);
        }
        if &message.sender_id != actor {
            return Err(LedgerError::NotSender);
        }
        if (now - message.created_at).num_seconds() > EDIT_WINDOW_SECS {
            return Err(LedgerError::EditWindowExpired);
        }
        if !message.edited {
            message.original_text = message.text.clone();
        }
        message.text = Some(text.into());
        message.edited = true;
        message.edited_at = Some(now);
        Ok(())
    }

    /// Soft-deletes a message. `Everyone` is limited to the original sender
    /// within the delete window and erases the content, leaving a tombstone;
    /// `Me` is always available and local-only.
    pub fn apply_delete(
        &mut self,
        id: &MessageId,
        scope: DeleteScope,
        actor: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let message = self
            .messages
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownMessage(id.clone()))?;
        if message.deleted {
            return Err(LedgerError::MessageDeleted);
        }
        if scope == DeleteScope::Everyone {
            if &message.sender_id != actor {
                return Err(LedgerError::NotSender);
            }
            if (now - message.created_at).num_seconds() > DELETE_EVERYONE_WINDOW_SECS {
                return Err(LedgerError::DeleteWindowExpired);
            }
            message.text = None;
            message.media = None;
            message.original_text = None;
        }
        message.deleted = true;
        message.delete_scope = Some(scope);
        message.deleted_at = Some(now);
        Ok(())
    }
}

/// All conversation logs, keyed by conversation. Single source of truth for
/// message lifecycle state; every mutation goes through `ConversationLog`.
#[derive(Debug, Default)]
pub struct MessageStore {
    logs: HashMap<ConversationId, ConversationLog>,
}

impl MessageStore {
    pub fn log(&self, conversation: &ConversationId) -> Option<&ConversationLog> {
        self.logs.get(conversation)
    }

    pub fn log_mut(&mut self, conversation: &ConversationId) -> &mut ConversationLog {
        self.logs.entry(conversation.clone()).or_default()
    }

    pub fn conversations(&self) -> impl Iterator<Item = &ConversationId> {
        self.logs.keys()
    }

    /// Locates a message by id without knowing its conversation. Status
    /// pushes carry only message ids.
    pub fn find(&self, id: &MessageId) -> Option<(&ConversationId, &Message)> {
        self.logs
            .iter()
            .find_map(|(conv, log)| log.get(id).map(|m| (conv, m)))
    }

    /// Applies a status upgrade to every listed message, wherever it lives.
    /// Returns the ids that actually changed.
    pub fn apply_status_bulk(
        &mut self,
        ids: &[MessageId],
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    ) -> Vec<MessageId> {
        let mut changed = Vec::new();
        for id in ids {
            for log in self.logs.values_mut() {
                if log.contains(id) {
                    if log.apply_status(id, status, timestamp) {
                        changed.push(id.clone());
                    }
                    break;
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use shared::domain::{MediaKind, MediaRef};

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn message(id: &str, sender: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(id),
            conversation: ConversationId::Direct(user("peer")),
            sender_id: user(sender),
            text: Some(format!("text-{id}")),
            media: None,
            created_at: at,
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
            reply_to: None,
            mentions: Vec::new(),
        }
    }

    fn t0() -> DateTime<Utc> {
        "2024-06-01T12:00:00Z".parse().expect("timestamp")
    }

    #[test]
    fn status_never_regresses() {
        let mut log = ConversationLog::default();
        log.insert(message("m1", "alice", t0()));
        let id = MessageId::new("m1");

        assert!(log.apply_status(&id, MessageStatus::Seen, t0() + Duration::seconds(5)));
        assert!(!log.apply_status(&id, MessageStatus::Delivered, t0() + Duration::seconds(9)));
        assert_eq!(log.get(&id).expect("m1").status, MessageStatus::Seen);
    }

    #[test]
    fn status_replay_is_a_noop_and_keeps_timestamps() {
        let mut log = ConversationLog::default();
        log.insert(message("m1", "alice", t0()));
        let id = MessageId::new("m1");
        let first = t0() + Duration::seconds(1);

        assert!(log.apply_status(&id, MessageStatus::Delivered, first));
        assert!(!log.apply_status(&id, MessageStatus::Delivered, first + Duration::seconds(30)));
        assert_eq!(log.get(&id).expect("m1").delivered_at, Some(first));
    }

    #[test]
    fn seen_may_skip_delivered_and_backfills_delivered_at() {
        let mut log = ConversationLog::default();
        log.insert(message("m1", "alice", t0()));
        let id = MessageId::new("m1");
        let seen_at = t0() + Duration::seconds(3);

        assert!(log.apply_status(&id, MessageStatus::Seen, seen_at));
        let m = log.get(&id).expect("m1");
        assert_eq!(m.status, MessageStatus::Seen);
        assert_eq!(m.seen_at, Some(seen_at));
        assert_eq!(m.delivered_at, Some(seen_at));
    }

    #[test]
    fn at_most_one_reaction_per_user() {
        let mut log = ConversationLog::default();
        log.insert(message("m1", "alice", t0()));
        let id = MessageId::new("m1");

        log.apply_reaction(&id, &user("bob"), "👍").expect("react");
        log.apply_reaction(&id, &user("bob"), "❤️").expect("react");
        let reactions = &log.get(&id).expect("m1").reactions;
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].emoji, "❤️");
    }

    #[test]
    fn repeating_the_same_emoji_toggles_it_off() {
        let mut log = ConversationLog::default();
        log.insert(message("m1", "alice", t0()));
        let id = MessageId::new("m1");

        log.apply_reaction(&id, &user("bob"), "👍").expect("react");
        let reactions = log.apply_reaction(&id, &user("bob"), "👍").expect("react");
        assert!(reactions.is_empty());
    }

    #[test]
    fn edit_window_boundary() {
        let mut log = ConversationLog::default();
        log.insert(message("m1", "alice", t0()));
        let id = MessageId::new("m1");

        assert!(log
            .apply_edit(&id, &user("alice"), "early", t0() + Duration::minutes(14))
            .is_ok());
        assert_eq!(
            log.apply_edit(&id, &user("alice"), "late", t0() + Duration::minutes(16)),
            Err(LedgerError::EditWindowExpired)
        );
    }

    #[test]
    fn first_edit_preserves_original_text_permanently() {
        let mut log = ConversationLog::default();
        let mut m = message("m1", "alice", t0());
        m.text = Some("foo".into());
        log.insert(m);
        let id = MessageId::new("m1");

        log.apply_edit(&id, &user("alice"), "bar", t0() + Duration::minutes(5))
            .expect("first edit");
        log.apply_edit(&id, &user("alice"), "baz", t0() + Duration::minutes(6))
            .expect("second edit");
        let m = log.get(&id).expect("m1");
        assert_eq!(m.text.as_deref(), Some("baz"));
        assert_eq!(m.original_text.as_deref(), Some("foo"));
    }

    #[test]
    fn edit_rejected_for_non_sender_and_deleted() {
        let mut log = ConversationLog::default();
        log.insert(message("m1", "alice", t0()));
        let id = MessageId::new("m1");

        assert_eq!(
            log.apply_edit(&id, &user("bob"), "hijack", t0() + Duration::minutes(1)),
            Err(LedgerError::NotSender)
        );
        log.apply_delete(&id, DeleteScope::Me, &user("alice"), t0() + Duration::minutes(1))
            .expect("delete");
        assert_eq!(
            log.apply_edit(&id, &user("alice"), "zombie", t0() + Duration::minutes(2)),
            Err(LedgerError::MessageDeleted)
        );
    }

    #[test]
    fn delete_for_everyone_window_boundary() {
        let mut log = ConversationLog::default();
        log.insert(message("m1", "alice", t0()));
        log.insert(message("m2", "alice", t0()));

        assert!(log
            .apply_delete(
                &MessageId::new("m1"),
                DeleteScope::Everyone,
                &user("alice"),
                t0() + Duration::hours(23) + Duration::minutes(59),
            )
            .is_ok());
        assert_eq!(
            log.apply_delete(
                &MessageId::new("m2"),
                DeleteScope::Everyone,
                &user("alice"),
                t0() + Duration::hours(24) + Duration::minutes(1),
            ),
            Err(LedgerError::DeleteWindowExpired)
        );
        // "me" scope is still available after the window.
        assert!(log
            .apply_delete(
                &MessageId::new("m2"),
                DeleteScope::Me,
                &user("alice"),
                t0() + Duration::hours(25),
            )
            .is_ok());
    }

    #[test]
    fn delete_for_everyone_erases_content_but_keeps_tombstone() {
        let mut log = ConversationLog::default();
        let mut m = message("m1", "alice", t0());
        m.media = Some(MediaRef {
            url: "https://cdn.example/pic.png".into(),
            kind: MediaKind::Image,
        });
        log.insert(m);
        let id = MessageId::new("m1");

        log.apply_delete(&id, DeleteScope::Everyone, &user("alice"), t0())
            .expect("delete");
        let m = log.get(&id).expect("tombstone remains");
        assert!(m.deleted);
        assert_eq!(m.delete_scope, Some(DeleteScope::Everyone));
        assert!(m.text.is_none());
        assert!(m.media.is_none());
    }

    #[test]
    fn delete_for_everyone_rejected_for_non_sender() {
        let mut log = ConversationLog::default();
        log.insert(message("m1", "alice", t0()));
        assert_eq!(
            log.apply_delete(
                &MessageId::new("m1"),
                DeleteScope::Everyone,
                &user("bob"),
                t0()
            ),
            Err(LedgerError::NotSender)
        );
    }

    #[test]
    fn replace_temp_resorts_around_concurrent_arrivals() {
        let mut log = ConversationLog::default();
        // Optimistic send at t+10, then a remote message with an earlier
        // timestamp lands while the ack is in flight.
        let temp_id = MessageId::new("tmp-abc");
        let mut optimistic = message("tmp-abc", "me", t0() + Duration::seconds(10));
        optimistic.status = MessageStatus::Sending;
        log.insert(optimistic);
        log.insert(message("remote", "peer", t0() + Duration::seconds(12)));

        let mut authoritative = message("srv-1", "me", t0() + Duration::seconds(10));
        authoritative.status = MessageStatus::Sent;
        log.replace_temp(&temp_id, authoritative);

        let order: Vec<_> = log.iter().map(|m| m.id.as_str().to_string()).collect();
        assert_eq!(order, vec!["srv-1", "remote"]);
        assert!(!log.contains(&temp_id));
        let created: Vec<_> = log.iter().map(|m| m.created_at).collect();
        assert!(created.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn merge_keeps_local_optimistic_entries() {
        let mut log = ConversationLog::default();
        let mut pending = message("tmp-1", "me", t0() + Duration::seconds(30));
        pending.status = MessageStatus::Sending;
        log.insert(pending);

        log.merge_authoritative(vec![
            message("srv-1", "peer", t0()),
            message("srv-2", "peer", t0() + Duration::seconds(5)),
        ]);

        let order: Vec<_> = log.iter().map(|m| m.id.as_str().to_string()).collect();
        assert_eq!(order, vec!["srv-1", "srv-2", "tmp-1"]);
    }

    #[test]
    fn merge_does_not_resurrect_a_me_deleted_message() {
        let mut log = ConversationLog::default();
        log.insert(message("m1", "peer", t0()));
        let id = MessageId::new("m1");
        log.apply_delete(&id, DeleteScope::Me, &user("me"), t0() + Duration::minutes(1))
            .expect("delete");

        // The server never learned about the local delete, so its copy still
        // looks live.
        log.merge_authoritative(vec![message("m1", "peer", t0())]);

        let m = log.get(&id).expect("m1");
        assert!(m.deleted);
        assert_eq!(m.delete_scope, Some(DeleteScope::Me));
        assert_eq!(m.deleted_at, Some(t0() + Duration::minutes(1)));
    }

    #[test]
    fn bulk_status_reports_only_real_changes() {
        let mut store = MessageStore::default();
        let conv = ConversationId::Direct(user("peer"));
        store.log_mut(&conv).insert(message("m1", "me", t0()));
        store.log_mut(&conv).insert(message("m2", "me", t0()));
        store
            .log_mut(&conv)
            .apply_status(&MessageId::new("m2"), MessageStatus::Seen, t0());

        let changed = store.apply_status_bulk(
            &[MessageId::new("m1"), MessageId::new("m2")],
            MessageStatus::Delivered,
            t0() + Duration::seconds(1),
        );
        assert_eq!(changed, vec![MessageId::new("m1")]);
    }
}
