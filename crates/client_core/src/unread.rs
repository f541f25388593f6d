use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, GroupId, Presence, UserId, UserPresence},
    protocol::UnreadSnapshot,
};

/// Per-conversation unread/mention counters plus per-user presence.
///
/// Counters move optimistically (increment on push for a conversation that is
/// not open, reset on open) and self-heal on every mark-as-read: the server's
/// snapshot replaces local state outright, so optimistic drift never outlives
/// the next read action.
#[derive(Debug, Default)]
pub struct UnreadAggregator {
    personal: HashMap<UserId, u32>,
    groups: HashMap<GroupId, u32>,
    mentions: HashMap<GroupId, u32>,
    presence: HashMap<UserId, Presence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnreadTotals {
    pub personal: u32,
    pub groups: u32,
    pub mentions: u32,
}

impl UnreadAggregator {
    pub fn personal_count(&self, user: &UserId) -> u32 {
        self.personal.get(user).copied().unwrap_or(0)
    }

    pub fn group_count(&self, group: &GroupId) -> u32 {
        self.groups.get(group).copied().unwrap_or(0)
    }

    pub fn mention_count(&self, group: &GroupId) -> u32 {
        self.mentions.get(group).copied().unwrap_or(0)
    }

    pub fn totals(&self) -> UnreadTotals {
        UnreadTotals {
            personal: self.personal.values().sum(),
            groups: self.groups.values().sum(),
            mentions: self.mentions.values().sum(),
        }
    }

    /// Optimistic bump for a push landing in a conversation that is not open.
    pub fn increment(&mut self, conversation: &ConversationId, mentioned: bool) {
        match conversation {
            ConversationId::Direct(user) => {
                *self.personal.entry(user.clone()).or_insert(0) += 1;
            }
            ConversationId::Group(group) => {
                *self.groups.entry(group.clone()).or_insert(0) += 1;
                if mentioned {
                    *self.mentions.entry(group.clone()).or_insert(0) += 1;
                }
            }
        }
    }

    /// Optimistic zeroing when the user opens a conversation.
    pub fn reset(&mut self, conversation: &ConversationId) {
        match conversation {
            ConversationId::Direct(user) => {
                self.personal.remove(user);
            }
            ConversationId::Group(group) => {
                self.groups.remove(group);
                self.mentions.remove(group);
            }
        }
    }

    /// Replaces all counters with the server's authoritative snapshot.
    pub fn apply_snapshot(&mut self, snapshot: UnreadSnapshot) {
        self.personal = snapshot.personal;
        self.groups = snapshot.groups;
        self.mentions = snapshot.mentions;
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        UnreadSnapshot {
            personal: self.personal.clone(),
            groups: self.groups.clone(),
            mentions: self.mentions.clone(),
        }
    }

    pub fn presence(&self, user: &UserId) -> Option<&Presence> {
        self.presence.get(user)
    }

    /// Incremental single-user presence patch.
    pub fn patch_presence(&mut self, update: UserPresence) {
        self.presence.insert(update.user_id, update.presence);
    }

    /// Wholesale presence replacement from a full server snapshot.
    pub fn replace_presence(&mut self, statuses: Vec<UserPresence>) {
        self.presence = statuses
            .into_iter()
            .map(|entry| (entry.user_id, entry.presence))
            .collect();
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.presence
            .iter()
            .filter(|(_, p)| p.is_online)
            .map(|(user, _)| user.clone())
            .collect()
    }

    pub fn mark_offline(&mut self, user: &UserId, last_seen: DateTime<Utc>) {
        self.presence.insert(
            user.clone(),
            Presence {
                is_online: false,
                last_seen: Some(last_seen),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(id: &str) -> ConversationId {
        ConversationId::Direct(UserId::new(id))
    }

    fn group(id: &str) -> ConversationId {
        ConversationId::Group(GroupId::new(id))
    }

    #[test]
    fn snapshot_replaces_optimistic_counts_exactly() {
        let mut agg = UnreadAggregator::default();
        agg.increment(&direct("bob"), false);
        agg.increment(&direct("bob"), false);
        agg.increment(&direct("bob"), false);

        // Server says zero; prior optimistic increments must not survive.
        let mut snapshot = UnreadSnapshot::default();
        snapshot.personal.insert(UserId::new("bob"), 0);
        agg.apply_snapshot(snapshot);

        assert_eq!(agg.personal_count(&UserId::new("bob")), 0);
        assert_eq!(agg.totals().personal, 0);
    }

    #[test]
    fn group_mention_counts_both_namespaces() {
        let mut agg = UnreadAggregator::default();
        agg.increment(&group("team"), true);
        agg.increment(&group("team"), false);

        assert_eq!(agg.group_count(&GroupId::new("team")), 2);
        assert_eq!(agg.mention_count(&GroupId::new("team")), 1);
        assert_eq!(agg.totals().mentions, 1);
    }

    #[test]
    fn reset_clears_mentions_with_group_counter() {
        let mut agg = UnreadAggregator::default();
        agg.increment(&group("team"), true);
        agg.reset(&group("team"));

        assert_eq!(agg.group_count(&GroupId::new("team")), 0);
        assert_eq!(agg.mention_count(&GroupId::new("team")), 0);
    }

    #[test]
    fn presence_patch_and_replace() {
        let mut agg = UnreadAggregator::default();
        agg.patch_presence(UserPresence {
            user_id: UserId::new("bob"),
            presence: Presence {
                is_online: true,
                last_seen: None,
            },
        });
        assert_eq!(agg.online_users(), vec![UserId::new("bob")]);

        agg.replace_presence(vec![UserPresence {
            user_id: UserId::new("carol"),
            presence: Presence {
                is_online: true,
                last_seen: None,
            },
        }]);
        // Replacement is wholesale: bob's patched entry is gone.
        assert!(agg.presence(&UserId::new("bob")).is_none());
        assert_eq!(agg.online_users(), vec![UserId::new("carol")]);
    }
}
