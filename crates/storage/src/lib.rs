use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{
        ConversationId, DeleteScope, GroupId, GroupMember, GroupRole, MediaRef, MentionSpan,
        Message, MessageId, MessageStatus, Presence, Reaction, ReplyRef, UserId, UserPresence,
    },
    protocol::UnreadSnapshot,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

const MESSAGE_COLUMNS: &str = "id, conversation_kind, conversation_id, sender_id, text, media, \
     created_at, status, delivered_at, seen_at, edited, edited_at, original_text, deleted, \
     delete_scope, deleted_at, reactions, reply_to, mentions";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every pooled connection to `sqlite::memory:` opens its own database,
        // so in-memory urls must stay on a single connection.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id                TEXT PRIMARY KEY,
                conversation_kind TEXT NOT NULL,
                conversation_id   TEXT NOT NULL,
                sender_id         TEXT NOT NULL,
                text              TEXT,
                media             TEXT,
                created_at        TEXT NOT NULL,
                status            TEXT NOT NULL,
                delivered_at      TEXT,
                seen_at           TEXT,
                edited            INTEGER NOT NULL DEFAULT 0,
                edited_at         TEXT,
                original_text     TEXT,
                deleted           INTEGER NOT NULL DEFAULT 0,
                delete_scope      TEXT,
                deleted_at        TEXT,
                reactions         TEXT NOT NULL DEFAULT '[]',
                reply_to          TEXT,
                mentions          TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure messages table exists")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages (conversation_kind, conversation_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_receipts (
                message_id   TEXT NOT NULL,
                user_id      TEXT NOT NULL,
                delivered_at TEXT,
                seen_at      TEXT,
                PRIMARY KEY (message_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure message_receipts table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id           TEXT PRIMARY KEY,
                display_name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id   TEXT PRIMARY KEY,
                name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                user_id  TEXT NOT NULL,
                role     TEXT NOT NULL,
                PRIMARY KEY (group_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS unread_counters (
                user_id     TEXT NOT NULL,
                scope       TEXT NOT NULL,
                counter_key TEXT NOT NULL,
                count       INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, scope, counter_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS presence (
                user_id   TEXT PRIMARY KEY,
                is_online INTEGER NOT NULL DEFAULT 0,
                last_seen TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----- users -----

    pub async fn upsert_user(&self, user_id: &UserId, display_name: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, display_name) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
        )
        .bind(user_id.as_str())
        .bind(display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn display_name(&self, user_id: &UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT display_name FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    // ----- messages -----

    pub async fn insert_message(&self, message: &Message) -> Result<()> {
        let (kind, conversation_id) = conversation_columns(&message.conversation);
        sqlx::query(
            "INSERT INTO messages (id, conversation_kind, conversation_id, sender_id, text, media, \
             created_at, status, delivered_at, seen_at, edited, edited_at, original_text, deleted, \
             delete_scope, deleted_at, reactions, reply_to, mentions)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.as_str())
        .bind(kind)
        .bind(conversation_id)
        .bind(message.sender_id.as_str())
        .bind(message.text.as_deref())
        .bind(opt_json(&message.media)?)
        .bind(message.created_at)
        .bind(status_to_str(message.status))
        .bind(message.delivered_at)
        .bind(message.seen_at)
        .bind(message.edited)
        .bind(message.edited_at)
        .bind(message.original_text.as_deref())
        .bind(message.deleted)
        .bind(message.delete_scope.map(scope_to_str))
        .bind(message.deleted_at)
        .bind(serde_json::to_string(&message.reactions)?)
        .bind(opt_json(&message.reply_to)?)
        .bind(serde_json::to_string(&message.mentions)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overwrites every mutable field of an existing message. Identity and
    /// placement (conversation, sender, created_at) never change.
    pub async fn update_message(&self, message: &Message) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET text = ?, media = ?, status = ?, delivered_at = ?, seen_at = ?, \
             edited = ?, edited_at = ?, original_text = ?, deleted = ?, delete_scope = ?, \
             deleted_at = ?, reactions = ?, reply_to = ?, mentions = ?
             WHERE id = ?",
        )
        .bind(message.text.as_deref())
        .bind(opt_json(&message.media)?)
        .bind(status_to_str(message.status))
        .bind(message.delivered_at)
        .bind(message.seen_at)
        .bind(message.edited)
        .bind(message.edited_at)
        .bind(message.original_text.as_deref())
        .bind(message.deleted)
        .bind(message.delete_scope.map(scope_to_str))
        .bind(message.deleted_at)
        .bind(serde_json::to_string(&message.reactions)?)
        .bind(opt_json(&message.reply_to)?)
        .bind(serde_json::to_string(&message.mentions)?)
        .bind(message.id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    /// Full history of a conversation as seen by `viewer`, oldest first.
    /// Direct history covers both directions of the pair.
    pub async fn list_messages(
        &self,
        viewer: &UserId,
        conversation: &ConversationId,
    ) -> Result<Vec<Message>> {
        let rows = match conversation {
            ConversationId::Direct(peer) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_kind = 'direct'
                       AND ((conversation_id = ? AND sender_id = ?)
                         OR (conversation_id = ? AND sender_id = ?))
                     ORDER BY created_at ASC, id ASC"
                ))
                .bind(peer.as_str())
                .bind(viewer.as_str())
                .bind(viewer.as_str())
                .bind(peer.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            ConversationId::Group(group) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_kind = 'group' AND conversation_id = ?
                     ORDER BY created_at ASC, id ASC"
                ))
                .bind(group.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(message_from_row).collect()
    }

    /// Records a delivered/seen receipt from `reporter` and moves each message
    /// forward on the delivery ladder once every recipient has reported that
    /// far. Direct messages have a single recipient, so the receipt and the
    /// message status coincide; a group message only flips when the last
    /// member's receipt lands. Downgrades and replays match zero rows; the
    /// monotonic guard lives in the query so concurrent updates cannot
    /// interleave a regression. Returns (id, sender, new status) for every
    /// message that actually changed, so callers know whom to notify.
    pub async fn advance_status(
        &self,
        reporter: &UserId,
        ids: &[MessageId],
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<(MessageId, UserId, MessageStatus)>> {
        if !matches!(status, MessageStatus::Delivered | MessageStatus::Seen) {
            return Err(anyhow!("{status:?} is not a receipt status"));
        }
        let mut affected = Vec::new();
        for id in ids {
            let row = sqlx::query(
                "SELECT conversation_kind, conversation_id, sender_id FROM messages WHERE id = ?",
            )
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
            let Some(row) = row else {
                continue;
            };
            let kind: String = row.get(0);
            let conversation_id: String = row.get(1);
            let sender = UserId::new(row.get::<String, _>(2));

            // Only actual recipients can confirm: the direct peer, or a group
            // member other than the sender.
            let valid_reporter = &sender != reporter
                && match kind.as_str() {
                    "direct" => conversation_id == reporter.as_str(),
                    _ => {
                        self.is_group_member(&GroupId::new(conversation_id.clone()), reporter)
                            .await?
                    }
                };
            if !valid_reporter {
                continue;
            }

            // Seen implies delivered, so a seen receipt fills both columns.
            // First timestamps win on replay.
            let seen_at = (status == MessageStatus::Seen).then_some(timestamp);
            sqlx::query(
                "INSERT INTO message_receipts (message_id, user_id, delivered_at, seen_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(message_id, user_id) DO UPDATE SET
                    delivered_at = COALESCE(message_receipts.delivered_at, excluded.delivered_at),
                    seen_at = COALESCE(message_receipts.seen_at, excluded.seen_at)",
            )
            .bind(id.as_str())
            .bind(reporter.as_str())
            .bind(timestamp)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;

            let recipients: i64 = match kind.as_str() {
                "direct" => 1,
                _ => {
                    sqlx::query_scalar(
                        "SELECT COUNT(*) FROM group_members WHERE group_id = ? AND user_id != ?",
                    )
                    .bind(&conversation_id)
                    .bind(sender.as_str())
                    .fetch_one(&self.pool)
                    .await?
                }
            };
            let counts = sqlx::query(
                "SELECT COUNT(delivered_at), COUNT(seen_at) FROM message_receipts
                 WHERE message_id = ?",
            )
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await?;
            let delivered_count: i64 = counts.get(0);
            let seen_count: i64 = counts.get(1);

            let aggregate = if seen_count >= recipients {
                MessageStatus::Seen
            } else if delivered_count >= recipients {
                MessageStatus::Delivered
            } else {
                continue;
            };
            let Some(rank) = aggregate.ladder_rank() else {
                continue;
            };

            let result = sqlx::query(
                "UPDATE messages SET
                    status = ?,
                    delivered_at = CASE
                        WHEN ? = 'delivered' THEN ?
                        WHEN ? = 'seen' AND delivered_at IS NULL THEN ?
                        ELSE delivered_at END,
                    seen_at = CASE WHEN ? = 'seen' THEN ? ELSE seen_at END
                 WHERE id = ?
                   AND CASE status
                        WHEN 'sending' THEN 0
                        WHEN 'sent' THEN 1
                        WHEN 'delivered' THEN 2
                        WHEN 'seen' THEN 3
                        ELSE 4 END < ?",
            )
            .bind(status_to_str(aggregate))
            .bind(status_to_str(aggregate))
            .bind(timestamp)
            .bind(status_to_str(aggregate))
            .bind(timestamp)
            .bind(status_to_str(aggregate))
            .bind(timestamp)
            .bind(id.as_str())
            .bind(i64::from(rank))
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                affected.push((id.clone(), sender, aggregate));
            }
        }
        Ok(affected)
    }

    pub async fn set_reactions(&self, id: &MessageId, reactions: &[Reaction]) -> Result<()> {
        sqlx::query("UPDATE messages SET reactions = ? WHERE id = ?")
            .bind(serde_json::to_string(reactions)?)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- groups -----

    pub async fn create_group(&self, group: &GroupId, name: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO groups (id, name) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(group.as_str())
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn group_name(&self, group: &GroupId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT name FROM groups WHERE id = ?")
            .bind(group.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn add_group_member(&self, group: &GroupId, member: &GroupMember) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id, role) VALUES (?, ?, ?)
             ON CONFLICT(group_id, user_id) DO UPDATE SET role = excluded.role",
        )
        .bind(group.as_str())
        .bind(member.user_id.as_str())
        .bind(role_to_str(member.role))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn group_members(&self, group: &GroupId) -> Result<Vec<GroupMember>> {
        let rows = sqlx::query(
            "SELECT user_id, role FROM group_members WHERE group_id = ? ORDER BY user_id ASC",
        )
        .bind(group.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| GroupMember {
                user_id: UserId::new(r.get::<String, _>(0)),
                role: role_from_str(&r.get::<String, _>(1)),
            })
            .collect())
    }

    pub async fn is_group_member(&self, group: &GroupId, user: &UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group.as_str())
            .bind(user.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    // ----- unread counters -----

    /// Bumps the recipient's counter for a conversation. The personal key is
    /// the peer's id, the group key is the group's id; a mention bumps its own
    /// counter alongside the group one.
    pub async fn bump_unread(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        mentioned: bool,
    ) -> Result<()> {
        match conversation {
            ConversationId::Direct(peer) => {
                self.bump_counter(user, "personal", peer.as_str()).await?;
            }
            ConversationId::Group(group) => {
                self.bump_counter(user, "group", group.as_str()).await?;
                if mentioned {
                    self.bump_counter(user, "mention", group.as_str()).await?;
                }
            }
        }
        Ok(())
    }

    async fn bump_counter(&self, user: &UserId, scope: &str, key: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO unread_counters (user_id, scope, counter_key, count) VALUES (?, ?, ?, 1)
             ON CONFLICT(user_id, scope, counter_key) DO UPDATE SET count = count + 1",
        )
        .bind(user.as_str())
        .bind(scope)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Zeroes the counters a read action covers. Reading a group clears its
    /// mention counter too.
    pub async fn reset_unread(&self, user: &UserId, conversation: &ConversationId) -> Result<()> {
        let (scopes, key): (&[&str], &str) = match conversation {
            ConversationId::Direct(peer) => (&["personal"], peer.as_str()),
            ConversationId::Group(group) => (&["group", "mention"], group.as_str()),
        };
        for scope in scopes {
            sqlx::query(
                "DELETE FROM unread_counters WHERE user_id = ? AND scope = ? AND counter_key = ?",
            )
            .bind(user.as_str())
            .bind(scope)
            .bind(key)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn unread_snapshot(&self, user: &UserId) -> Result<UnreadSnapshot> {
        let rows = sqlx::query(
            "SELECT scope, counter_key, count FROM unread_counters WHERE user_id = ? AND count > 0",
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = UnreadSnapshot::default();
        for row in rows {
            let scope: String = row.get(0);
            let key: String = row.get(1);
            let count: i64 = row.get(2);
            let count = u32::try_from(count).unwrap_or(u32::MAX);
            match scope.as_str() {
                "personal" => {
                    snapshot.personal.insert(UserId::new(key), count);
                }
                "group" => {
                    snapshot.groups.insert(GroupId::new(key), count);
                }
                "mention" => {
                    snapshot.mentions.insert(GroupId::new(key), count);
                }
                other => return Err(anyhow!("unknown unread scope '{other}'")),
            }
        }
        Ok(snapshot)
    }

    // ----- presence -----

    pub async fn set_presence(
        &self,
        user: &UserId,
        is_online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO presence (user_id, is_online, last_seen) VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                is_online = excluded.is_online,
                last_seen = COALESCE(excluded.last_seen, presence.last_seen)",
        )
        .bind(user.as_str())
        .bind(is_online)
        .bind(last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn presence_snapshot(&self) -> Result<Vec<UserPresence>> {
        let rows = sqlx::query("SELECT user_id, is_online, last_seen FROM presence")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserPresence {
                user_id: UserId::new(r.get::<String, _>(0)),
                presence: Presence {
                    is_online: r.get::<bool, _>(1),
                    last_seen: r.get::<Option<DateTime<Utc>>, _>(2),
                },
            })
            .collect())
    }
}

fn conversation_columns(conversation: &ConversationId) -> (&'static str, &str) {
    match conversation {
        ConversationId::Direct(user) => ("direct", user.as_str()),
        ConversationId::Group(group) => ("group", group.as_str()),
    }
}

fn status_to_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sending => "sending",
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Seen => "seen",
        MessageStatus::Failed => "failed",
    }
}

fn status_from_str(value: &str) -> Result<MessageStatus> {
    Ok(match value {
        "sending" => MessageStatus::Sending,
        "sent" => MessageStatus::Sent,
        "delivered" => MessageStatus::Delivered,
        "seen" => MessageStatus::Seen,
        "failed" => MessageStatus::Failed,
        other => return Err(anyhow!("unknown message status '{other}'")),
    })
}

fn scope_to_str(scope: DeleteScope) -> &'static str {
    match scope {
        DeleteScope::Me => "me",
        DeleteScope::Everyone => "everyone",
    }
}

fn scope_from_str(value: &str) -> Result<DeleteScope> {
    Ok(match value {
        "me" => DeleteScope::Me,
        "everyone" => DeleteScope::Everyone,
        other => return Err(anyhow!("unknown delete scope '{other}'")),
    })
}

fn role_to_str(role: GroupRole) -> &'static str {
    match role {
        GroupRole::Admin => "admin",
        GroupRole::Member => "member",
    }
}

fn role_from_str(value: &str) -> GroupRole {
    match value {
        "admin" => GroupRole::Admin,
        _ => GroupRole::Member,
    }
}

fn opt_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(Into::into))
        .transpose()
}

fn opt_from_json<T: serde::de::DeserializeOwned>(value: Option<String>) -> Result<Option<T>> {
    value
        .map(|v| serde_json::from_str(&v).map_err(Into::into))
        .transpose()
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let kind: String = row.get(1);
    let conversation_id: String = row.get(2);
    let conversation = match kind.as_str() {
        "direct" => ConversationId::Direct(UserId::new(conversation_id)),
        "group" => ConversationId::Group(GroupId::new(conversation_id)),
        other => return Err(anyhow!("unknown conversation kind '{other}'")),
    };

    let media: Option<MediaRef> = opt_from_json(row.get::<Option<String>, _>(5))?;
    let reactions: Vec<Reaction> = serde_json::from_str(&row.get::<String, _>(16))?;
    let reply_to: Option<ReplyRef> = opt_from_json(row.get::<Option<String>, _>(17))?;
    let mentions: Vec<MentionSpan> = serde_json::from_str(&row.get::<String, _>(18))?;

    Ok(Message {
        id: MessageId::new(row.get::<String, _>(0)),
        conversation,
        sender_id: UserId::new(row.get::<String, _>(3)),
        text: row.get::<Option<String>, _>(4),
        media,
        created_at: row.get::<DateTime<Utc>, _>(6),
        status: status_from_str(&row.get::<String, _>(7))?,
        delivered_at: row.get::<Option<DateTime<Utc>>, _>(8),
        seen_at: row.get::<Option<DateTime<Utc>>, _>(9),
        edited: row.get::<bool, _>(10),
        edited_at: row.get::<Option<DateTime<Utc>>, _>(11),
        original_text: row.get::<Option<String>, _>(12),
        deleted: row.get::<bool, _>(13),
        delete_scope: row
            .get::<Option<String>, _>(14)
            .map(|s| scope_from_str(&s))
            .transpose()?,
        deleted_at: row.get::<Option<DateTime<Utc>>, _>(15),
        reactions,
        reply_to,
        mentions,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
