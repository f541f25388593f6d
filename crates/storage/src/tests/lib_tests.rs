use super::*;
use chrono::Duration;

fn user(id: &str) -> UserId {
    UserId::new(id)
}

fn t0() -> DateTime<Utc> {
    "2024-06-01T12:00:00Z".parse().expect("timestamp")
}

fn message(id: &str, sender: &str, conversation: ConversationId, at: DateTime<Utc>) -> Message {
    Message {
        id: MessageId::new(id),
        conversation,
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

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("ledger_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn direct_history_covers_both_directions_in_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice_to_bob = ConversationId::Direct(user("bob"));
    let bob_to_alice = ConversationId::Direct(user("alice"));

    storage
        .insert_message(&message("m2", "bob", bob_to_alice, t0() + Duration::seconds(5)))
        .await
        .expect("insert");
    storage
        .insert_message(&message("m1", "alice", alice_to_bob.clone(), t0()))
        .await
        .expect("insert");

    let history = storage
        .list_messages(&user("alice"), &alice_to_bob)
        .await
        .expect("history");
    let ids: Vec<_> = history.iter().map(|m| m.id.as_str().to_string()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}

#[tokio::test]
async fn group_history_is_shared_across_viewers() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let team = ConversationId::Group(GroupId::new("team"));
    storage
        .insert_message(&message("m1", "alice", team.clone(), t0()))
        .await
        .expect("insert");

    let from_bob = storage
        .list_messages(&user("bob"), &team)
        .await
        .expect("history");
    let from_carol = storage
        .list_messages(&user("carol"), &team)
        .await
        .expect("history");
    assert_eq!(from_bob, from_carol);
    assert_eq!(from_bob.len(), 1);
}

#[tokio::test]
async fn advance_status_is_monotonic_and_reports_senders() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let conv = ConversationId::Direct(user("bob"));
    storage
        .insert_message(&message("m1", "alice", conv, t0()))
        .await
        .expect("insert");
    let id = MessageId::new("m1");

    let affected = storage
        .advance_status(
            &user("bob"),
            &[id.clone()],
            MessageStatus::Delivered,
            t0() + Duration::seconds(1),
        )
        .await
        .expect("advance");
    assert_eq!(affected, vec![(id.clone(), user("alice"), MessageStatus::Delivered)]);

    // Replay and downgrade both match nothing.
    let replay = storage
        .advance_status(
            &user("bob"),
            &[id.clone()],
            MessageStatus::Delivered,
            t0() + Duration::seconds(9),
        )
        .await
        .expect("advance");
    assert!(replay.is_empty());
    storage
        .advance_status(&user("bob"), &[id.clone()], MessageStatus::Sent, t0())
        .await
        .expect_err("sent is not a receipt status");

    let stored = storage.get_message(&id).await.expect("get").expect("m1");
    assert_eq!(stored.status, MessageStatus::Delivered);
    assert_eq!(stored.delivered_at, Some(t0() + Duration::seconds(1)));
}

#[tokio::test]
async fn receipts_from_non_recipients_never_move_a_message() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let conv = ConversationId::Direct(user("bob"));
    storage
        .insert_message(&message("m1", "alice", conv, t0()))
        .await
        .expect("insert");
    let id = MessageId::new("m1");

    // Neither the sender nor a bystander counts as a recipient.
    let from_sender = storage
        .advance_status(&user("alice"), &[id.clone()], MessageStatus::Seen, t0())
        .await
        .expect("advance");
    assert!(from_sender.is_empty());
    let from_stranger = storage
        .advance_status(&user("mallory"), &[id.clone()], MessageStatus::Seen, t0())
        .await
        .expect("advance");
    assert!(from_stranger.is_empty());

    let stored = storage.get_message(&id).await.expect("get").expect("m1");
    assert_eq!(stored.status, MessageStatus::Sent);
}

#[tokio::test]
async fn seen_jump_backfills_delivered_at() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let conv = ConversationId::Direct(user("bob"));
    storage
        .insert_message(&message("m1", "alice", conv, t0()))
        .await
        .expect("insert");
    let id = MessageId::new("m1");
    let seen_at = t0() + Duration::seconds(3);

    storage
        .advance_status(&user("bob"), &[id.clone()], MessageStatus::Seen, seen_at)
        .await
        .expect("advance");

    let stored = storage.get_message(&id).await.expect("get").expect("m1");
    assert_eq!(stored.status, MessageStatus::Seen);
    assert_eq!(stored.seen_at, Some(seen_at));
    assert_eq!(stored.delivered_at, Some(seen_at));
}

#[tokio::test]
async fn group_status_follows_the_slowest_member() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let team = GroupId::new("team");
    storage.create_group(&team, "The Team").await.expect("group");
    for (member, role) in [
        ("alice", GroupRole::Admin),
        ("bob", GroupRole::Member),
        ("carol", GroupRole::Member),
    ] {
        storage
            .add_group_member(
                &team,
                &GroupMember {
                    user_id: user(member),
                    role,
                },
            )
            .await
            .expect("member");
    }
    storage
        .insert_message(&message("m1", "alice", ConversationId::Group(team), t0()))
        .await
        .expect("insert");
    let id = MessageId::new("m1");

    // One of two recipients has seen it; the message itself must not move.
    let first = storage
        .advance_status(
            &user("bob"),
            &[id.clone()],
            MessageStatus::Seen,
            t0() + Duration::seconds(1),
        )
        .await
        .expect("advance");
    assert!(first.is_empty());
    let stored = storage.get_message(&id).await.expect("get").expect("m1");
    assert_eq!(stored.status, MessageStatus::Sent);

    // Carol's delivery completes the delivered aggregate only.
    let second = storage
        .advance_status(
            &user("carol"),
            &[id.clone()],
            MessageStatus::Delivered,
            t0() + Duration::seconds(2),
        )
        .await
        .expect("advance");
    assert_eq!(second, vec![(id.clone(), user("alice"), MessageStatus::Delivered)]);

    // Carol's seen receipt completes the seen aggregate.
    let third = storage
        .advance_status(
            &user("carol"),
            &[id.clone()],
            MessageStatus::Seen,
            t0() + Duration::seconds(3),
        )
        .await
        .expect("advance");
    assert_eq!(third, vec![(id.clone(), user("alice"), MessageStatus::Seen)]);

    let replay = storage
        .advance_status(
            &user("carol"),
            &[id.clone()],
            MessageStatus::Seen,
            t0() + Duration::seconds(9),
        )
        .await
        .expect("advance");
    assert!(replay.is_empty());
    let stored = storage.get_message(&id).await.expect("get").expect("m1");
    assert_eq!(stored.status, MessageStatus::Seen);
}

#[tokio::test]
async fn update_message_round_trips_edit_and_tombstone() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let conv = ConversationId::Direct(user("bob"));
    storage
        .insert_message(&message("m1", "alice", conv, t0()))
        .await
        .expect("insert");

    let mut edited = storage
        .get_message(&MessageId::new("m1"))
        .await
        .expect("get")
        .expect("m1");
    edited.original_text = edited.text.clone();
    edited.text = Some("corrected".into());
    edited.edited = true;
    edited.edited_at = Some(t0() + Duration::minutes(2));
    storage.update_message(&edited).await.expect("update");

    let stored = storage
        .get_message(&MessageId::new("m1"))
        .await
        .expect("get")
        .expect("m1");
    assert_eq!(stored.text.as_deref(), Some("corrected"));
    assert_eq!(stored.original_text.as_deref(), Some("text-m1"));
    assert!(stored.edited);

    let mut tombstone = stored;
    tombstone.text = None;
    tombstone.original_text = None;
    tombstone.deleted = true;
    tombstone.delete_scope = Some(DeleteScope::Everyone);
    tombstone.deleted_at = Some(t0() + Duration::minutes(3));
    storage.update_message(&tombstone).await.expect("update");

    let stored = storage
        .get_message(&MessageId::new("m1"))
        .await
        .expect("get")
        .expect("m1");
    assert!(stored.deleted);
    assert!(stored.text.is_none());
    assert_eq!(stored.delete_scope, Some(DeleteScope::Everyone));
}

#[tokio::test]
async fn reactions_round_trip_as_json() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let conv = ConversationId::Direct(user("bob"));
    storage
        .insert_message(&message("m1", "alice", conv, t0()))
        .await
        .expect("insert");
    let id = MessageId::new("m1");

    storage
        .set_reactions(
            &id,
            &[Reaction {
                user_id: user("bob"),
                emoji: "👍".into(),
            }],
        )
        .await
        .expect("reactions");

    let stored = storage.get_message(&id).await.expect("get").expect("m1");
    assert_eq!(stored.reactions.len(), 1);
    assert_eq!(stored.reactions[0].emoji, "👍");
}

#[tokio::test]
async fn unread_counters_bump_reset_and_snapshot() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = user("alice");
    let from_bob = ConversationId::Direct(user("bob"));
    let team = ConversationId::Group(GroupId::new("team"));

    storage.bump_unread(&alice, &from_bob, false).await.expect("bump");
    storage.bump_unread(&alice, &from_bob, false).await.expect("bump");
    storage.bump_unread(&alice, &team, true).await.expect("bump");
    storage.bump_unread(&alice, &team, false).await.expect("bump");

    let snapshot = storage.unread_snapshot(&alice).await.expect("snapshot");
    assert_eq!(snapshot.personal.get(&user("bob")), Some(&2));
    assert_eq!(snapshot.groups.get(&GroupId::new("team")), Some(&2));
    assert_eq!(snapshot.mentions.get(&GroupId::new("team")), Some(&1));

    storage.reset_unread(&alice, &team).await.expect("reset");
    let snapshot = storage.unread_snapshot(&alice).await.expect("snapshot");
    assert!(snapshot.groups.is_empty());
    assert!(snapshot.mentions.is_empty());
    assert_eq!(snapshot.personal_total(), 2);
}

#[tokio::test]
async fn group_membership_round_trip() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let team = GroupId::new("team");
    storage.create_group(&team, "The Team").await.expect("group");
    storage
        .add_group_member(
            &team,
            &GroupMember {
                user_id: user("alice"),
                role: GroupRole::Admin,
            },
        )
        .await
        .expect("member");
    storage
        .add_group_member(
            &team,
            &GroupMember {
                user_id: user("bob"),
                role: GroupRole::Member,
            },
        )
        .await
        .expect("member");

    assert_eq!(storage.group_name(&team).await.expect("name").as_deref(), Some("The Team"));
    let members = storage.group_members(&team).await.expect("members");
    assert_eq!(members.len(), 2);
    assert!(storage.is_group_member(&team, &user("bob")).await.expect("member"));
    assert!(!storage.is_group_member(&team, &user("mallory")).await.expect("member"));
}

#[tokio::test]
async fn presence_upsert_keeps_last_seen_when_going_online() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let bob = user("bob");

    storage
        .set_presence(&bob, false, Some(t0()))
        .await
        .expect("presence");
    storage.set_presence(&bob, true, None).await.expect("presence");

    let snapshot = storage.presence_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].presence.is_online);
    assert_eq!(snapshot[0].presence.last_seen, Some(t0()));
}
