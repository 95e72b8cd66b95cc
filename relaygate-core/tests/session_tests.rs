// ABOUTME: Tests for session entries and both session store backends
// ABOUTME: The same contract suite runs against the memory store and the coordination-store backend

use chrono::{TimeZone, Utc};
use relaygate_core::coord::LocalCoordinator;
use relaygate_core::session::{
    ChatTurn, MemorySessionStore, RemoteSessionStore, SessionEntry, SessionMessage, SessionState,
    SessionStore, TurnRole,
};
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(60);

fn create_test_entry(key: &str) -> SessionEntry {
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    let original = SessionMessage {
        message_id: "m1".to_string(),
        sender: "5215512345678".to_string(),
        text: "hola".to_string(),
        media: vec![],
        received_at: now,
    };
    let mut entry = SessionEntry::new(key, original, now);
    entry.append_input("m1", "hola", &[], now, Duration::from_secs(3));
    entry
}

fn stores() -> Vec<(&'static str, Box<dyn SessionStore>)> {
    vec![
        ("memory", Box::new(MemorySessionStore::new())),
        (
            "remote",
            Box::new(RemoteSessionStore::new(Arc::new(LocalCoordinator::new()))),
        ),
    ]
}

// =============================================================================
// SessionEntry behaviour
// =============================================================================

#[test]
fn test_clone_is_structurally_independent() {
    let mut original = create_test_entry("wa|1");
    original
        .memory
        .resources
        .insert("menu".to_string(), "v1".to_string());
    let snapshot = original.clone();

    original.message_ids.push("m2".to_string());
    original.pending_media.push("/tmp/a.jpg".to_string());
    original
        .memory
        .resources
        .insert("menu".to_string(), "v2".to_string());
    original.memory.push_turn(
        ChatTurn {
            role: TurnRole::User,
            content: "more".to_string(),
            at: Utc::now(),
        },
        10,
    );

    assert_eq!(snapshot.message_ids, vec!["m1".to_string()]);
    assert!(snapshot.pending_media.is_empty());
    assert_eq!(snapshot.memory.resources["menu"], "v1");
    assert!(snapshot.memory.history.is_empty());
}

#[test]
fn test_append_and_take_buffer() {
    let mut entry = create_test_entry("wa|1");
    let later = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 2).unwrap();
    entry.append_input("m2", "  como estas ", &["/tmp/x.ogg".to_string()], later, Duration::from_secs(3));

    assert_eq!(entry.buffer, "hola\ncomo estas");
    assert_eq!(entry.expire_at, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 5).unwrap());
    assert!(!entry.is_due(later));
    assert!(entry.is_due(entry.expire_at));

    let input = entry.take_buffer();
    assert_eq!(input.text, "hola\ncomo estas");
    assert_eq!(input.message_ids, vec!["m1".to_string(), "m2".to_string()]);
    assert_eq!(input.media, vec!["/tmp/x.ogg".to_string()]);
    assert!(entry.buffer.is_empty());
    assert!(!entry.is_due(entry.expire_at), "nothing left to flush");
}

#[test]
fn test_session_state_serializes_lowercase() {
    let encoded = serde_json::to_string(&SessionState::Debouncing).unwrap();
    assert_eq!(encoded, "\"debouncing\"");
}

// =============================================================================
// Store contract, run against both backends
// =============================================================================

#[tokio::test]
async fn test_save_get_delete() {
    for (name, store) in stores() {
        let entry = create_test_entry("wa|1");
        store.save("wa|1", &entry, TTL).await.unwrap();

        let loaded = store.get("wa|1").await.unwrap();
        assert_eq!(loaded.as_ref(), Some(&entry), "{}: round trip", name);
        assert!(store.exists("wa|1").await.unwrap(), "{}", name);

        store.delete("wa|1").await.unwrap();
        assert!(store.get("wa|1").await.unwrap().is_none(), "{}: deleted", name);
        assert!(!store.exists("wa|1").await.unwrap(), "{}", name);
    }
}

#[tokio::test]
async fn test_extend_missing_session_errors() {
    for (name, store) in stores() {
        assert!(store.extend("ghost", TTL).await.is_err(), "{}", name);

        store
            .save("wa|1", &create_test_entry("wa|1"), TTL)
            .await
            .unwrap();
        assert!(store.extend("wa|1", TTL).await.is_ok(), "{}", name);
    }
}

#[tokio::test]
async fn test_list_and_get_all() {
    for (name, store) in stores() {
        for key in ["wa|1", "wa|2", "tg|9"] {
            store.save(key, &create_test_entry(key), TTL).await.unwrap();
        }

        let wa = store.list("wa|*").await.unwrap();
        assert_eq!(wa, vec!["wa|1".to_string(), "wa|2".to_string()], "{}", name);

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 3, "{}", name);
        assert_eq!(all["tg|9"].key, "tg|9", "{}", name);
    }
}

#[tokio::test]
async fn test_update_field_partial_update() {
    for (name, store) in stores() {
        store
            .save("wa|1", &create_test_entry("wa|1"), TTL)
            .await
            .unwrap();

        store
            .update_field("wa|1", "state", serde_json::json!("processing"))
            .await
            .unwrap();
        store
            .update_field("wa|1", "focus_count", serde_json::json!(4))
            .await
            .unwrap();

        let loaded = store.get("wa|1").await.unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Processing, "{}", name);
        assert_eq!(loaded.focus_count, 4, "{}", name);
        assert_eq!(loaded.buffer, "hola", "{}: other fields untouched", name);

        assert!(
            store
                .update_field("wa|1", "no_such_field", serde_json::json!(1))
                .await
                .is_err(),
            "{}",
            name
        );
        assert!(
            store
                .update_field("ghost", "state", serde_json::json!("waiting"))
                .await
                .is_err(),
            "{}",
            name
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_entries_expire_after_ttl() {
    for (name, store) in stores() {
        store
            .save("wa|1", &create_test_entry("wa|1"), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        store.extend("wa|1", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.exists("wa|1").await.unwrap(), "{}: extended", name);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get("wa|1").await.unwrap().is_none(), "{}: expired", name);
        assert!(store.list("*").await.unwrap().is_empty(), "{}", name);
    }
}

#[tokio::test(start_paused = true)]
async fn test_update_field_keeps_remaining_ttl() {
    for (name, store) in stores() {
        store
            .save("wa|1", &create_test_entry("wa|1"), Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        store
            .update_field("wa|1", "bot_id", serde_json::json!("bot-7"))
            .await
            .unwrap();
        let entry = store.get("wa|1").await.unwrap().unwrap();
        assert_eq!(entry.bot_id.as_deref(), Some("bot-7"), "{}", name);

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(
            !store.exists("wa|1").await.unwrap(),
            "{}: update must not extend the original TTL",
            name
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_memory_store_purge_expired() {
    let store = MemorySessionStore::new();
    store
        .save("short", &create_test_entry("short"), Duration::from_secs(1))
        .await
        .unwrap();
    store
        .save("long", &create_test_entry("long"), Duration::from_secs(100))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(store.purge_expired().unwrap(), 1);
    assert!(store.exists("long").await.unwrap());
}
