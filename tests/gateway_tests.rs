// ABOUTME: Tests for the ingest pipeline composing dedup, the worker pool and the session store
// ABOUTME: Covers buffering, duplicate suppression, shedding and debounced flushes to the handler

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use relaygate::gateway::{
    ConversationHandler, Gateway, GatewaySettings, InboundMessage, IngestOutcome,
};
use relaygate_core::monitor::MonitorStore;
use relaygate_core::session::{BufferedInput, TurnRole};
use relaygate_core::{
    ConversationKey, DedupConfig, DedupGuard, LocalCoordinator, MemorySessionStore, MessageJob,
    PoolConfig, SessionEntry, SessionState, SessionStore, SharedCoordinator, WorkerPool,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<(String, BufferedInput)>>,
    reply: Option<String>,
    fail: bool,
}

#[async_trait]
impl ConversationHandler for RecordingHandler {
    async fn handle(&self, session: SessionEntry, input: BufferedInput) -> Result<Option<String>> {
        self.calls.lock().unwrap().push((session.key.clone(), input));
        if self.fail {
            anyhow::bail!("model unavailable");
        }
        Ok(self.reply.clone())
    }
}

struct Harness {
    gateway: Gateway,
    pool: Arc<WorkerPool>,
    sessions: Arc<MemorySessionStore>,
    monitor: Arc<MonitorStore>,
    handler: Arc<RecordingHandler>,
}

fn harness(workers: usize, queue_capacity: usize, handler: RecordingHandler) -> Harness {
    let store: SharedCoordinator = Arc::new(LocalCoordinator::new());
    let monitor = Arc::new(MonitorStore::new(store.clone(), "node-a", "test"));
    let dedup = Arc::new(DedupGuard::new(store.clone(), DedupConfig::default()));
    let pool = Arc::new(
        WorkerPool::start(PoolConfig {
            workers,
            queue_capacity,
            ..PoolConfig::default()
        })
        .unwrap(),
    );
    let sessions = Arc::new(MemorySessionStore::new());
    let handler = Arc::new(handler);
    let gateway = Gateway::new(
        store,
        dedup,
        pool.clone(),
        sessions.clone(),
        handler.clone(),
        GatewaySettings {
            session_ttl: Duration::from_secs(600),
            debounce: Duration::from_secs(3),
            history_window: 4,
        },
    )
    .with_monitor(monitor.clone());
    Harness {
        gateway,
        pool,
        sessions,
        monitor,
        handler,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

fn message(id: &str, chat: &str, text: &str, at: DateTime<Utc>) -> InboundMessage {
    InboundMessage {
        channel_id: "wa-main".to_string(),
        chat_id: chat.to_string(),
        message_id: id.to_string(),
        sender: "5215512345678@s.whatsapp.net".to_string(),
        text: text.to_string(),
        media: vec![],
        received_at: at,
    }
}

/// Poll until `check` holds for the stored session or give up.
async fn wait_for_session<F>(sessions: &MemorySessionStore, key: &str, check: F) -> SessionEntry
where
    F: Fn(&SessionEntry) -> bool,
{
    for _ in 0..200 {
        if let Some(entry) = sessions.get(key).await.unwrap() {
            if check(&entry) {
                return entry;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session {} never reached the expected state", key);
}

// =============================================================================
// Ingest
// =============================================================================

#[tokio::test]
async fn test_ingest_buffers_message_in_session() {
    let h = harness(2, 16, RecordingHandler::default());

    let outcome = h.gateway.ingest(message("m1", "chat-1", "hola", t0())).await;
    assert_eq!(outcome, IngestOutcome::Accepted);

    let entry = wait_for_session(&h.sessions, "wa-main|chat-1", |_| true).await;
    assert_eq!(entry.buffer, "hola");
    assert_eq!(entry.message_ids, vec!["m1".to_string()]);
    assert_eq!(entry.state, SessionState::Debouncing);
    assert_eq!(entry.expire_at, t0() + ChronoDuration::seconds(3));
    assert_eq!(entry.original.message_id, "m1");
}

#[tokio::test]
async fn test_duplicate_is_not_dispatched() {
    let h = harness(2, 16, RecordingHandler::default());

    assert_eq!(
        h.gateway.ingest(message("m1", "chat-1", "hola", t0())).await,
        IngestOutcome::Accepted
    );
    assert_eq!(
        h.gateway.ingest(message("m1", "chat-1", "hola", t0())).await,
        IngestOutcome::Duplicate
    );
    h.pool.stop().await;

    assert_eq!(h.pool.stats().dispatched, 1);
    let entry = h.sessions.get("wa-main|chat-1").await.unwrap().unwrap();
    assert_eq!(entry.buffer, "hola");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_for_one_chat_is_buffered_in_order() {
    let h = harness(4, 64, RecordingHandler::default());

    for i in 0..10 {
        let at = t0() + ChronoDuration::milliseconds(i * 100);
        let outcome = h
            .gateway
            .ingest(message(&format!("m{}", i), "chat-1", &format!("part {}", i), at))
            .await;
        assert_eq!(outcome, IngestOutcome::Accepted);
    }
    h.pool.stop().await;

    let entry = h.sessions.get("wa-main|chat-1").await.unwrap().unwrap();
    let expected: Vec<String> = (0..10).map(|i| format!("part {}", i)).collect();
    assert_eq!(entry.buffer, expected.join("\n"));
    assert_eq!(entry.message_ids.len(), 10);
    assert_eq!(entry.message_ids[9], "m9");
}

#[tokio::test]
async fn test_full_shard_sheds_and_counts_drop() {
    let h = harness(1, 1, RecordingHandler::default());
    let gate = Arc::new(Notify::new());
    let (started_tx, started_rx) = oneshot::channel();

    // Occupy the only worker
    let blocker_gate = gate.clone();
    assert!(h.pool.try_dispatch(MessageJob::new(
        ConversationKey::new("wa-main", "busy"),
        async move {
            let _ = started_tx.send(());
            blocker_gate.notified().await;
            Ok(())
        }
    )));
    started_rx.await.unwrap();

    assert_eq!(
        h.gateway.ingest(message("m1", "chat-1", "one", t0())).await,
        IngestOutcome::Accepted
    );
    assert_eq!(
        h.gateway.ingest(message("m2", "chat-2", "two", t0())).await,
        IngestOutcome::Shed
    );

    let stats = h.monitor.get_global_stats().await.unwrap();
    assert_eq!(stats.dropped, 1);

    gate.notify_one();
    h.pool.stop().await;
}

#[tokio::test]
async fn test_channel_id_with_separator_is_rejected() {
    let h = harness(2, 16, RecordingHandler::default());
    let mut msg = message("m1", "chat-1", "hola", t0());
    msg.channel_id = "wa|main".to_string();

    assert_eq!(h.gateway.ingest(msg).await, IngestOutcome::Rejected);
    h.pool.stop().await;
    assert_eq!(h.pool.stats().dispatched, 0);
    assert!(h.sessions.get_all().await.unwrap().is_empty());
}

// =============================================================================
// Debounced flush
// =============================================================================

#[tokio::test]
async fn test_flush_waits_for_quiet_period() {
    let h = harness(
        2,
        16,
        RecordingHandler {
            reply: Some("buenos dias".to_string()),
            ..RecordingHandler::default()
        },
    );

    h.gateway.ingest(message("m1", "chat-1", "hola", t0())).await;
    h.gateway
        .ingest(message("m2", "chat-1", "que tal", t0() + ChronoDuration::seconds(1)))
        .await;
    wait_for_session(&h.sessions, "wa-main|chat-1", |e| e.message_ids.len() == 2).await;

    // Second message pushed the deadline to t0 + 4s
    let early = h
        .gateway
        .flush_due_sessions(t0() + ChronoDuration::seconds(3))
        .await
        .unwrap();
    assert_eq!(early, 0);

    let queued = h
        .gateway
        .flush_due_sessions(t0() + ChronoDuration::seconds(4))
        .await
        .unwrap();
    assert_eq!(queued, 1);
    h.pool.stop().await;

    let calls = h.handler.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "wa-main|chat-1");
    assert_eq!(calls[0].1.text, "hola\nque tal");
    assert_eq!(
        calls[0].1.message_ids,
        vec!["m1".to_string(), "m2".to_string()]
    );
    drop(calls);

    let entry = h.sessions.get("wa-main|chat-1").await.unwrap().unwrap();
    assert_eq!(entry.state, SessionState::Waiting);
    assert!(entry.buffer.is_empty());
    assert_eq!(entry.focus_count, 1);
    let roles: Vec<TurnRole> = entry.memory.history.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![TurnRole::User, TurnRole::Assistant]);
    assert_eq!(entry.memory.history[1].content, "buenos dias");
}

#[tokio::test]
async fn test_chat_id_with_separator_flushes_on_its_own_shard() {
    let h = harness(
        4,
        16,
        RecordingHandler {
            reply: Some("ok".to_string()),
            ..RecordingHandler::default()
        },
    );
    let chat = "group|thread-9";

    h.gateway.ingest(message("m1", chat, "hola", t0())).await;
    let session_key = format!("wa-main|{}", chat);
    wait_for_session(&h.sessions, &session_key, |_| true).await;

    assert_eq!(
        h.gateway
            .flush_due_sessions(t0() + ChronoDuration::seconds(10))
            .await
            .unwrap(),
        1
    );
    h.pool.stop().await;

    let stats = h.pool.stats();
    let shard = h.pool.shard_for(&ConversationKey::new("wa-main", chat));
    assert_eq!(stats.workers[shard].processed, 2, "buffer and flush share a shard");
    let calls = h.handler.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, session_key);
}

#[tokio::test]
async fn test_flushed_session_is_not_flushed_again() {
    let h = harness(1, 16, RecordingHandler::default());

    h.gateway.ingest(message("m1", "chat-1", "hola", t0())).await;
    wait_for_session(&h.sessions, "wa-main|chat-1", |_| true).await;

    let later = t0() + ChronoDuration::seconds(10);
    assert_eq!(h.gateway.flush_due_sessions(later).await.unwrap(), 1);
    wait_for_session(&h.sessions, "wa-main|chat-1", |e| {
        e.state == SessionState::Waiting
    })
    .await;

    assert_eq!(h.gateway.flush_due_sessions(later).await.unwrap(), 0);
    h.pool.stop().await;
    assert_eq!(h.handler.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_handler_failure_counts_error_and_releases_session() {
    let h = harness(
        1,
        16,
        RecordingHandler {
            fail: true,
            ..RecordingHandler::default()
        },
    );

    h.gateway.ingest(message("m1", "chat-1", "hola", t0())).await;
    wait_for_session(&h.sessions, "wa-main|chat-1", |_| true).await;
    h.gateway
        .flush_due_sessions(t0() + ChronoDuration::seconds(10))
        .await
        .unwrap();
    h.pool.stop().await;

    assert_eq!(h.pool.stats().errors, 1);
    let entry = h.sessions.get("wa-main|chat-1").await.unwrap().unwrap();
    assert_eq!(entry.state, SessionState::Waiting);
    // The user's turn is kept even though no reply came back
    assert_eq!(entry.memory.history.len(), 1);
}

#[tokio::test]
async fn test_history_window_is_enforced_across_flushes() {
    let h = harness(
        1,
        16,
        RecordingHandler {
            reply: Some("ok".to_string()),
            ..RecordingHandler::default()
        },
    );

    for round in 0..3i64 {
        let at = t0() + ChronoDuration::minutes(round);
        h.gateway
            .ingest(message(&format!("m{}", round), "chat-1", &format!("q{}", round), at))
            .await;
        wait_for_session(&h.sessions, "wa-main|chat-1", |e| {
            e.state == SessionState::Debouncing
        })
        .await;
        h.gateway
            .flush_due_sessions(at + ChronoDuration::seconds(5))
            .await
            .unwrap();
        wait_for_session(&h.sessions, "wa-main|chat-1", |e| {
            e.state == SessionState::Waiting
        })
        .await;
    }
    h.pool.stop().await;

    let entry = h.sessions.get("wa-main|chat-1").await.unwrap().unwrap();
    assert_eq!(entry.memory.history.len(), 4);
    assert_eq!(entry.memory.history[0].content, "q1");
}
