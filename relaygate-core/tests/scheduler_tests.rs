// ABOUTME: Tests for the task scheduler - queue execution, recurrence and repository interplay
// ABOUTME: Uses the in-process coordination store, SQLite repositories and mock delivery adapters

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use relaygate_core::coord::{CoordinationStore, LocalCoordinator, SharedCoordinator};
use relaygate_core::monitor::MonitorStore;
use relaygate_core::scheduler::{
    AdapterRegistry, DeliveryAdapter, PostRepository, PostStatus, ScheduledPost, SchedulerConfig,
    SqlitePostRepository, TaskScheduler, QUEUE_KEY,
};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Records every send; optionally fails all of them.
struct MockAdapter {
    channel: String,
    fail: bool,
    sent: Mutex<Vec<(String, String)>>,
}

impl MockAdapter {
    fn new(channel: &str) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_string(),
            fail: false,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn failing(channel: &str) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_string(),
            fail: true,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryAdapter for MockAdapter {
    fn channel_id(&self) -> &str {
        &self.channel
    }

    async fn send(&self, target_id: &str, text: &str, _media_path: Option<&str>) -> Result<()> {
        if self.fail {
            anyhow::bail!("channel rejected the message");
        }
        self.sent
            .lock()
            .unwrap()
            .push((target_id.to_string(), text.to_string()));
        Ok(())
    }
}

struct Harness {
    store: SharedCoordinator,
    repo: Arc<SqlitePostRepository>,
    adapters: Arc<AdapterRegistry>,
    scheduler: TaskScheduler,
}

fn create_harness() -> Harness {
    let store: SharedCoordinator = Arc::new(LocalCoordinator::new());
    let repo = Arc::new(SqlitePostRepository::open_in_memory().expect("in-memory db"));
    let adapters = Arc::new(AdapterRegistry::new());
    let scheduler = TaskScheduler::new(
        store.clone(),
        repo.clone(),
        adapters.clone(),
        SchedulerConfig::default(),
    );
    Harness {
        store,
        repo,
        adapters,
        scheduler,
    }
}

fn fixed_now() -> DateTime<Utc> {
    // Monday
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

fn post_at(at: DateTime<Utc>) -> ScheduledPost {
    ScheduledPost::new("wa", "5215512345678", "agent-1", "Recordatorio de cita", at)
}

// =============================================================================
// Scheduling CRUD
// =============================================================================

#[tokio::test]
async fn test_schedule_assigns_id_and_enqueues() {
    let h = create_harness();
    let at = fixed_now() + Duration::hours(1);
    let post = h.scheduler.schedule(post_at(at)).await.unwrap();

    assert!(!post.id.is_empty());
    assert_eq!(post.status, PostStatus::Enqueued);
    let stored = h.repo.get(&post.id).unwrap().expect("persisted");
    assert_eq!(stored.scheduled_at, at);

    let queued = h
        .store
        .zrange_by_score(QUEUE_KEY, f64::NEG_INFINITY, f64::INFINITY, None)
        .await
        .unwrap();
    assert_eq!(queued, vec![(post.id.clone(), at.timestamp_millis() as f64)]);
}

#[tokio::test]
async fn test_schedule_rejects_bad_recurrence() {
    let h = create_harness();
    let post = post_at(fixed_now()).with_recurrence("1,9", "09:00");
    assert!(h.scheduler.schedule(post).await.is_err());
    let post = post_at(fixed_now()).with_recurrence("1", "nine");
    assert!(h.scheduler.schedule(post).await.is_err());
    assert!(h.repo.list_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_removes_queue_entry_and_post() {
    let h = create_harness();
    let post = h
        .scheduler
        .schedule(post_at(fixed_now() + Duration::hours(1)))
        .await
        .unwrap();

    assert!(h.scheduler.cancel(&post.id).await.unwrap());
    assert!(h.repo.get(&post.id).unwrap().is_none());
    assert_eq!(h.scheduler.pending_count().await.unwrap(), 0);
    assert!(!h.scheduler.cancel(&post.id).await.unwrap());
}

#[tokio::test]
async fn test_reschedule_moves_due_time() {
    let h = create_harness();
    let post = h
        .scheduler
        .schedule(post_at(fixed_now() + Duration::hours(1)))
        .await
        .unwrap();
    let later = fixed_now() + Duration::hours(3);

    let moved = h.scheduler.reschedule(&post.id, later).await.unwrap();
    assert_eq!(moved.scheduled_at, later);
    assert_eq!(h.scheduler.exec_tasks(fixed_now()).await.unwrap(), Some(later));
    assert!(h.scheduler.reschedule("missing", later).await.is_err());
}

// =============================================================================
// exec_tasks
// =============================================================================

#[tokio::test]
async fn test_matured_task_without_adapter_is_left_untouched() {
    let h = create_harness();
    let post = h
        .scheduler
        .schedule(post_at(fixed_now() - Duration::minutes(1)))
        .await
        .unwrap();

    let next = h.scheduler.exec_tasks(fixed_now()).await.unwrap();

    assert_eq!(next, None, "zero next-time when nothing is in the future");
    let stored = h.repo.get(&post.id).unwrap().expect("post must not be deleted");
    assert_eq!(stored.status, PostStatus::Enqueued, "not marked failed");
    assert_eq!(h.scheduler.pending_count().await.unwrap(), 1, "still queued");
}

#[tokio::test]
async fn test_future_task_returns_its_due_time() {
    let h = create_harness();
    let at = fixed_now() + Duration::hours(1);
    h.scheduler.schedule(post_at(at)).await.unwrap();
    h.adapters.register(MockAdapter::new("wa")).unwrap();

    let next = h.scheduler.exec_tasks(fixed_now()).await.unwrap();
    assert_eq!(next, Some(at));
}

#[tokio::test]
async fn test_due_time_from_wall_clock_round_trips_exactly() {
    let h = create_harness();
    let now = Utc::now();
    let at = now + Duration::hours(1) + Duration::nanoseconds(123_456);
    let post = h.scheduler.schedule(post_at(at)).await.unwrap();
    h.adapters.register(MockAdapter::new("wa")).unwrap();

    assert!(post.scheduled_at <= at && at - post.scheduled_at < Duration::milliseconds(1));
    let stored = h.repo.get(&post.id).unwrap().unwrap();
    assert_eq!(stored.scheduled_at, post.scheduled_at);
    assert_eq!(
        h.scheduler.exec_tasks(now).await.unwrap(),
        Some(post.scheduled_at)
    );

    let later = at + Duration::hours(1);
    let moved = h.scheduler.reschedule(&post.id, later).await.unwrap();
    assert_eq!(h.repo.get(&post.id).unwrap().unwrap().scheduled_at, moved.scheduled_at);
    assert_eq!(
        h.scheduler.exec_tasks(now).await.unwrap(),
        Some(moved.scheduled_at)
    );
}

#[tokio::test]
async fn test_empty_queue_returns_zero_time() {
    let h = create_harness();
    assert_eq!(h.scheduler.exec_tasks(fixed_now()).await.unwrap(), None);
}

#[tokio::test]
async fn test_one_shot_post_is_sent_and_removed() {
    let h = create_harness();
    let adapter = MockAdapter::new("wa");
    h.adapters.register(adapter.clone()).unwrap();
    let post = h
        .scheduler
        .schedule(post_at(fixed_now() - Duration::seconds(5)))
        .await
        .unwrap();

    h.scheduler.exec_tasks(fixed_now()).await.unwrap();

    assert_eq!(
        adapter.sent(),
        vec![(
            "5215512345678".to_string(),
            "Recordatorio de cita".to_string()
        )]
    );
    assert!(h.repo.get(&post.id).unwrap().is_none());
    assert_eq!(h.scheduler.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_recurring_post_is_requeued_for_next_weekday() {
    let h = create_harness();
    let adapter = MockAdapter::new("wa");
    h.adapters.register(adapter.clone()).unwrap();
    let monday_nine = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    let post = h
        .scheduler
        .schedule(post_at(monday_nine).with_recurrence("1,3", "09:00"))
        .await
        .unwrap();

    let next = h.scheduler.exec_tasks(fixed_now()).await.unwrap();

    let wednesday_nine = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap();
    assert_eq!(next, Some(wednesday_nine));
    assert_eq!(adapter.sent().len(), 1);
    let stored = h.repo.get(&post.id).unwrap().expect("recurring post kept");
    assert_eq!(stored.scheduled_at, wednesday_nine);
    assert_eq!(stored.execution_count, 1);
    assert_eq!(stored.status, PostStatus::Enqueued);
}

#[tokio::test]
async fn test_delivery_failure_marks_post_failed() {
    let h = create_harness();
    h.adapters.register(MockAdapter::failing("wa")).unwrap();
    let post = h
        .scheduler
        .schedule(post_at(fixed_now() - Duration::minutes(2)))
        .await
        .unwrap();

    let next = h.scheduler.exec_tasks(fixed_now()).await;
    assert!(next.is_ok(), "delivery failure must not fail the tick");

    let stored = h.repo.get(&post.id).unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Failed);
    assert!(stored
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("channel rejected the message"));
    assert_eq!(h.scheduler.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_orphaned_queue_entry_is_removed() {
    let h = create_harness();
    h.store
        .zadd(QUEUE_KEY, "ghost", (fixed_now() - Duration::minutes(1)).timestamp_millis() as f64)
        .await
        .unwrap();

    h.scheduler.exec_tasks(fixed_now()).await.unwrap();
    assert_eq!(h.scheduler.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_matured_tasks_run_in_due_order() {
    let h = create_harness();
    let adapter = MockAdapter::new("wa");
    h.adapters.register(adapter.clone()).unwrap();
    for (minutes, text) in [(3, "third"), (9, "first"), (6, "second")] {
        let mut post = post_at(fixed_now() - Duration::minutes(minutes));
        post.text = text.to_string();
        h.scheduler.schedule(post).await.unwrap();
    }

    h.scheduler.exec_tasks(fixed_now()).await.unwrap();
    let texts: Vec<String> = adapter.sent().into_iter().map(|(_, t)| t).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_two_schedulers_execute_each_task_once() {
    let store: SharedCoordinator = Arc::new(LocalCoordinator::new());
    let repo = Arc::new(SqlitePostRepository::open_in_memory().unwrap());
    let adapter = MockAdapter::new("wa");
    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(adapter.clone()).unwrap();

    let a = TaskScheduler::new(store.clone(), repo.clone(), adapters.clone(), SchedulerConfig::default());
    let b = TaskScheduler::new(store.clone(), repo.clone(), adapters.clone(), SchedulerConfig::default());
    for _ in 0..10 {
        a.schedule(post_at(fixed_now() - Duration::minutes(1)))
            .await
            .unwrap();
    }

    let (ra, rb) = tokio::join!(a.exec_tasks(fixed_now()), b.exec_tasks(fixed_now()));
    ra.unwrap();
    rb.unwrap();
    assert_eq!(adapter.sent().len(), 10, "each post delivered exactly once");
}

#[tokio::test]
async fn test_outcomes_are_counted_in_monitor() {
    let store: SharedCoordinator = Arc::new(LocalCoordinator::new());
    let monitor = Arc::new(MonitorStore::new(store.clone(), "node-a", "test"));
    let repo = Arc::new(SqlitePostRepository::open_in_memory().unwrap());
    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(MockAdapter::new("wa")).unwrap();
    adapters.register(MockAdapter::failing("tg")).unwrap();
    let scheduler = TaskScheduler::new(store, repo, adapters, SchedulerConfig::default())
        .with_monitor(monitor.clone());

    scheduler
        .schedule(post_at(fixed_now() - Duration::minutes(1)))
        .await
        .unwrap();
    let mut failing = post_at(fixed_now() - Duration::minutes(1));
    failing.channel_id = "tg".to_string();
    scheduler.schedule(failing).await.unwrap();

    scheduler.exec_tasks(fixed_now()).await.unwrap();
    let stats = monitor.get_global_stats().await.unwrap();
    assert_eq!(stats.extra.get("scheduled_sent"), Some(&1));
    assert_eq!(stats.extra.get("scheduled_failed"), Some(&1));
}

// =============================================================================
// run loop
// =============================================================================

#[tokio::test]
async fn test_run_delivers_and_stops_on_cancel() {
    let h = create_harness();
    let adapter = MockAdapter::new("wa");
    h.adapters.register(adapter.clone()).unwrap();
    let scheduler = Arc::new(h.scheduler);
    scheduler
        .schedule(post_at(Utc::now() - Duration::seconds(1)))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let task = {
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    for _ in 0..50 {
        if !adapter.sent().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    cancel.cancel();
    task.await.unwrap();

    assert_eq!(adapter.sent().len(), 1);
}
