// ABOUTME: Metric names and recording helpers over the `metrics` facade.
// ABOUTME: Any installed recorder (the binary uses Prometheus) collects these.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Register every relaygate metric description.
///
/// Call once at startup after the recorder is installed.
pub fn register_metrics() {
    describe_counter!("relaygate_jobs_dispatched_total", "Jobs accepted by the worker pool");
    describe_counter!(
        "relaygate_jobs_dropped_total",
        "Jobs shed because a shard queue was full or the pool was stopped"
    );
    describe_counter!("relaygate_jobs_processed_total", "Jobs that finished running");
    describe_counter!("relaygate_job_errors_total", "Jobs whose handler returned an error");
    describe_counter!("relaygate_job_panics_total", "Jobs whose handler panicked");
    describe_counter!("relaygate_dedup_admitted_total", "Inbound messages admitted");
    describe_counter!("relaygate_dedup_rejected_total", "Inbound messages rejected as duplicates");
    describe_counter!("relaygate_scheduled_sent_total", "Scheduled posts delivered");
    describe_counter!("relaygate_scheduled_failed_total", "Scheduled posts that failed delivery");
    describe_counter!("relaygate_ingest_total", "Inbound messages by ingest outcome");
    describe_counter!(
        "relaygate_monitor_updates_dropped_total",
        "Worker telemetry updates discarded because the monitor writer was behind"
    );
    describe_gauge!("relaygate_queue_depth", "Jobs waiting in a shard queue");
    describe_histogram!("relaygate_job_duration_seconds", "Handler run time in seconds");
}

pub fn record_job_dispatched(worker_id: usize) {
    metrics::counter!("relaygate_jobs_dispatched_total", "worker" => worker_id.to_string())
        .increment(1);
}

pub fn record_job_dropped(reason: &'static str) {
    metrics::counter!("relaygate_jobs_dropped_total", "reason" => reason).increment(1);
}

/// Record a finished job and how long its handler ran.
pub fn record_job_finished(worker_id: usize, seconds: f64) {
    metrics::counter!("relaygate_jobs_processed_total", "worker" => worker_id.to_string())
        .increment(1);
    metrics::histogram!("relaygate_job_duration_seconds").record(seconds);
}

pub fn record_job_error() {
    metrics::counter!("relaygate_job_errors_total").increment(1);
}

pub fn record_job_panic() {
    metrics::counter!("relaygate_job_panics_total").increment(1);
}

pub fn record_dedup(channel: &str, admitted: bool) {
    if admitted {
        metrics::counter!("relaygate_dedup_admitted_total", "channel" => channel.to_string())
            .increment(1);
    } else {
        metrics::counter!("relaygate_dedup_rejected_total", "channel" => channel.to_string())
            .increment(1);
    }
}

pub fn record_scheduled_sent(channel: &str) {
    metrics::counter!("relaygate_scheduled_sent_total", "channel" => channel.to_string())
        .increment(1);
}

pub fn record_scheduled_failed(channel: &str) {
    metrics::counter!("relaygate_scheduled_failed_total", "channel" => channel.to_string())
        .increment(1);
}

pub fn record_monitor_update_dropped() {
    metrics::counter!("relaygate_monitor_updates_dropped_total").increment(1);
}

pub fn set_queue_depth(worker_id: usize, depth: usize) {
    metrics::gauge!("relaygate_queue_depth", "worker" => worker_id.to_string()).set(depth as f64);
}

/// Count one inbound message by what the gateway did with it.
pub fn record_ingest(outcome: &'static str) {
    metrics::counter!("relaygate_ingest_total", "outcome" => outcome).increment(1);
}
