use anyhow::Result;
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::debug;

pub struct MetricsCollector {
    // Task metrics
    tasks_created_total: Counter,
    tasks_placed_total: Counter,
    placements_skipped_total: Counter,
    tasks_completed_total: Counter,
    tasks_failed_total: Counter,

    // Job metrics
    jobs_submitted_total: Counter,
    jobs_collected_total: Counter,
    jobs_failed_total: Counter,
    active_jobs: Gauge,

    // Remote metrics
    remote_failures_total: Counter,
    remote_call_duration: Histogram,

    // Pass metrics
    pass_duration: Histogram,
    passes_total: Counter,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tasks_created_total: counter!("scheduler_tasks_created_total"),
            tasks_placed_total: counter!("scheduler_tasks_placed_total"),
            placements_skipped_total: counter!("scheduler_placements_skipped_total"),
            tasks_completed_total: counter!("scheduler_tasks_completed_total"),
            tasks_failed_total: counter!("scheduler_tasks_failed_total"),
            jobs_submitted_total: counter!("scheduler_jobs_submitted_total"),
            jobs_collected_total: counter!("scheduler_jobs_collected_total"),
            jobs_failed_total: counter!("scheduler_jobs_failed_total"),
            active_jobs: gauge!("scheduler_active_jobs"),
            remote_failures_total: counter!("scheduler_remote_failures_total"),
            remote_call_duration: histogram!("scheduler_remote_call_duration_seconds"),
            pass_duration: histogram!("scheduler_pass_duration_seconds"),
            passes_total: counter!("scheduler_passes_total"),
        })
    }

    pub fn record_task_created(&self) {
        self.tasks_created_total.increment(1);
    }

    pub fn record_task_placed(&self, host: &str) {
        self.tasks_placed_total.increment(1);
        counter!("scheduler_tasks_placed_by_host_total", "host" => host.to_string()).increment(1);
    }

    pub fn record_placement_skipped(&self, reason: &str) {
        self.placements_skipped_total.increment(1);
        debug!(reason = reason, "Placement skipped");
    }

    pub fn record_task_completed(&self) {
        self.tasks_completed_total.increment(1);
    }

    pub fn record_task_failed(&self, error_type: &str) {
        self.tasks_failed_total.increment(1);
        counter!("scheduler_task_failures_by_type_total", "error_type" => error_type.to_string())
            .increment(1);
    }

    pub fn record_job_submitted(&self, host: &str) {
        self.jobs_submitted_total.increment(1);
        counter!("scheduler_jobs_submitted_by_host_total", "host" => host.to_string()).increment(1);
    }

    pub fn record_job_collected(&self) {
        self.jobs_collected_total.increment(1);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed_total.increment(1);
    }

    pub fn update_active_jobs(&self, count: usize) {
        self.active_jobs.set(count as f64);
    }

    pub fn record_remote_call(&self, operation: &str, duration_seconds: f64, success: bool) {
        self.remote_call_duration.record(duration_seconds);
        if !success {
            self.remote_failures_total.increment(1);
            counter!("scheduler_remote_failures_by_operation_total", "operation" => operation.to_string())
                .increment(1);
        }
    }

    pub fn record_pass(&self, duration_seconds: f64) {
        self.passes_total.increment(1);
        self.pass_duration.record(duration_seconds);
    }
}
