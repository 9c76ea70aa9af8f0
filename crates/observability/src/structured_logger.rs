use tracing::{debug, error, info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_created(task_id: i64, entity_id: i64, module: &str, priority: i32, merged: bool) {
        info!(
            event = "task_created",
            task.id = task_id,
            task.entity_id = entity_id,
            task.module = module,
            task.priority = priority,
            task.merged = merged,
            "Task created"
        );
    }

    pub fn log_task_placed(task_id: i64, job_id: i64, allocation: &str, host: &str, nodes: u32) {
        info!(
            event = "task_placed",
            task.id = task_id,
            job.id = job_id,
            allocation.name = allocation,
            host.name = host,
            job.nodes = nodes,
            "Task placed as a new job"
        );
    }

    pub fn log_placement_skipped(task_id: i64, reason: &str) {
        debug!(
            event = "placement_skipped",
            task.id = task_id,
            placement.reason = reason,
            "No placement for task in this pass"
        );
    }

    pub fn log_task_state_change(task_id: i64, from: &str, to: &str) {
        info!(
            event = "task_state_change",
            task.id = task_id,
            task.from = from,
            task.to = to,
            "Task state changed"
        );
    }

    pub fn log_task_failed(task_id: i64, module: &str, reason: &str) {
        error!(
            event = "task_failed",
            task.id = task_id,
            task.module = module,
            task.error = reason,
            "Task failed"
        );
    }

    pub fn log_job_submitted(job_id: i64, task_id: i64, queue_id: &str, host: &str) {
        info!(
            event = "job_submitted",
            job.id = job_id,
            task.id = task_id,
            job.queue_id = queue_id,
            host.name = host,
            "Job submitted to remote queue"
        );
    }

    pub fn log_job_submit_skipped(job_id: i64, host: &str) {
        debug!(
            event = "job_submit_skipped",
            job.id = job_id,
            host.name = host,
            "Host inactive, job left in ready state"
        );
    }

    pub fn log_job_collected(job_id: i64, task_id: i64, run_path: &str) {
        info!(
            event = "job_collected",
            job.id = job_id,
            task.id = task_id,
            job.run_path = run_path,
            "Job results collected"
        );
    }

    pub fn log_job_failed(job_id: i64, task_id: i64, reason: &str) {
        warn!(
            event = "job_failed",
            job.id = job_id,
            task.id = task_id,
            job.error = reason,
            "Job marked as failed"
        );
    }

    pub fn log_remote_call_failed(operation: &str, host: &str, error_message: &str) {
        warn!(
            event = "remote_call_failed",
            remote.operation = operation,
            host.name = host,
            remote.error = error_message,
            "Remote call failed, will retry next pass"
        );
    }

    pub fn log_allocation_misconfigured(task_id: i64, allocation: &str, error_message: &str) {
        error!(
            event = "allocation_misconfigured",
            task.id = task_id,
            allocation.name = allocation,
            error.message = error_message,
            "Allocation misconfigured, operator action required"
        );
    }

    pub fn log_pass_complete(
        submitted: usize,
        collected: usize,
        placed: usize,
        skipped: usize,
        errors: usize,
        duration_ms: u64,
    ) {
        info!(
            event = "pass_complete",
            pass.submitted = submitted,
            pass.collected = collected,
            pass.placed = placed,
            pass.skipped = skipped,
            pass.errors = errors,
            pass.duration_ms = duration_ms,
            "Scheduling pass completed"
        );
    }

    pub fn log_system_event(event_type: &str, component: &str, details: &str) {
        info!(
            event = "system_event",
            system.event_type = event_type,
            system.component = component,
            system.details = details,
            "System event occurred"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_logger_without_subscriber() {
        StructuredLogger::log_task_created(1, 42, "static", 12, false);
        StructuredLogger::log_task_placed(1, 7, "b1004", "quest", 2);
        StructuredLogger::log_placement_skipped(1, "no schedulable project");
        StructuredLogger::log_task_state_change(1, "ready", "running");
        StructuredLogger::log_job_submitted(7, 1, "1001", "quest");
        StructuredLogger::log_job_collected(7, 1, "/scratch/42_static");
        StructuredLogger::log_remote_call_failed("list_running", "quest", "timeout");
        StructuredLogger::log_pass_complete(1, 1, 1, 0, 0, 12);
    }
}
