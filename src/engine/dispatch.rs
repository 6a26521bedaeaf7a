//! Dispatch loop — moves queued tasks onto worker slots and settles attempts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::TaskEngine;
use crate::engine::state::{DispatchTicket, Outbox};
use crate::registry::{TaskContext, TaskProcessor};
use crate::task::TaskStatus;

/// Result of one attempt, before it is applied to the task.
pub(crate) enum AttemptOutcome {
    Success(Value),
    Failure(String),
}

/// Spawn the dispatch loop.
///
/// The loop holds one semaphore permit per in-flight attempt; when all
/// workers are busy it parks on the semaphore, and when the queue is empty
/// it parks on the queue wake with a poll-interval fallback.
pub(crate) fn spawn_dispatch_loop(engine: Arc<TaskEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(max_workers = engine.config.max_workers, "Dispatch loop started");
        loop {
            if !engine.accepting() {
                break;
            }
            let permit = match engine.worker_slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                // Semaphore closes on shutdown.
                Err(_) => break,
            };

            if !dispatch_one(&engine, permit).await {
                tokio::select! {
                    _ = engine.queue_wake.notified() => {}
                    _ = tokio::time::sleep(engine.config.poll_interval) => {}
                }
            }
        }
        info!("Dispatch loop stopped");
    })
}

/// Try to dispatch one task. Returns false when nothing was runnable
/// (the permit is released so the loop can park).
async fn dispatch_one(engine: &Arc<TaskEngine>, permit: OwnedSemaphorePermit) -> bool {
    let (ticket, outbox) = {
        let mut state = engine.state.write().await;
        let mut outbox = Outbox::default();
        let ticket = state.next_dispatch(&mut outbox);
        (ticket, outbox)
    };
    engine.deliver(outbox).await;

    let Some(ticket) = ticket else {
        drop(permit);
        return false;
    };

    let Some(processor) = engine.registry.get(&ticket.task_type).await else {
        drop(permit);
        engine.fail_unknown_type(ticket).await;
        return true;
    };

    debug!(
        task_id = %ticket.task_id,
        task_type = %ticket.task_type,
        attempt = ticket.attempt,
        "Dispatching task"
    );

    let task_id = ticket.task_id.clone();
    let handle = tokio::spawn(run_attempt(Arc::clone(engine), ticket, processor, permit));

    // Park the handle for shutdown. The attempt may have settled already,
    // in which case its running entry is gone and the handle can drop.
    let mut state = engine.state.write().await;
    if let Some(running) = state.running.get_mut(&task_id) {
        running.handle = Some(handle);
    }
    true
}

/// Run one attempt to completion, under the task's timeout.
///
/// The processor runs on its own spawn so a panic is contained and
/// reported as a failed attempt rather than taking down the dispatcher.
async fn run_attempt(
    engine: Arc<TaskEngine>,
    ticket: DispatchTicket,
    processor: Arc<dyn TaskProcessor>,
    permit: OwnedSemaphorePermit,
) {
    let started = Instant::now();
    let ctx = TaskContext::new(
        ticket.task_id.clone(),
        ticket.job_id,
        ticket.attempt,
        ticket.cancelled.clone(),
    );
    let payload = ticket.payload.clone();
    let mut attempt = tokio::spawn(async move { processor.process(payload, &ctx).await });

    let outcome = match tokio::time::timeout(ticket.timeout, &mut attempt).await {
        Ok(Ok(Ok(value))) => AttemptOutcome::Success(value),
        Ok(Ok(Err(e))) => AttemptOutcome::Failure(format!("{e:#}")),
        Ok(Err(join_err)) => AttemptOutcome::Failure(format!("processor panicked: {join_err}")),
        Err(_) => {
            attempt.abort();
            AttemptOutcome::Failure(format!("timeout after {:?}", ticket.timeout))
        }
    };

    settle_attempt(&engine, &ticket, outcome, started.elapsed()).await;
    drop(permit);
}

/// Apply an attempt's outcome to the task and fan out the consequences.
async fn settle_attempt(
    engine: &Arc<TaskEngine>,
    ticket: &DispatchTicket,
    outcome: AttemptOutcome,
    elapsed: Duration,
) {
    let mut requeue_after: Option<Duration> = None;
    let outbox = {
        let mut state = engine.state.write().await;
        let mut outbox = Outbox::default();
        state.running.remove(&ticket.task_id);

        let Some(task) = state.tasks.get(&ticket.task_id) else {
            return;
        };
        if task.status == TaskStatus::Cancelled {
            // Cancelled mid-flight; the outcome is discarded.
            debug!(task_id = %ticket.task_id, "Discarding result of cancelled task");
            return;
        }

        engine.stats.record_attempt(elapsed);
        match outcome {
            AttemptOutcome::Success(value) => {
                let ok = {
                    let Some(task) = state.tasks.get_mut(&ticket.task_id) else {
                        return;
                    };
                    match task.transition_to(TaskStatus::Completed) {
                        Ok(()) => {
                            task.result = Some(value);
                            task.error = None;
                            true
                        }
                        Err(reason) => {
                            error!(task_id = %ticket.task_id, %reason, "Completion refused");
                            false
                        }
                    }
                };
                if ok {
                    engine.stats.record_task_completed();
                    debug!(
                        task_id = %ticket.task_id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Task completed"
                    );
                    state.note_task_update(&ticket.task_id, &mut outbox);
                    state.on_task_completed(&ticket.task_id, &mut outbox);
                }
            }
            AttemptOutcome::Failure(message) => {
                let auto_retry = state
                    .jobs
                    .get(&ticket.job_id)
                    .map(|job| job.auto_retry_failed)
                    .unwrap_or(false);
                let retry = {
                    let Some(task) = state.tasks.get_mut(&ticket.task_id) else {
                        return;
                    };
                    if let Err(reason) = task.transition_to(TaskStatus::Failed) {
                        error!(task_id = %ticket.task_id, %reason, "Failure refused");
                        return;
                    }
                    task.error = Some(message.clone());
                    task.result = None;

                    let retry = auto_retry && task.retry_count < task.max_retries;
                    if retry {
                        task.retry_count += 1;
                        if let Err(reason) = task.transition_to(TaskStatus::Queued) {
                            error!(task_id = %ticket.task_id, %reason, "Retry requeue refused");
                        }
                    }
                    retry
                };
                state.note_task_update(&ticket.task_id, &mut outbox);

                if retry {
                    let retry_count = state
                        .tasks
                        .get(&ticket.task_id)
                        .map(|t| t.retry_count)
                        .unwrap_or(1);
                    let delay = engine.retry_delay(retry_count);
                    warn!(
                        task_id = %ticket.task_id,
                        retry = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Task failed, retrying"
                    );
                    engine.stats.record_task_retried();
                    requeue_after = Some(delay);
                } else {
                    warn!(task_id = %ticket.task_id, error = %message, "Task failed");
                    let doomed = state.on_terminal_failure(&ticket.task_id, &mut outbox);
                    engine.stats.record_task_failed();
                    for _ in &doomed {
                        engine.stats.record_task_failed();
                    }
                }
            }
        }
        outbox
    };
    engine.deliver(outbox).await;
    engine.queue_wake.notify_one();

    if let Some(delay) = requeue_after {
        let engine = Arc::clone(engine);
        let task_id = ticket.task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = engine.state.write().await;
            let Some(task) = state.tasks.get(&task_id) else {
                return;
            };
            // Cancelled (or cleaned up) while backing off: leave it be.
            if task.status != TaskStatus::Queued {
                return;
            }
            let priority = task.priority;
            state.queue.push(task_id, priority);
            drop(state);
            engine.queue_wake.notify_one();
        });
    }
}

impl TaskEngine {
    /// Fail a dispatched task that has no registered processor. Does not
    /// consume a retry.
    async fn fail_unknown_type(&self, ticket: DispatchTicket) {
        warn!(
            task_id = %ticket.task_id,
            task_type = %ticket.task_type,
            "No processor registered for task type"
        );
        let outbox = {
            let mut state = self.state.write().await;
            let mut outbox = Outbox::default();
            state.running.remove(&ticket.task_id);

            let failed = {
                let Some(task) = state.tasks.get_mut(&ticket.task_id) else {
                    return;
                };
                match task.transition_to(TaskStatus::Failed) {
                    Ok(()) => {
                        task.error = Some(format!("unknown task type: {}", ticket.task_type));
                        true
                    }
                    Err(reason) => {
                        // Lost a race with cancel; nothing to record.
                        debug!(task_id = %ticket.task_id, %reason, "Skipping unknown-type failure");
                        false
                    }
                }
            };
            if failed {
                state.note_task_update(&ticket.task_id, &mut outbox);
                let doomed = state.on_terminal_failure(&ticket.task_id, &mut outbox);
                self.stats.record_task_failed();
                for _ in &doomed {
                    self.stats.record_task_failed();
                }
            }
            outbox
        };
        self.deliver(outbox).await;
        self.queue_wake.notify_one();
    }

    /// Exponential backoff with jitter for the n-th retry.
    fn retry_delay(&self, retry_number: u32) -> Duration {
        let base = self.config.retry_backoff.as_millis() as u64;
        let shift = retry_number.saturating_sub(1).min(16);
        let exponential = base.saturating_mul(1u64 << shift);
        let capped = exponential.min(self.config.retry_backoff_cap.as_millis() as u64);
        let jittered = (capped as f64 * rand::thread_rng().gen_range(0.8..1.2)) as u64;
        Duration::from_millis(jittered.max(1))
    }
}
