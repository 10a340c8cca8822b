//! Periodic reconciliation of the queue.
//!
//! Each tick runs under the write lock: snapshot, refresh running jobs,
//! then fill free hardware slots from the front of the stack. A stop
//! request is only observed between ticks.

use std::sync::Weak;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::job::JobStatus;
use crate::scheduler::pool::ResourceStatus;
use crate::scheduler::queue::{Queue, QueueInner};
use crate::scheduler::state::{is_transient, QueueState, QueueStatus};

pub(crate) struct KeeperHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl KeeperHandle {
    pub(crate) fn spawn(queue: Weak<QueueInner>, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(queue, interval, stop.clone()));
        Self { stop, task }
    }

    /// Signal the loop. Call while holding the queue lock so a waiting tick
    /// sees the signal as soon as it gets the lock.
    pub(crate) fn cancel(&self) {
        self.stop.cancel();
    }

    pub(crate) async fn join(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Keeper task ended abnormally");
        }
    }
}

async fn run(queue: Weak<QueueInner>, interval: Duration, stop: CancellationToken) {
    tracing::info!(interval_ms = interval.as_millis() as u64, "Keeper started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = queue.upgrade() else {
            break;
        };
        Queue::from_inner(inner).keep(&stop).await;
    }
    tracing::info!("Keeper stopped");
}

impl Queue {
    /// One keeper tick.
    pub(crate) async fn keep(&self, stop: &CancellationToken) {
        self.keep_managers().await;

        let mut state = self.inner.state.write().await;
        if stop.is_cancelled() {
            return;
        }
        tracing::debug!(jobs = state.stack.len(), "Keeper tick");

        self.persist(&state).await;
        let purged = state.refresh_status().await;
        self.forget(&purged);

        // A paused queue only tracks what is already running.
        if state.status == QueueStatus::Paused {
            return;
        }
        state.fill_free_slots().await;
        state.status = if state.stack.has_running() {
            QueueStatus::Running
        } else {
            QueueStatus::Exhausted
        };
    }
}

impl QueueState {
    /// Ask each resource for the state of its running jobs and free the
    /// slots of jobs that stopped. Returns ids of purged jobs.
    pub(crate) async fn refresh_status(&mut self) -> Vec<Uuid> {
        for job_id in self.stack.ids_with_status(JobStatus::Running) {
            let Some(job) = self.stack.get_mut(&job_id) else {
                continue;
            };
            let Some(resource_id) = job.assigned_resource else {
                continue;
            };
            let Some(resource) = self.pool.get_mut(&resource_id) else {
                tracing::warn!(job_id = %job_id, resource_id = %resource_id, "Running job on unknown resource");
                continue;
            };
            let client = match resource.client() {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Cannot refresh job status");
                    continue;
                }
            };

            match client.task_status(job).await {
                Ok(remote) => {
                    job.absorb(remote);
                    if job.status != JobStatus::Running {
                        resource.release_for_tool(&job.tool_id);
                        Self::stamp_finished(self.purge_after, job);
                        tracing::info!(job_id = %job_id, status = %job.status, "Job finished");
                    }
                }
                Err(status) if status.code() == tonic::Code::NotFound => {
                    resource.release_for_tool(&job.tool_id);
                    job.fail(format!("task lost by resource: {}", status.message()));
                    Self::stamp_finished(self.purge_after, job);
                    tracing::warn!(job_id = %job_id, resource_id = %resource_id, "Resource no longer knows the job");
                }
                Err(status) => {
                    tracing::warn!(job_id = %job_id, resource_id = %resource_id, error = %status, "Status refresh failed");
                }
            }
        }

        let purged = self.stack.purge_expired(Utc::now());
        for id in &purged {
            tracing::info!(job_id = %id, "Purged finished job");
        }
        purged
    }

    /// Give every free slot of every running resource the first job that
    /// fits it: a `Created` job whose tool the resource offers, or a
    /// `Paused` job placed on this very resource.
    pub(crate) async fn fill_free_slots(&mut self) {
        for resource_id in self.pool.ids() {
            let free: Vec<String> = match self.pool.get(&resource_id) {
                Some(r) if r.status == ResourceStatus::Running && r.is_connected() => r
                    .hardware
                    .iter()
                    .filter(|(_, free)| **free)
                    .map(|(tag, _)| tag.clone())
                    .collect(),
                _ => continue,
            };

            for tag in free {
                let Some((job_id, status)) = self.next_for_slot(&resource_id, &tag) else {
                    continue;
                };

                let result = match status {
                    JobStatus::Created => self.start_job(&job_id, &resource_id).await,
                    _ => self.resume_job(&job_id).await,
                };

                if let Err(e) = result {
                    if is_transient(&e) {
                        tracing::warn!(job_id = %job_id, resource_id = %resource_id, error = %e, "Could not place job, will retry");
                    } else {
                        self.fail_job(&job_id, &e.to_string());
                    }
                }
            }
        }
    }

    fn next_for_slot(&self, resource_id: &Uuid, tag: &str) -> Option<(Uuid, JobStatus)> {
        let resource = self.pool.get(resource_id)?;
        self.stack
            .iter()
            .find(|job| {
                let fits = resource
                    .tool_for(&job.tool_id)
                    .is_some_and(|tool| tool.requirement == tag);
                match job.status {
                    JobStatus::Created => fits,
                    JobStatus::Paused => job.assigned_resource == Some(*resource_id) && fits,
                    _ => false,
                }
            })
            .map(|job| (job.id, job.status))
    }
}
