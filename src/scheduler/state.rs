//! State guarded by the queue lock and the RPC-backed job transitions.
//!
//! Everything here runs with the write lock held, so one job never has two
//! calls in flight and slot bookkeeping moves together with job status.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::pool::ResourcePool;
use crate::scheduler::stack::JobStack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    /// No job has been started since the queue was created or quit.
    Empty,
    Running,
    Paused,
    /// The keeper found nothing running and nothing it could start.
    Exhausted,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::Empty => write!(f, "empty"),
            QueueStatus::Running => write!(f, "running"),
            QueueStatus::Paused => write!(f, "paused"),
            QueueStatus::Exhausted => write!(f, "exhausted"),
        }
    }
}

pub(crate) struct QueueState {
    pub(crate) status: QueueStatus,
    pub(crate) stack: JobStack,
    pub(crate) pool: ResourcePool,
    pub(crate) purge_after: Option<Duration>,
}

fn not_found(id: &Uuid) -> QueueError {
    QueueError::JobNotFound(*id)
}

fn assigned(job: &Job) -> Result<Uuid> {
    job.assigned_resource.ok_or(QueueError::InvalidJobState {
        id: job.id,
        status: job.status,
        expected: "assigned to a resource",
    })
}

/// Errors after which a job may simply be tried again later.
pub(crate) fn is_transient(err: &QueueError) -> bool {
    match err {
        QueueError::Rpc(status) => matches!(
            status.code(),
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Cancelled
        ),
        QueueError::Transport(_) | QueueError::Disconnected(_) => true,
        _ => false,
    }
}

impl QueueState {
    pub(crate) fn new(purge_after: Option<Duration>) -> Self {
        Self {
            status: QueueStatus::Empty,
            stack: JobStack::new(),
            pool: ResourcePool::new(),
            purge_after,
        }
    }

    /// Give a finished job its purge deadline.
    pub(crate) fn stamp_finished(purge_after: Option<Duration>, job: &mut Job) {
        if !job.status.is_terminal() || job.purge_time.is_some() {
            return;
        }
        if let Some(after) = purge_after.and_then(|d| chrono::Duration::from_std(d).ok()) {
            job.purge_time = Some(Utc::now() + after);
        }
    }

    /// Start a `Created` job on `resource_id`.
    ///
    /// The job is sent with the tool id local to the resource, and keeps
    /// that id once the resource accepted it.
    pub(crate) async fn start_job(&mut self, job_id: &Uuid, resource_id: &Uuid) -> Result<()> {
        let job = self.stack.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if job.status != JobStatus::Created {
            return Err(QueueError::InvalidJobState {
                id: job.id,
                status: job.status,
                expected: "created",
            });
        }
        let resource = self
            .pool
            .get_mut(resource_id)
            .ok_or(QueueError::ResourceNotFound(*resource_id))?;
        let tool = resource
            .tool_for(&job.tool_id)
            .ok_or(QueueError::ToolMismatch(job.tool_id))?;
        let (local_id, requirement) = (tool.id, tool.requirement.clone());
        let client = resource.client()?;

        let mut outgoing = job.clone();
        outgoing.tool_id = local_id;
        let remote = client.add_task(&outgoing).await?;

        job.absorb(remote);
        job.tool_id = local_id;
        job.assigned_resource = Some(*resource_id);
        if job.status == JobStatus::Running {
            resource.occupy(&requirement);
        }
        Self::stamp_finished(self.purge_after, job);

        tracing::info!(
            job_id = %job_id,
            resource_id = %resource_id,
            tool_id = %local_id,
            status = %job.status,
            "Job started"
        );
        Ok(())
    }

    /// Resume a `Paused` job on the resource it was placed on.
    pub(crate) async fn resume_job(&mut self, job_id: &Uuid) -> Result<()> {
        let job = self.stack.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if job.status != JobStatus::Paused {
            return Err(QueueError::InvalidJobState {
                id: job.id,
                status: job.status,
                expected: "paused",
            });
        }
        let resource_id = assigned(job)?;
        let resource = self
            .pool
            .get_mut(&resource_id)
            .ok_or(QueueError::ResourceNotFound(resource_id))?;
        let requirement = resource
            .tool_for(&job.tool_id)
            .map(|t| t.requirement.clone())
            .ok_or(QueueError::ToolMismatch(job.tool_id))?;
        let client = resource.client()?;

        let remote = client.task_run(job).await?;
        job.absorb(remote);
        if job.status == JobStatus::Running {
            resource.occupy(&requirement);
        }
        Self::stamp_finished(self.purge_after, job);

        tracing::info!(job_id = %job_id, resource_id = %resource_id, "Job resumed");
        Ok(())
    }

    /// Pause a running job. An RPC failure leaves local state untouched.
    pub(crate) async fn pause_job(&mut self, job_id: &Uuid) -> Result<()> {
        let job = self.stack.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if job.status != JobStatus::Running {
            return Err(QueueError::InvalidJobState {
                id: job.id,
                status: job.status,
                expected: "running",
            });
        }
        let resource_id = assigned(job)?;
        let resource = self
            .pool
            .get_mut(&resource_id)
            .ok_or(QueueError::ResourceNotFound(resource_id))?;
        let client = resource.client()?;

        let remote = client.task_pause(job).await?;
        job.absorb(remote);
        if job.status != JobStatus::Running {
            resource.release_for_tool(&job.tool_id);
        }
        Self::stamp_finished(self.purge_after, job);

        tracing::info!(job_id = %job_id, resource_id = %resource_id, status = %job.status, "Job paused");
        Ok(())
    }

    /// Quit a job that has not finished. A job never placed is quit locally.
    pub(crate) async fn quit_job(&mut self, job_id: &Uuid) -> Result<()> {
        let job = self.stack.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if job.status.is_terminal() {
            return Err(QueueError::InvalidJobState {
                id: job.id,
                status: job.status,
                expected: "not finished",
            });
        }

        if job.status == JobStatus::Created {
            job.status = JobStatus::Quit;
            Self::stamp_finished(self.purge_after, job);
            tracing::info!(job_id = %job_id, "Queued job quit");
            return Ok(());
        }

        let resource_id = assigned(job)?;
        let resource = self
            .pool
            .get_mut(&resource_id)
            .ok_or(QueueError::ResourceNotFound(resource_id))?;
        let client = resource.client()?;
        let was_running = job.status == JobStatus::Running;

        let remote = client.task_quit(job).await?;
        job.absorb(remote);
        if !job.status.is_terminal() {
            job.status = JobStatus::Quit;
        }
        if was_running {
            resource.release_for_tool(&job.tool_id);
        }
        Self::stamp_finished(self.purge_after, job);

        tracing::info!(job_id = %job_id, resource_id = %resource_id, "Job quit");
        Ok(())
    }

    /// Mark a job failed locally, freeing its slot if it held one.
    pub(crate) fn fail_job(&mut self, job_id: &Uuid, error: &str) {
        let Some(job) = self.stack.get_mut(job_id) else {
            return;
        };
        if job.status == JobStatus::Running {
            if let Some(resource) = job
                .assigned_resource
                .and_then(|rid| self.pool.get_mut(&rid))
            {
                resource.release_for_tool(&job.tool_id);
            }
        }
        job.fail(error);
        Self::stamp_finished(self.purge_after, job);
        tracing::warn!(job_id = %job_id, error, "Job marked failed");
    }

    /// Re-mark slots busy for jobs still running on `resource_id`, after its
    /// hardware was reloaded as all free.
    pub(crate) fn reoccupy(&mut self, resource_id: &Uuid) {
        let Some(resource) = self.pool.get_mut(resource_id) else {
            return;
        };
        for job in self.stack.jobs_for_resource(resource_id) {
            if job.status == JobStatus::Running {
                if let Some(requirement) = resource.tool_for(&job.tool_id).map(|t| t.requirement.clone())
                {
                    resource.occupy(&requirement);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(is_transient(&QueueError::Rpc(tonic::Status::unavailable("x"))));
        assert!(is_transient(&QueueError::Disconnected(Uuid::nil())));
        assert!(!is_transient(&QueueError::Rpc(tonic::Status::not_found("x"))));
        assert!(!is_transient(&QueueError::ToolMismatch(Uuid::nil())));
    }

    #[test]
    fn stamp_finished_sets_purge_once() {
        let mut job = Job::new(Uuid::new_v4(), "j", "o", BTreeMap::new());
        QueueState::stamp_finished(Some(Duration::from_secs(60)), &mut job);
        assert!(job.purge_time.is_none());

        job.status = JobStatus::Done;
        QueueState::stamp_finished(Some(Duration::from_secs(60)), &mut job);
        let first = job.purge_time;
        assert!(first.is_some());
        QueueState::stamp_finished(Some(Duration::from_secs(3600)), &mut job);
        assert_eq!(job.purge_time, first);
    }

    #[tokio::test]
    async fn quitting_a_queued_job_needs_no_resource() {
        let mut state = QueueState::new(None);
        let job = Job::new(Uuid::new_v4(), "j", "o", BTreeMap::new());
        let id = job.id;
        state.stack.push(job);

        state.quit_job(&id).await.unwrap();
        assert_eq!(state.stack.get(&id).unwrap().status, JobStatus::Quit);
        assert!(matches!(
            state.quit_job(&id).await,
            Err(QueueError::InvalidJobState { .. })
        ));
    }

    #[tokio::test]
    async fn pause_requires_running() {
        let mut state = QueueState::new(None);
        let job = Job::new(Uuid::new_v4(), "j", "o", BTreeMap::new());
        let id = job.id;
        state.stack.push(job);
        let err = state.pause_job(&id).await.unwrap_err();
        assert!(err.is_validation());
        assert!(matches!(
            state.pause_job(&Uuid::new_v4()).await,
            Err(QueueError::JobNotFound(_))
        ));
    }
}
