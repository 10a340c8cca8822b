use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::pool::{Resource, ResourcePool, ResourceStatus};
use crate::scheduler::stack::JobStack;
use crate::scheduler::state::{QueueState, QueueStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub stack: Vec<Job>,
    pub pool: BTreeMap<Uuid, Resource>,
}

impl Snapshot {
    pub(crate) fn capture(state: &QueueState) -> Self {
        Self {
            stack: state.stack.to_vec(),
            pool: state.pool.to_map(),
        }
    }

    /// Write atomically: a sibling temp file is renamed over `path`.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Read a snapshot; a missing file is not an error.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Install into a fresh queue state. Unfinished jobs become `Quit` and
    /// every resource is retired without a connection.
    pub(crate) fn restore_into(self, state: &mut QueueState) {
        let mut jobs = self.stack;
        for job in &mut jobs {
            if !job.status.is_terminal() {
                tracing::info!(job_id = %job.id, status = %job.status, "Recovered job marked quit");
                job.status = JobStatus::Quit;
            }
            QueueState::stamp_finished(state.purge_after, job);
        }

        let mut pool = self.pool;
        for resource in pool.values_mut() {
            resource.status = ResourceStatus::Quit;
            for slot in resource.hardware.values_mut() {
                *slot = false;
            }
        }

        state.stack = JobStack::from_jobs(jobs);
        state.pool = ResourcePool::from_resources(pool);
        state.status = QueueStatus::Empty;
    }
}
