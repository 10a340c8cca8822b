use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{RwLock, RwLockWriteGuard};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{JobError, QueueError, Result};
use crate::grpc::{GrpcResourceClient, ResourceClient};
use crate::persist::{JobDb, Snapshot};
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::keeper::KeeperHandle;
use crate::scheduler::manager::ResourceManager;
use crate::scheduler::pool::{Resource, ResourceStatus};
use crate::scheduler::state::{QueueState, QueueStatus};
use crate::tls::TlsIdentity;
use crate::tool::Tool;

pub(crate) struct QueueInner {
    pub(crate) config: QueueConfig,
    pub(crate) state: RwLock<QueueState>,
    keeper: std::sync::Mutex<Option<KeeperHandle>>,
    managers: RwLock<BTreeMap<String, Arc<dyn ResourceManager>>>,
    store: Option<Arc<JobDb>>,
    tls: Option<TlsIdentity>,
}

/// The central scheduler: ordered backlog, resource pool and keeper.
///
/// Cloning is cheap and every clone drives the same queue. Mutating
/// operations take the write lock for their whole duration, including the
/// RPCs they issue; queries take the read lock and return copies.
#[derive(Clone)]
pub struct Queue {
    pub(crate) inner: Arc<QueueInner>,
}

impl Queue {
    /// Build a queue, restoring the snapshot at `config.state_file` if any.
    ///
    /// Restored jobs and resources are all marked `Quit`: connections do not
    /// survive a restart and nothing resumes without an operator.
    pub async fn new(config: QueueConfig) -> Result<Self> {
        let tls = TlsIdentity::from_config(&config.tls).await?;
        let store = match &config.job_db {
            Some(path) => Some(Arc::new(JobDb::open(path)?)),
            None => None,
        };

        let mut state = QueueState::new(config.purge_after);
        if let Some(path) = &config.state_file {
            if let Some(snapshot) = Snapshot::load(path).await? {
                tracing::info!(
                    path = %path.display(),
                    jobs = snapshot.stack.len(),
                    resources = snapshot.pool.len(),
                    "Restoring queue from snapshot"
                );
                snapshot.restore_into(&mut state);
            }
        }

        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                state: RwLock::new(state),
                keeper: std::sync::Mutex::new(None),
                managers: RwLock::new(BTreeMap::new()),
                store,
                tls,
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<QueueInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    fn start_keeper(&self) {
        let mut keeper = self
            .inner
            .keeper
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if keeper.is_none() {
            *keeper = Some(KeeperHandle::spawn(
                Arc::downgrade(&self.inner),
                self.inner.config.keeper_interval,
            ));
        }
    }

    /// Detach and signal the keeper. Must be called with the queue write
    /// lock held; await [`KeeperHandle::join`] after releasing it.
    fn take_keeper(&self, _state: &RwLockWriteGuard<'_, QueueState>) -> Option<KeeperHandle> {
        let handle = self
            .inner
            .keeper
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = &handle {
            handle.cancel();
        }
        handle
    }

    pub(crate) async fn persist(&self, state: &QueueState) {
        if let Some(path) = &self.inner.config.state_file {
            let snapshot = Snapshot::capture(state);
            match snapshot.save(path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Snapshot written"),
                Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to write snapshot"),
            }
        }
        if let Some(store) = &self.inner.store {
            let store = Arc::clone(store);
            let jobs = state.stack.to_vec();
            match tokio::task::spawn_blocking(move || store.sync(&jobs)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Failed to mirror jobs into the job store"),
                Err(e) => tracing::error!(error = %e, "Job store sync task ended abnormally"),
            }
        }
    }

    pub(crate) fn forget(&self, ids: &[Uuid]) {
        let Some(store) = &self.inner.store else {
            return;
        };
        for id in ids {
            if let Err(e) = store.delete(id) {
                tracing::error!(job_id = %id, error = %e, "Failed to delete job record");
            }
        }
    }

    /// Queue a job. On an idle queue the job is started right away on the
    /// first running resource with a free slot for its tool, and the keeper
    /// is started.
    ///
    /// A job no resource can take stays queued. A start RPC that fails
    /// marks the job failed and returns the error.
    pub async fn add_job(&self, job: Job) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let job_id = job.id;
        let tool_id = job.tool_id;
        if state.stack.get(&job_id).is_some() {
            return Err(QueueError::DuplicateJob(job_id));
        }

        if let Some(store) = &self.inner.store {
            store.add(&job)?;
        }
        tracing::info!(job_id = %job_id, name = %job.name, tool_id = %tool_id, "Job added");
        state.stack.push(job);

        if !matches!(state.status, QueueStatus::Empty | QueueStatus::Exhausted) {
            return Ok(());
        }
        self.start_keeper();

        let Some(resource_id) = state.pool.find_free_for(&tool_id) else {
            tracing::debug!(job_id = %job_id, "No free resource for job, leaving it queued");
            return Ok(());
        };

        if let Err(e) = state.start_job(&job_id, &resource_id).await {
            tracing::error!(job_id = %job_id, resource_id = %resource_id, error = %e, "Failed to start job");
            state.fail_job(&job_id, &e.to_string());
            return Err(e);
        }
        state.status = QueueStatus::Running;
        Ok(())
    }

    pub async fn pause_job(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.inner.state.write().await;
        state.pause_job(&job_id).await
    }

    pub async fn quit_job(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.inner.state.write().await;
        state.quit_job(&job_id).await
    }

    /// Delete a job, quitting it first if it is placed and unfinished.
    pub async fn remove_job(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let status = state
            .stack
            .get(&job_id)
            .map(|j| j.status)
            .ok_or(QueueError::JobNotFound(job_id))?;

        if matches!(status, JobStatus::Running | JobStatus::Paused) {
            state.quit_job(&job_id).await?;
        }

        state.stack.remove(&job_id);
        self.forget(&[job_id]);
        tracing::info!(job_id = %job_id, "Job removed");
        Ok(())
    }

    /// Pause every job running on a resource, then mark it paused. Jobs
    /// whose pause failed are reported and left as they were.
    pub async fn pause_resource(&self, resource_id: Uuid) -> Result<Vec<JobError>> {
        let mut state = self.inner.state.write().await;
        let resource = state
            .pool
            .get(&resource_id)
            .ok_or(QueueError::ResourceNotFound(resource_id))?;
        if resource.status != ResourceStatus::Running {
            return Err(QueueError::InvalidResourceState {
                id: resource_id,
                status: resource.status.to_string(),
                expected: "running",
            });
        }

        let running: Vec<Uuid> = state
            .stack
            .jobs_for_resource(&resource_id)
            .into_iter()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.id)
            .collect();

        let mut errors = Vec::new();
        for job_id in running {
            if let Err(error) = state.pause_job(&job_id).await {
                tracing::warn!(job_id = %job_id, error = %error, "Failed to pause job on resource");
                errors.push(JobError { job_id, error });
            }
        }

        if let Some(resource) = state.pool.get_mut(&resource_id) {
            resource.status = ResourceStatus::Paused;
        }
        tracing::info!(resource_id = %resource_id, failures = errors.len(), "Resource paused");
        Ok(errors)
    }

    /// Make a paused resource available again. The keeper does the placing.
    pub async fn resume_resource(&self, resource_id: Uuid) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let resource = state
            .pool
            .get_mut(&resource_id)
            .ok_or(QueueError::ResourceNotFound(resource_id))?;
        if resource.status != ResourceStatus::Paused {
            return Err(QueueError::InvalidResourceState {
                id: resource_id,
                status: resource.status.to_string(),
                expected: "paused",
            });
        }
        resource.status = ResourceStatus::Running;
        tracing::info!(resource_id = %resource_id, "Resource resumed");
        Ok(())
    }

    /// Stop the keeper and pause every running job.
    ///
    /// A job whose pause RPC fails is marked `Failed` and its error is
    /// returned alongside the others.
    pub async fn pause_queue(&self) -> Result<Vec<JobError>> {
        let keeper = {
            let mut state = self.inner.state.write().await;
            if state.status == QueueStatus::Paused {
                return Err(QueueError::InvalidQueueState(state.status.to_string()));
            }
            state.status = QueueStatus::Paused;
            self.take_keeper(&state)
        };
        if let Some(keeper) = keeper {
            keeper.join().await;
        }

        self.keep_managers().await;

        let mut state = self.inner.state.write().await;
        self.persist(&state).await;
        let purged = state.refresh_status().await;
        self.forget(&purged);

        let mut errors = Vec::new();
        for job_id in state.stack.ids_with_status(JobStatus::Running) {
            if let Err(error) = state.pause_job(&job_id).await {
                state.fail_job(&job_id, &error.to_string());
                errors.push(JobError { job_id, error });
            }
        }

        tracing::info!(failures = errors.len(), "Queue paused");
        Ok(errors)
    }

    pub async fn resume_queue(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        if state.status != QueueStatus::Paused {
            return Err(QueueError::InvalidQueueState(state.status.to_string()));
        }
        state.status = QueueStatus::Running;
        self.start_keeper();
        tracing::info!("Queue resumed");
        Ok(())
    }

    /// Rebuild the stack in `order`, which must name every queued job
    /// exactly once. The queue is paused around the change unless it
    /// already was; pause errors are returned but do not block the reorder.
    pub async fn stack_reorder(&self, order: Vec<Uuid>) -> Result<Vec<JobError>> {
        let was_paused = {
            let state = self.inner.state.read().await;
            state
                .stack
                .validate_order(&order)
                .map_err(QueueError::ReorderMismatch)?;
            state.status == QueueStatus::Paused
        };

        let errors = if was_paused {
            Vec::new()
        } else {
            self.pause_queue().await?
        };

        let reordered = {
            let mut state = self.inner.state.write().await;
            let result = state.stack.reorder(&order);
            if result.is_ok() {
                if let Some(store) = &self.inner.store {
                    if let Err(e) = store.reorder(&order) {
                        tracing::error!(error = %e, "Failed to reorder job records");
                    }
                }
            }
            result
        };

        if !was_paused {
            self.resume_queue().await?;
        }

        reordered.map_err(QueueError::ReorderMismatch)?;
        tracing::info!(jobs = order.len(), "Stack reordered");
        Ok(errors)
    }

    /// Shut the queue down: stop the keeper, quit every placed unfinished
    /// job, drop every connection and empty the pool.
    ///
    /// Quit failures are logged only. Returns the final stack.
    pub async fn quit(&self) -> Vec<Job> {
        let keeper = {
            let state = self.inner.state.write().await;
            self.take_keeper(&state)
        };
        if let Some(keeper) = keeper {
            keeper.join().await;
        }

        let mut state = self.inner.state.write().await;
        let purged = state.refresh_status().await;
        self.forget(&purged);

        for job_id in state.stack.ids() {
            let placed = state
                .stack
                .get(&job_id)
                .is_some_and(|j| matches!(j.status, JobStatus::Running | JobStatus::Paused));
            if !placed {
                continue;
            }
            if let Err(e) = state.quit_job(&job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to quit job during shutdown");
            }
        }

        for resource in state.pool.iter_mut() {
            resource.disconnect();
        }
        state.pool.clear();
        state.status = QueueStatus::Empty;
        self.persist(&state).await;

        tracing::info!(jobs = state.stack.len(), "Queue quit");
        state.stack.to_vec()
    }

    // ---- resources ----

    /// Register a new resource in `Pending`. Names must be unique among
    /// resources that are not retired.
    pub async fn add_resource(
        &self,
        manager: &str,
        name: &str,
        parameters: BTreeMap<String, String>,
    ) -> Result<Uuid> {
        let mut state = self.inner.state.write().await;
        if state.pool.name_in_use(name) {
            return Err(QueueError::DuplicateResource(name.to_string()));
        }
        let mut resource = Resource::new(name, manager);
        resource.parameters = parameters;
        let id = resource.id;
        state.pool.insert(resource);
        tracing::info!(resource_id = %id, name, manager, "Resource added");
        Ok(id)
    }

    /// Attach a live connection to a resource and load its hardware (all
    /// slots free) and tools. A retired resource cannot be reconnected.
    pub async fn connect_resource(
        &self,
        resource_id: Uuid,
        client: Arc<dyn ResourceClient>,
    ) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let resource = state
            .pool
            .get(&resource_id)
            .ok_or(QueueError::ResourceNotFound(resource_id))?;
        if resource.status == ResourceStatus::Quit {
            return Err(QueueError::InvalidResourceState {
                id: resource_id,
                status: resource.status.to_string(),
                expected: "not quit",
            });
        }

        let hardware = client.hardware().await?;
        let tools = client.tools().await?;

        state.pool.load_hardware(&resource_id, hardware)?;
        state.pool.load_tools(&resource_id, tools)?;
        if let Some(resource) = state.pool.get_mut(&resource_id) {
            resource.set_client(client);
            if resource.status == ResourceStatus::Pending {
                resource.status = ResourceStatus::Running;
            }
        }
        state.reoccupy(&resource_id);

        tracing::info!(resource_id = %resource_id, "Resource connected");
        Ok(())
    }

    /// Dial `address` over gRPC and connect the resource through it.
    pub async fn connect_remote(
        &self,
        resource_id: Uuid,
        address: &str,
        auth_token: &str,
    ) -> Result<()> {
        let client = GrpcResourceClient::connect(
            address,
            auth_token,
            &self.inner.config,
            self.inner.tls.as_ref(),
        )
        .await?;

        {
            let mut state = self.inner.state.write().await;
            let resource = state
                .pool
                .get_mut(&resource_id)
                .ok_or(QueueError::ResourceNotFound(resource_id))?;
            resource.address = address.to_string();
        }
        self.connect_resource(resource_id, Arc::new(client)).await
    }

    /// Ping a resource with a random nonce and check the squared reply.
    pub async fn check_resource(&self, resource_id: Uuid) -> Result<()> {
        let client = {
            let state = self.inner.state.read().await;
            state
                .pool
                .get(&resource_id)
                .ok_or(QueueError::ResourceNotFound(resource_id))?
                .client()?
        };

        let nonce: i64 = rand::thread_rng().gen_range(1..3_000_000_000);
        let reply = client.ping(nonce).await?;
        if reply != nonce.wrapping_mul(nonce) {
            tracing::error!(resource_id = %resource_id, nonce, reply, "Ping returned the wrong value");
            return Err(QueueError::PingMismatch(resource_id));
        }
        Ok(())
    }

    /// Retire a resource: quit its placed jobs, close the connection and
    /// mark it `Quit`. The record stays for reference.
    pub async fn remove_resource(&self, resource_id: Uuid) -> Result<()> {
        let mut state = self.inner.state.write().await;
        if state.pool.get(&resource_id).is_none() {
            return Err(QueueError::ResourceNotFound(resource_id));
        }

        let placed: Vec<Uuid> = state
            .stack
            .jobs_for_resource(&resource_id)
            .into_iter()
            .filter(|j| matches!(j.status, JobStatus::Running | JobStatus::Paused))
            .map(|j| j.id)
            .collect();

        for job_id in placed {
            if let Err(e) = state.quit_job(&job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to quit job on removed resource");
                state.fail_job(&job_id, &format!("resource removed: {}", e));
            }
        }

        if let Some(resource) = state.pool.get_mut(&resource_id) {
            resource.retire();
        }
        tracing::info!(resource_id = %resource_id, "Resource removed");
        Ok(())
    }

    // ---- resource managers ----

    pub async fn add_resource_manager(&self, manager: Arc<dyn ResourceManager>) -> Result<()> {
        let mut managers = self.inner.managers.write().await;
        let name = manager.system_name().to_string();
        if managers.contains_key(&name) {
            return Err(QueueError::DuplicateManager(name));
        }
        tracing::info!(manager = %name, "Resource manager registered");
        managers.insert(name, manager);
        Ok(())
    }

    pub async fn resource_manager(&self, system_name: &str) -> Option<Arc<dyn ResourceManager>> {
        self.inner.managers.read().await.get(system_name).cloned()
    }

    pub async fn resource_managers(&self) -> Vec<Arc<dyn ResourceManager>> {
        self.inner.managers.read().await.values().cloned().collect()
    }

    /// Provision a resource through the manager registered as `system_name`.
    pub async fn add_managed_resource(
        &self,
        system_name: &str,
        name: &str,
        address: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Uuid> {
        let manager = self
            .resource_manager(system_name)
            .await
            .ok_or_else(|| QueueError::ManagerNotFound(system_name.to_string()))?;
        manager.add_resource(name, address, params).await
    }

    /// Run every manager's `keep`. Never called with the queue lock held,
    /// since managers call back into the queue.
    pub(crate) async fn keep_managers(&self) {
        for manager in self.resource_managers().await {
            manager.keep().await;
        }
    }

    // ---- queries ----

    pub async fn status(&self) -> QueueStatus {
        self.inner.state.read().await.status
    }

    pub async fn all_jobs(&self) -> Vec<Job> {
        self.inner.state.read().await.stack.to_vec()
    }

    pub async fn job(&self, job_id: Uuid) -> Option<Job> {
        self.inner.state.read().await.stack.get(&job_id).cloned()
    }

    pub async fn jobs_by_resource(&self, resource_id: Uuid) -> Vec<Job> {
        self.inner
            .state
            .read()
            .await
            .stack
            .jobs_for_resource(&resource_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn all_resources(&self) -> Vec<Resource> {
        self.inner.state.read().await.pool.iter().cloned().collect()
    }

    pub async fn resource(&self, resource_id: Uuid) -> Option<Resource> {
        self.inner.state.read().await.pool.get(&resource_id).cloned()
    }

    pub async fn active_tools(&self) -> BTreeMap<Uuid, Tool> {
        self.inner.state.read().await.pool.active_tools()
    }

    pub async fn all_tools(&self) -> BTreeMap<Uuid, Tool> {
        self.inner.state.read().await.pool.all_tools()
    }

    pub async fn hardware_types(&self) -> BTreeSet<String> {
        self.inner.state.read().await.pool.hardware_types()
    }

    /// Run one keeper tick now, outside the schedule.
    pub async fn keep_now(&self) {
        self.keep(&tokio_util::sync::CancellationToken::new()).await;
    }

    /// Write the snapshot and mirror the job store immediately.
    pub async fn save(&self) {
        let state = self.inner.state.read().await;
        self.persist(&state).await;
    }
}
