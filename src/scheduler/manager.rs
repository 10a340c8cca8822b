use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::scheduler::pool::{Resource, ResourceStatus};
use crate::scheduler::queue::{Queue, QueueInner};

/// A backend that provisions resources and hands them to the queue.
///
/// All resource lifecycle changes go through a manager. `keep` runs once
/// per keeper tick, before the queue lock is taken, so implementations may
/// call back into the queue.
#[tonic::async_trait]
pub trait ResourceManager: Send + Sync {
    /// Key used by the queue; must be URL-safe.
    fn system_name(&self) -> &str;
    fn display_name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the parameters `add_resource` expects.
    fn parameters(&self) -> String;

    async fn add_resource(
        &self,
        name: &str,
        address: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Uuid>;
    async fn delete_resource(&self, resource_id: Uuid) -> Result<()>;
    async fn get_resource(&self, resource_id: Uuid)
        -> Result<(Resource, BTreeMap<String, String>)>;
    async fn update_resource(
        &self,
        resource_id: Uuid,
        status: ResourceStatus,
        params: BTreeMap<String, String>,
    ) -> Result<()>;
    async fn managed_resources(&self) -> Vec<Uuid>;
    async fn keep(&self);
}

/// Manager for resources reached at a fixed address with a shared token.
///
/// `keep` pings every managed resource and reconnects the ones that stopped
/// answering.
pub struct DirectManager {
    queue: Weak<QueueInner>,
    auth_token: String,
    resources: RwLock<BTreeMap<Uuid, BTreeMap<String, String>>>,
}

pub const DIRECT_MANAGER: &str = "direct";

impl DirectManager {
    pub fn new(queue: &Queue, auth_token: impl Into<String>) -> Self {
        Self {
            queue: Arc::downgrade(&queue.inner),
            auth_token: auth_token.into(),
            resources: RwLock::new(BTreeMap::new()),
        }
    }

    fn queue(&self) -> Result<Queue> {
        self.queue
            .upgrade()
            .map(Queue::from_inner)
            .ok_or_else(|| QueueError::InvalidQueueState("shut down".to_string()))
    }
}

#[tonic::async_trait]
impl ResourceManager for DirectManager {
    fn system_name(&self) -> &str {
        DIRECT_MANAGER
    }

    fn display_name(&self) -> &str {
        "Direct Connect"
    }

    fn description(&self) -> &str {
        "Resources reached directly at a fixed address"
    }

    fn parameters(&self) -> String {
        r#"{"form":["address"],"schema":{"type":"object","properties":{"address":{"title":"Address","type":"string"}},"required":["address"]}}"#.to_string()
    }

    async fn add_resource(
        &self,
        name: &str,
        address: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Uuid> {
        let queue = self.queue()?;
        let id = queue.add_resource(DIRECT_MANAGER, name, params.clone()).await?;
        self.resources.write().await.insert(id, params);

        if let Err(e) = queue.connect_remote(id, address, &self.auth_token).await {
            tracing::error!(resource_id = %id, address, error = %e, "Could not connect to resource");
            queue.remove_resource(id).await?;
            self.resources.write().await.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    async fn delete_resource(&self, resource_id: Uuid) -> Result<()> {
        let queue = self.queue()?;
        if self.resources.write().await.remove(&resource_id).is_none() {
            return Err(QueueError::ResourceNotFound(resource_id));
        }
        queue.remove_resource(resource_id).await
    }

    async fn get_resource(
        &self,
        resource_id: Uuid,
    ) -> Result<(Resource, BTreeMap<String, String>)> {
        let params = self
            .resources
            .read()
            .await
            .get(&resource_id)
            .cloned()
            .ok_or(QueueError::ResourceNotFound(resource_id))?;
        let queue = self.queue()?;
        let resource = queue
            .resource(resource_id)
            .await
            .ok_or(QueueError::ResourceNotFound(resource_id))?;
        Ok((resource, params))
    }

    async fn update_resource(
        &self,
        resource_id: Uuid,
        status: ResourceStatus,
        params: BTreeMap<String, String>,
    ) -> Result<()> {
        let queue = self.queue()?;
        {
            let mut resources = self.resources.write().await;
            let current = resources
                .get_mut(&resource_id)
                .ok_or(QueueError::ResourceNotFound(resource_id))?;
            *current = params;
        }

        match status {
            ResourceStatus::Paused => {
                for failure in queue.pause_resource(resource_id).await? {
                    tracing::warn!(job_id = %failure.job_id, error = %failure.error, "Job not paused");
                }
                Ok(())
            }
            ResourceStatus::Running => queue.resume_resource(resource_id).await,
            ResourceStatus::Quit => self.delete_resource(resource_id).await,
            ResourceStatus::Pending => Err(QueueError::InvalidResourceState {
                id: resource_id,
                status: status.to_string(),
                expected: "running, paused or quit",
            }),
        }
    }

    async fn managed_resources(&self) -> Vec<Uuid> {
        self.resources.read().await.keys().copied().collect()
    }

    async fn keep(&self) {
        let Ok(queue) = self.queue() else {
            return;
        };
        for resource_id in self.managed_resources().await {
            let Some(resource) = queue.resource(resource_id).await else {
                continue;
            };
            if resource.status == ResourceStatus::Quit {
                continue;
            }
            if let Err(e) = queue.check_resource(resource_id).await {
                tracing::warn!(resource_id = %resource_id, error = %e, "Resource not answering, reconnecting");
                if let Err(e) = queue
                    .connect_remote(resource_id, &resource.address, &self.auth_token)
                    .await
                {
                    tracing::error!(resource_id = %resource_id, error = %e, "Reconnect failed");
                }
            }
        }
    }
}
