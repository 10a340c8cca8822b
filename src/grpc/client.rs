use std::collections::BTreeMap;
use std::sync::Arc;

use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::grpc::messages::{AuthRequest, PingRequest, TaskRequest};
use crate::proto::resource_service_client::ResourceServiceClient;
use crate::scheduler::job::Job;
use crate::tls::TlsIdentity;
use crate::tool::Tool;
use crate::worker::Dispatcher;

/// The calls the queue makes against one resource.
///
/// Each value wraps a single persistent connection. Calls return the job as
/// the resource sees it.
#[tonic::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn ping(&self, nonce: i64) -> std::result::Result<i64, Status>;
    async fn hardware(&self) -> std::result::Result<BTreeMap<String, bool>, Status>;
    async fn tools(&self) -> std::result::Result<Vec<Tool>, Status>;
    async fn add_task(&self, job: &Job) -> std::result::Result<Job, Status>;
    async fn task_status(&self, job: &Job) -> std::result::Result<Job, Status>;
    async fn task_pause(&self, job: &Job) -> std::result::Result<Job, Status>;
    async fn task_run(&self, job: &Job) -> std::result::Result<Job, Status>;
    async fn task_quit(&self, job: &Job) -> std::result::Result<Job, Status>;
}

/// gRPC client over one tonic channel.
///
/// Every call is bounded by the configured RPC timeout, since the queue
/// holds its lock while waiting.
#[derive(Clone)]
pub struct GrpcResourceClient {
    inner: ResourceServiceClient<Channel>,
    auth_token: String,
}

impl GrpcResourceClient {
    pub async fn connect(
        address: &str,
        auth_token: impl Into<String>,
        config: &QueueConfig,
        tls: Option<&TlsIdentity>,
    ) -> Result<Self> {
        let uri = config.resource_uri(address);
        let mut endpoint = Endpoint::from_shared(uri.clone())?
            .timeout(config.rpc_timeout)
            .connect_timeout(config.connect_timeout);
        if let Some(tls) = tls {
            endpoint = endpoint.tls_config(tls.client_tls_config())?;
        }

        let channel = endpoint.connect().await?;
        tracing::info!(uri = %uri, "Connected to resource");

        Ok(Self {
            inner: ResourceServiceClient::new(channel),
            auth_token: auth_token.into(),
        })
    }

    fn auth(&self) -> AuthRequest {
        AuthRequest {
            auth_token: self.auth_token.clone(),
        }
    }

    fn task(&self, job: &Job) -> TaskRequest {
        TaskRequest::new(&self.auth_token, job)
    }
}

#[tonic::async_trait]
impl ResourceClient for GrpcResourceClient {
    async fn ping(&self, nonce: i64) -> std::result::Result<i64, Status> {
        let mut client = self.inner.clone();
        let response = client.ping(PingRequest { nonce }).await?;
        Ok(response.into_inner().value)
    }

    async fn hardware(&self) -> std::result::Result<BTreeMap<String, bool>, Status> {
        let mut client = self.inner.clone();
        let response = client.resource_hardware(self.auth()).await?;
        Ok(response.into_inner().hardware.into_iter().collect())
    }

    async fn tools(&self) -> std::result::Result<Vec<Tool>, Status> {
        let mut client = self.inner.clone();
        let response = client.resource_tools(self.auth()).await?;
        response
            .into_inner()
            .tools
            .into_iter()
            .map(Tool::try_from)
            .collect()
    }

    async fn add_task(&self, job: &Job) -> std::result::Result<Job, Status> {
        let mut client = self.inner.clone();
        let response = client.add_task(self.task(job)).await?;
        Job::try_from(response.into_inner())
    }

    async fn task_status(&self, job: &Job) -> std::result::Result<Job, Status> {
        let mut client = self.inner.clone();
        let response = client.task_status(self.task(job)).await?;
        Job::try_from(response.into_inner())
    }

    async fn task_pause(&self, job: &Job) -> std::result::Result<Job, Status> {
        let mut client = self.inner.clone();
        let response = client.task_pause(self.task(job)).await?;
        Job::try_from(response.into_inner())
    }

    async fn task_run(&self, job: &Job) -> std::result::Result<Job, Status> {
        let mut client = self.inner.clone();
        let response = client.task_run(self.task(job)).await?;
        Job::try_from(response.into_inner())
    }

    async fn task_quit(&self, job: &Job) -> std::result::Result<Job, Status> {
        let mut client = self.inner.clone();
        let response = client.task_quit(self.task(job)).await?;
        Job::try_from(response.into_inner())
    }
}

/// In-process client for a dispatcher living in the same binary.
#[derive(Clone)]
pub struct LocalResourceClient {
    dispatcher: Arc<Dispatcher>,
    auth_token: String,
}

impl LocalResourceClient {
    pub fn new(dispatcher: Arc<Dispatcher>, auth_token: impl Into<String>) -> Self {
        Self {
            dispatcher,
            auth_token: auth_token.into(),
        }
    }
}

#[tonic::async_trait]
impl ResourceClient for LocalResourceClient {
    async fn ping(&self, nonce: i64) -> std::result::Result<i64, Status> {
        Ok(self.dispatcher.ping(nonce))
    }

    async fn hardware(&self) -> std::result::Result<BTreeMap<String, bool>, Status> {
        Ok(self.dispatcher.hardware(&self.auth_token)?)
    }

    async fn tools(&self) -> std::result::Result<Vec<Tool>, Status> {
        Ok(self.dispatcher.tools(&self.auth_token)?)
    }

    async fn add_task(&self, job: &Job) -> std::result::Result<Job, Status> {
        Ok(self
            .dispatcher
            .add_task(&self.auth_token, job.clone())
            .await?)
    }

    async fn task_status(&self, job: &Job) -> std::result::Result<Job, Status> {
        Ok(self.dispatcher.task_status(&self.auth_token, job.id).await?)
    }

    async fn task_pause(&self, job: &Job) -> std::result::Result<Job, Status> {
        Ok(self.dispatcher.task_pause(&self.auth_token, job.id).await?)
    }

    async fn task_run(&self, job: &Job) -> std::result::Result<Job, Status> {
        Ok(self.dispatcher.task_run(&self.auth_token, job.id).await?)
    }

    async fn task_quit(&self, job: &Job) -> std::result::Result<Job, Status> {
        Ok(self.dispatcher.task_quit(&self.auth_token, job.id).await?)
    }
}
