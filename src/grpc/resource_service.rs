use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::grpc::messages::{
    AuthRequest, HardwareResponse, JobMessage, PingRequest, PingResponse, TaskRequest,
    ToolMessage, ToolsResponse,
};
use crate::proto::resource_service_server::ResourceService;
use crate::scheduler::Job;
use crate::worker::Dispatcher;

/// gRPC face of a [`Dispatcher`].
pub struct ResourceRpc {
    dispatcher: Arc<Dispatcher>,
}

impl ResourceRpc {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Reject a bad token before the job payload is decoded.
    fn authorized(&self, request: Request<TaskRequest>) -> Result<(String, Job), Status> {
        let req = request.into_inner();
        self.dispatcher.check_auth(&req.auth_token)?;
        req.into_parts()
    }
}

#[tonic::async_trait]
impl ResourceService for ResourceRpc {
    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        let nonce = request.into_inner().nonce;
        Ok(Response::new(PingResponse {
            value: self.dispatcher.ping(nonce),
        }))
    }

    async fn resource_hardware(
        &self,
        request: Request<AuthRequest>,
    ) -> Result<Response<HardwareResponse>, Status> {
        let req = request.into_inner();
        let hardware = self.dispatcher.hardware(&req.auth_token)?;
        Ok(Response::new(HardwareResponse {
            hardware: hardware.into_iter().collect(),
        }))
    }

    async fn resource_tools(
        &self,
        request: Request<AuthRequest>,
    ) -> Result<Response<ToolsResponse>, Status> {
        let req = request.into_inner();
        let tools = self.dispatcher.tools(&req.auth_token)?;
        Ok(Response::new(ToolsResponse {
            tools: tools.iter().map(ToolMessage::from).collect(),
        }))
    }

    async fn add_task(&self, request: Request<TaskRequest>) -> Result<Response<JobMessage>, Status> {
        let (token, job) = self.authorized(request)?;
        let job = self.dispatcher.add_task(&token, job).await?;
        Ok(Response::new(JobMessage::from(&job)))
    }

    async fn task_status(
        &self,
        request: Request<TaskRequest>,
    ) -> Result<Response<JobMessage>, Status> {
        let (token, job) = self.authorized(request)?;
        let job = self.dispatcher.task_status(&token, job.id).await?;
        Ok(Response::new(JobMessage::from(&job)))
    }

    async fn task_pause(
        &self,
        request: Request<TaskRequest>,
    ) -> Result<Response<JobMessage>, Status> {
        let (token, job) = self.authorized(request)?;
        let job = self.dispatcher.task_pause(&token, job.id).await?;
        Ok(Response::new(JobMessage::from(&job)))
    }

    async fn task_run(&self, request: Request<TaskRequest>) -> Result<Response<JobMessage>, Status> {
        let (token, job) = self.authorized(request)?;
        let job = self.dispatcher.task_run(&token, job.id).await?;
        Ok(Response::new(JobMessage::from(&job)))
    }

    async fn task_quit(&self, request: Request<TaskRequest>) -> Result<Response<JobMessage>, Status> {
        let (token, job) = self.authorized(request)?;
        let job = self.dispatcher.task_quit(&token, job.id).await?;
        Ok(Response::new(JobMessage::from(&job)))
    }
}
