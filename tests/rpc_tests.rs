//! The resource service over a real tonic server on an ephemeral port.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use cracklord::config::{DispatcherConfig, QueueConfig};
use cracklord::grpc::server::ResourceServer;
use cracklord::grpc::messages::TaskRequest;
use cracklord::grpc::{GrpcResourceClient, ResourceClient};
use cracklord::proto::resource_service_client::ResourceServiceClient;
use cracklord::scheduler::{Job, JobStatus, Queue};
use cracklord::tool::timer::TimerTool;
use cracklord::tool::Tooler;
use cracklord::worker::{Dispatcher, AUTH_FAILED};

const TOKEN: &str = "s3cret";

struct TestResource {
    addr: SocketAddr,
    cpu_tool: uuid::Uuid,
    shutdown: CancellationToken,
}

impl Drop for TestResource {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_resource() -> TestResource {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let cpu = Arc::new(TimerTool::cpu(Duration::from_millis(10)));
    let cpu_tool = cpu.id();
    let dispatcher = Dispatcher::new(TOKEN)
        .with_tool(cpu)
        .with_tool(Arc::new(TimerTool::gpu(Duration::from_millis(10))));
    let config = DispatcherConfig {
        listen_addr: addr,
        auth_token: TOKEN.to_string(),
        ..DispatcherConfig::default()
    };

    let shutdown = CancellationToken::new();
    let server = ResourceServer::new(config, Arc::new(dispatcher));
    tokio::spawn(server.run_with_listener(listener, shutdown.clone()));

    TestResource {
        addr,
        cpu_tool,
        shutdown,
    }
}

async fn client(resource: &TestResource, token: &str) -> GrpcResourceClient {
    GrpcResourceClient::connect(
        &resource.addr.to_string(),
        token,
        &QueueConfig::default(),
        None,
    )
    .await
    .unwrap()
}

fn timer_job(tool_id: uuid::Uuid, seconds: &str) -> Job {
    Job::new(tool_id, "timer", "tester", BTreeMap::new())
        .with_parameter("seconds", seconds)
        .with_parameter("result", "Success")
}

#[tokio::test]
async fn ping_needs_no_token() {
    let resource = start_resource().await;
    let client = client(&resource, "wrong").await;
    assert_eq!(client.ping(12).await.unwrap(), 144);
    assert_eq!(client.ping(3_000_000_000).await.unwrap(), 3_000_000_000i64.wrapping_mul(3_000_000_000));
}

#[tokio::test]
async fn bad_token_is_rejected_with_fixed_message() {
    let resource = start_resource().await;
    let client = client(&resource, "wrong").await;

    let status = client.hardware().await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
    assert_eq!(status.message(), AUTH_FAILED);

    let status = client
        .add_task(&timer_job(resource.cpu_tool, "1"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
}

#[tokio::test]
async fn bad_token_wins_over_a_malformed_request() {
    let resource = start_resource().await;
    let mut raw = ResourceServiceClient::connect(format!("http://{}", resource.addr))
        .await
        .unwrap();

    let request = || TaskRequest {
        auth_token: "wrong".to_string(),
        job: None,
    };
    let status = raw.task_status(request()).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
    assert_eq!(status.message(), AUTH_FAILED);
    let status = raw.add_task(request()).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);

    // With the right token the missing job is what gets reported.
    let status = raw
        .task_quit(TaskRequest {
            auth_token: TOKEN.to_string(),
            job: None,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn hardware_and_tools_are_advertised() {
    let resource = start_resource().await;
    let client = client(&resource, TOKEN).await;

    let hardware = client.hardware().await.unwrap();
    assert_eq!(hardware.keys().cloned().collect::<Vec<_>>(), vec!["cpu", "gpu"]);
    assert!(hardware.values().all(|free| *free));

    let tools = client.tools().await.unwrap();
    assert_eq!(tools.len(), 2);
    assert!(tools.iter().any(|t| t.id == resource.cpu_tool && t.requirement == "cpu"));
}

#[tokio::test]
async fn task_lifecycle_over_the_wire() {
    let resource = start_resource().await;
    let client = client(&resource, TOKEN).await;
    let job = timer_job(resource.cpu_tool, "1000");

    let started = client.add_task(&job).await.unwrap();
    assert_eq!(started.id, job.id);
    assert_eq!(started.status, JobStatus::Running);
    assert!(started.start_time.is_some());

    let paused = client.task_pause(&job).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    let resumed = client.task_run(&job).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Running);

    let quit = client.task_quit(&job).await.unwrap();
    assert_eq!(quit.status, JobStatus::Quit);
    let status = client.task_status(&job).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn unknown_tool_is_not_found() {
    let resource = start_resource().await;
    let client = client(&resource, TOKEN).await;
    let status = client
        .add_task(&timer_job(uuid::Uuid::new_v4(), "1"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn queue_drives_a_remote_job_to_completion() {
    let resource = start_resource().await;
    let queue = Queue::new(QueueConfig::default()).await.unwrap();
    let id = queue
        .add_resource("test", "r1", BTreeMap::new())
        .await
        .unwrap();
    queue
        .connect_remote(id, &resource.addr.to_string(), TOKEN)
        .await
        .unwrap();
    queue.check_resource(id).await.unwrap();
    assert_eq!(queue.hardware_types().await.len(), 2);

    let job = timer_job(resource.cpu_tool, "3");
    let job_id = job.id;
    queue.add_job(job).await.unwrap();
    assert_eq!(queue.job(job_id).await.unwrap().status, JobStatus::Running);

    let mut status = JobStatus::Running;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.keep_now().await;
        status = queue.job(job_id).await.unwrap().status;
        if status != JobStatus::Running {
            break;
        }
    }
    assert_eq!(status, JobStatus::Done);
    let done = queue.job(job_id).await.unwrap();
    assert_eq!(done.cracked_count, 3);
    assert_eq!(done.progress, 100.0);
}
