use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::scheduler::{Job, JobStatus, Queue, Resource};

#[derive(Serialize)]
struct QueueStatusResponse {
    status: String,
    jobs: usize,
    running_jobs: usize,
    resources: usize,
    hardware: Vec<String>,
}

#[derive(Serialize)]
struct JobResponse {
    id: String,
    name: String,
    owner: String,
    tool_id: String,
    status: String,
    assigned_resource: Option<String>,
    progress: f64,
    cracked_count: i64,
    total_count: i64,
    start_time: Option<String>,
    purge_time: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct JobDetailResponse {
    #[serde(flatten)]
    summary: JobResponse,
    parameters: std::collections::BTreeMap<String, String>,
    performance_title: String,
    performance: std::collections::BTreeMap<String, String>,
    output_titles: Vec<String>,
    output_rows: Vec<Vec<String>>,
}

#[derive(Serialize)]
struct ResourceResponse {
    id: String,
    name: String,
    address: String,
    manager: String,
    status: String,
    connected: bool,
    hardware: std::collections::BTreeMap<String, bool>,
    tools: Vec<String>,
}

#[derive(Serialize)]
struct ToolResponse {
    id: String,
    name: String,
    kind: String,
    version: String,
    requirement: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.name.clone(),
            owner: job.owner.clone(),
            tool_id: job.tool_id.to_string(),
            status: job.status.to_string(),
            assigned_resource: job.assigned_resource.map(|id| id.to_string()),
            progress: job.progress,
            cracked_count: job.cracked_count,
            total_count: job.total_count,
            start_time: job.start_time.map(|t| t.to_rfc3339()),
            purge_time: job.purge_time.map(|t| t.to_rfc3339()),
            error: job.error.clone(),
        }
    }
}

impl From<&Resource> for ResourceResponse {
    fn from(resource: &Resource) -> Self {
        Self {
            id: resource.id.to_string(),
            name: resource.name.clone(),
            address: resource.address.clone(),
            manager: resource.manager.clone(),
            status: resource.status.to_string(),
            connected: resource.is_connected(),
            hardware: resource.hardware.clone(),
            tools: resource.tools.values().map(|t| t.name.clone()).collect(),
        }
    }
}

/// Read-only JSON view of a queue.
pub fn router(queue: Queue) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/queue", get(queue_status_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/resources", get(list_resources_handler))
        .route("/api/tools", get(list_tools_handler))
        .layer(cors)
        .with_state(queue)
}

pub async fn run_dashboard(addr: SocketAddr, queue: Queue, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(queue))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn queue_status_handler(State(queue): State<Queue>) -> impl IntoResponse {
    let jobs = queue.all_jobs().await;
    Json(QueueStatusResponse {
        status: queue.status().await.to_string(),
        jobs: jobs.len(),
        running_jobs: jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count(),
        resources: queue.all_resources().await.len(),
        hardware: queue.hardware_types().await.into_iter().collect(),
    })
}

async fn list_jobs_handler(State(queue): State<Queue>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = queue.all_jobs().await.iter().map(JobResponse::from).collect();
    Json(jobs)
}

async fn get_job_handler(
    State(queue): State<Queue>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Invalid job ID format".to_string(),
            }),
        )
            .into_response();
    };

    match queue.job(id).await {
        Some(job) => Json(JobDetailResponse {
            summary: JobResponse::from(&job),
            parameters: job.parameters,
            performance_title: job.performance_title,
            performance: job.performance,
            output_titles: job.output_titles,
            output_rows: job.output_rows,
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Job not found: {}", id),
            }),
        )
            .into_response(),
    }
}

async fn list_resources_handler(State(queue): State<Queue>) -> impl IntoResponse {
    let resources: Vec<ResourceResponse> = queue
        .all_resources()
        .await
        .iter()
        .map(ResourceResponse::from)
        .collect();
    Json(resources)
}

async fn list_tools_handler(State(queue): State<Queue>) -> impl IntoResponse {
    let tools: Vec<ToolResponse> = queue
        .active_tools()
        .await
        .into_values()
        .map(|t| ToolResponse {
            id: t.id.to_string(),
            name: t.name,
            kind: t.kind,
            version: t.version,
            requirement: t.requirement,
        })
        .collect();
    Json(tools)
}
