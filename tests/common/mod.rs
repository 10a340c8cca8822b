//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tonic::Status;
use uuid::Uuid;

use cracklord::config::QueueConfig;
use cracklord::grpc::ResourceClient;
use cracklord::scheduler::{Job, JobStatus, Queue};
use cracklord::tool::Tool;

pub fn tool(name: &str, requirement: &str) -> Tool {
    Tool {
        id: Uuid::new_v4(),
        name: name.to_string(),
        kind: "Test".to_string(),
        version: "1.0".to_string(),
        requirement: requirement.to_string(),
        parameters: "{}".to_string(),
    }
}

pub fn job(tool_id: Uuid, name: &str) -> Job {
    Job::new(tool_id, name, "tester", BTreeMap::new())
}

#[derive(Default)]
struct Script {
    calls: Vec<String>,
    jobs: HashMap<Uuid, Job>,
    failures: HashMap<&'static str, Status>,
    bad_ping: bool,
}

/// A resource that answers from memory and can be told to fail.
///
/// Tasks move through states exactly as asked; [`ScriptedClient::finish`]
/// stands in for a task completing on its own.
pub struct ScriptedClient {
    hardware: BTreeMap<String, bool>,
    tools: Vec<Tool>,
    script: Mutex<Script>,
}

impl ScriptedClient {
    pub fn new(tools: Vec<Tool>) -> Arc<Self> {
        let hardware = tools
            .iter()
            .map(|t| (t.requirement.clone(), true))
            .collect();
        Arc::new(Self {
            hardware,
            tools,
            script: Mutex::new(Script::default()),
        })
    }

    /// Make every later call of `method` fail with `status`.
    pub fn fail(&self, method: &'static str, status: Status) {
        self.script.lock().unwrap().failures.insert(method, status);
    }

    pub fn heal(&self, method: &'static str) {
        self.script.lock().unwrap().failures.remove(method);
    }

    pub fn answer_ping_wrong(&self) {
        self.script.lock().unwrap().bad_ping = true;
    }

    /// Mark a task as ended with `status`, as if the tool finished it.
    pub fn finish(&self, job_id: Uuid, status: JobStatus) {
        if let Some(job) = self.script.lock().unwrap().jobs.get_mut(&job_id) {
            job.status = status;
            job.progress = 100.0;
        }
    }

    /// Drop a task, as a restarted resource would.
    pub fn lose(&self, job_id: Uuid) {
        self.script.lock().unwrap().jobs.remove(&job_id);
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| *c == method).count()
    }

    pub fn task(&self, job_id: Uuid) -> Option<Job> {
        self.script.lock().unwrap().jobs.get(&job_id).cloned()
    }

    fn record(&self, method: &'static str) -> Result<(), Status> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(method.to_string());
        match script.failures.get(method) {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }

    fn transition(&self, job_id: Uuid, status: JobStatus) -> Result<Job, Status> {
        let mut script = self.script.lock().unwrap();
        let job = script
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Status::not_found("task not found"))?;
        if !job.status.is_terminal() {
            job.status = status;
        }
        Ok(job.clone())
    }
}

#[tonic::async_trait]
impl ResourceClient for ScriptedClient {
    async fn ping(&self, nonce: i64) -> Result<i64, Status> {
        self.record("ping")?;
        let square = nonce.wrapping_mul(nonce);
        if self.script.lock().unwrap().bad_ping {
            return Ok(square.wrapping_add(1));
        }
        Ok(square)
    }

    async fn hardware(&self) -> Result<BTreeMap<String, bool>, Status> {
        self.record("hardware")?;
        Ok(self.hardware.clone())
    }

    async fn tools(&self) -> Result<Vec<Tool>, Status> {
        self.record("tools")?;
        Ok(self.tools.clone())
    }

    async fn add_task(&self, job: &Job) -> Result<Job, Status> {
        self.record("add_task")?;
        if !self.tools.iter().any(|t| t.id == job.tool_id) {
            return Err(Status::not_found("no such tool"));
        }
        let mut remote = job.clone();
        remote.status = JobStatus::Running;
        remote.start_time = Some(Utc::now());
        self.script
            .lock()
            .unwrap()
            .jobs
            .insert(job.id, remote.clone());
        Ok(remote)
    }

    async fn task_status(&self, job: &Job) -> Result<Job, Status> {
        self.record("task_status")?;
        self.script
            .lock()
            .unwrap()
            .jobs
            .get(&job.id)
            .cloned()
            .ok_or_else(|| Status::not_found("task not found"))
    }

    async fn task_pause(&self, job: &Job) -> Result<Job, Status> {
        self.record("task_pause")?;
        self.transition(job.id, JobStatus::Paused)
    }

    async fn task_run(&self, job: &Job) -> Result<Job, Status> {
        self.record("task_run")?;
        self.transition(job.id, JobStatus::Running)
    }

    async fn task_quit(&self, job: &Job) -> Result<Job, Status> {
        self.record("task_quit")?;
        let job = self.transition(job.id, JobStatus::Quit)?;
        self.script.lock().unwrap().jobs.remove(&job.id);
        Ok(job)
    }
}

pub async fn new_queue() -> Queue {
    Queue::new(QueueConfig::default()).await.unwrap()
}

/// Register `name` and connect it through `client`.
pub async fn attach(queue: &Queue, name: &str, client: Arc<ScriptedClient>) -> Uuid {
    let id = queue
        .add_resource("test", name, BTreeMap::new())
        .await
        .unwrap();
    queue.connect_resource(id, client).await.unwrap();
    id
}
