use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a job, shared by the queue and the tools running it.
///
/// `Created -> Running -> {Paused, Done, Failed, Quit}` and
/// `Paused -> {Running, Quit}`. `Done`, `Failed` and `Quit` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Running,
    Paused,
    Done,
    Failed,
    Quit,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Quit)
    }

    pub fn is_running(self) -> bool {
        self == JobStatus::Running
    }

    /// Whether a task may move from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Created, Running) => true,
            (Running, Paused | Done | Failed | Quit) => true,
            (Paused, Running | Quit) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Created => write!(f, "created"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Quit => write!(f, "quit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Canonical tool id until the job is placed, then the id local to
    /// `assigned_resource`.
    pub tool_id: Uuid,
    pub name: String,
    pub owner: String,
    pub parameters: BTreeMap<String, String>,
    pub status: JobStatus,
    /// Set when the job first enters `Running` and kept afterwards.
    pub assigned_resource: Option<Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub purge_time: Option<DateTime<Utc>>,
    pub progress: f64,
    pub cracked_count: i64,
    pub total_count: i64,
    pub performance_title: String,
    /// Performance samples keyed by timestamp.
    pub performance: BTreeMap<String, String>,
    pub output_titles: Vec<String>,
    pub output_rows: Vec<Vec<String>>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        tool_id: Uuid,
        name: impl Into<String>,
        owner: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool_id,
            name: name.into(),
            owner: owner.into(),
            parameters,
            status: JobStatus::Created,
            assigned_resource: None,
            start_time: None,
            purge_time: None,
            progress: 0.0,
            cracked_count: 0,
            total_count: 0,
            performance_title: String::new(),
            performance: BTreeMap::new(),
            output_titles: Vec::new(),
            output_rows: Vec::new(),
            error: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Merge the state reported by a worker into the queue's copy.
    ///
    /// The worker owns status, telemetry and the tool id it understands. The
    /// queue keeps identity, ownership, placement and retention.
    pub fn absorb(&mut self, remote: Job) {
        self.status = remote.status;
        self.tool_id = remote.tool_id;
        if remote.start_time.is_some() {
            self.start_time = remote.start_time;
        }
        self.progress = remote.progress;
        self.cracked_count = remote.cracked_count;
        self.total_count = remote.total_count;
        self.performance_title = remote.performance_title;
        self.performance = remote.performance;
        self.output_titles = remote.output_titles;
        self.output_rows = remote.output_rows;
        self.error = remote.error;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_created_and_unplaced() {
        let tool = Uuid::new_v4();
        let job = Job::new(tool, "ntlm", "alice", BTreeMap::new()).with_parameter("seconds", "5");
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.tool_id, tool);
        assert!(job.assigned_resource.is_none());
        assert_eq!(job.parameters.get("seconds").map(String::as_str), Some("5"));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Quit.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Created.is_terminal());
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        assert!(JobStatus::Created.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Paused.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Created.can_transition_to(JobStatus::Paused));
    }

    #[test]
    fn absorb_keeps_placement_and_identity() {
        let resource = Uuid::new_v4();
        let mut local = Job::new(Uuid::new_v4(), "job", "bob", BTreeMap::new());
        local.assigned_resource = Some(resource);

        let mut remote = local.clone();
        remote.id = Uuid::new_v4();
        remote.assigned_resource = None;
        remote.status = JobStatus::Running;
        remote.cracked_count = 3;
        remote.tool_id = Uuid::new_v4();

        let id = local.id;
        local.absorb(remote.clone());
        assert_eq!(local.id, id);
        assert_eq!(local.assigned_resource, Some(resource));
        assert_eq!(local.status, JobStatus::Running);
        assert_eq!(local.cracked_count, 3);
        assert_eq!(local.tool_id, remote.tool_id);
    }
}
