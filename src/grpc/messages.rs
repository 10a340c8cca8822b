//! Wire messages of the resource service and their conversions.
//!
//! The structs are prost messages written by hand, so the crate builds
//! without `protoc`. Field tags must stay stable once deployed.

use std::collections::HashMap;

use chrono::DateTime;
use tonic::Status;
use uuid::Uuid;

use crate::scheduler::job::{Job, JobStatus};
use crate::tool::Tool;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingRequest {
    #[prost(int64, tag = "1")]
    pub nonce: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingResponse {
    #[prost(int64, tag = "1")]
    pub value: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthRequest {
    #[prost(string, tag = "1")]
    pub auth_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HardwareResponse {
    #[prost(map = "string, bool", tag = "1")]
    pub hardware: HashMap<String, bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToolMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub kind: String,
    #[prost(string, tag = "4")]
    pub version: String,
    #[prost(string, tag = "5")]
    pub requirement: String,
    #[prost(string, tag = "6")]
    pub parameters: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToolsResponse {
    #[prost(message, repeated, tag = "1")]
    pub tools: Vec<ToolMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskRequest {
    #[prost(string, tag = "1")]
    pub auth_token: String,
    #[prost(message, optional, tag = "2")]
    pub job: Option<JobMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputRow {
    #[prost(string, repeated, tag = "1")]
    pub cells: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireStatus {
    Unspecified = 0,
    Created = 1,
    Running = 2,
    Paused = 3,
    Done = 4,
    Failed = 5,
    Quit = 6,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub tool_id: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub owner: String,
    #[prost(map = "string, string", tag = "5")]
    pub parameters: HashMap<String, String>,
    #[prost(enumeration = "WireStatus", tag = "6")]
    pub status: i32,
    /// Milliseconds since the Unix epoch.
    #[prost(int64, optional, tag = "7")]
    pub start_time_ms: Option<i64>,
    #[prost(double, tag = "8")]
    pub progress: f64,
    #[prost(int64, tag = "9")]
    pub cracked_count: i64,
    #[prost(int64, tag = "10")]
    pub total_count: i64,
    #[prost(string, tag = "11")]
    pub performance_title: String,
    #[prost(map = "string, string", tag = "12")]
    pub performance: HashMap<String, String>,
    #[prost(string, repeated, tag = "13")]
    pub output_titles: Vec<String>,
    #[prost(message, repeated, tag = "14")]
    pub output_rows: Vec<OutputRow>,
    #[prost(string, optional, tag = "15")]
    pub error: Option<String>,
}

impl From<JobStatus> for WireStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Created => WireStatus::Created,
            JobStatus::Running => WireStatus::Running,
            JobStatus::Paused => WireStatus::Paused,
            JobStatus::Done => WireStatus::Done,
            JobStatus::Failed => WireStatus::Failed,
            JobStatus::Quit => WireStatus::Quit,
        }
    }
}

fn status_from_wire(value: i32) -> Result<JobStatus, Status> {
    match WireStatus::try_from(value) {
        Ok(WireStatus::Created) => Ok(JobStatus::Created),
        Ok(WireStatus::Running) => Ok(JobStatus::Running),
        Ok(WireStatus::Paused) => Ok(JobStatus::Paused),
        Ok(WireStatus::Done) => Ok(JobStatus::Done),
        Ok(WireStatus::Failed) => Ok(JobStatus::Failed),
        Ok(WireStatus::Quit) => Ok(JobStatus::Quit),
        Ok(WireStatus::Unspecified) | Err(_) => Err(Status::invalid_argument(format!(
            "Invalid job status: {}",
            value
        ))),
    }
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value)
        .map_err(|_| Status::invalid_argument(format!("Invalid {}: {:?}", field, value)))
}

impl From<&Job> for JobMessage {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            tool_id: job.tool_id.to_string(),
            name: job.name.clone(),
            owner: job.owner.clone(),
            parameters: job.parameters.clone().into_iter().collect(),
            status: WireStatus::from(job.status) as i32,
            start_time_ms: job.start_time.map(|t| t.timestamp_millis()),
            progress: job.progress,
            cracked_count: job.cracked_count,
            total_count: job.total_count,
            performance_title: job.performance_title.clone(),
            performance: job.performance.clone().into_iter().collect(),
            output_titles: job.output_titles.clone(),
            output_rows: job
                .output_rows
                .iter()
                .map(|row| OutputRow { cells: row.clone() })
                .collect(),
            error: job.error.clone(),
        }
    }
}

/// Placement and retention are queue-side state and never travel.
impl TryFrom<JobMessage> for Job {
    type Error = Status;

    fn try_from(msg: JobMessage) -> Result<Self, Self::Error> {
        Ok(Job {
            id: parse_uuid("job id", &msg.id)?,
            tool_id: parse_uuid("tool id", &msg.tool_id)?,
            name: msg.name,
            owner: msg.owner,
            parameters: msg.parameters.into_iter().collect(),
            status: status_from_wire(msg.status)?,
            assigned_resource: None,
            start_time: msg.start_time_ms.and_then(DateTime::from_timestamp_millis),
            purge_time: None,
            progress: msg.progress,
            cracked_count: msg.cracked_count,
            total_count: msg.total_count,
            performance_title: msg.performance_title,
            performance: msg.performance.into_iter().collect(),
            output_titles: msg.output_titles,
            output_rows: msg.output_rows.into_iter().map(|r| r.cells).collect(),
            error: msg.error,
        })
    }
}

impl From<&Tool> for ToolMessage {
    fn from(tool: &Tool) -> Self {
        Self {
            id: tool.id.to_string(),
            name: tool.name.clone(),
            kind: tool.kind.clone(),
            version: tool.version.clone(),
            requirement: tool.requirement.clone(),
            parameters: tool.parameters.clone(),
        }
    }
}

impl TryFrom<ToolMessage> for Tool {
    type Error = Status;

    fn try_from(msg: ToolMessage) -> Result<Self, Self::Error> {
        Ok(Tool {
            id: parse_uuid("tool id", &msg.id)?,
            name: msg.name,
            kind: msg.kind,
            version: msg.version,
            requirement: msg.requirement,
            parameters: msg.parameters,
        })
    }
}

impl TaskRequest {
    pub fn new(auth_token: &str, job: &Job) -> Self {
        Self {
            auth_token: auth_token.to_string(),
            job: Some(JobMessage::from(job)),
        }
    }

    /// Split into token and decoded job, rejecting requests without a job.
    pub fn into_parts(self) -> Result<(String, Job), Status> {
        let job = self
            .job
            .ok_or_else(|| Status::invalid_argument("Missing job"))?;
        Ok((self.auth_token, Job::try_from(job)?))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;

    #[test]
    fn job_survives_the_wire_except_placement() {
        let mut job = Job::new(Uuid::new_v4(), "crack", "alice", BTreeMap::new())
            .with_parameter("seconds", "3");
        job.status = JobStatus::Paused;
        job.assigned_resource = Some(Uuid::new_v4());
        job.start_time = DateTime::from_timestamp_millis(Utc::now().timestamp_millis());
        job.output_titles = vec!["hash".into(), "plain".into()];
        job.output_rows = vec![vec!["abc".into(), "pw".into()]];
        job.error = Some("none".into());

        let back = Job::try_from(JobMessage::from(&job)).unwrap();
        assert_eq!(back.assigned_resource, None);
        let mut expected = job.clone();
        expected.assigned_resource = None;
        assert_eq!(back, expected);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let mut msg = JobMessage::from(&Job::new(Uuid::new_v4(), "j", "o", BTreeMap::new()));
        msg.status = 42;
        let err = Job::try_from(msg).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn bad_uuid_is_rejected() {
        let mut msg = JobMessage::from(&Job::new(Uuid::new_v4(), "j", "o", BTreeMap::new()));
        msg.tool_id = "not-a-uuid".into();
        assert_eq!(
            Job::try_from(msg).unwrap_err().code(),
            tonic::Code::InvalidArgument
        );
    }

    #[test]
    fn task_request_requires_a_job() {
        let req = TaskRequest {
            auth_token: "t".into(),
            job: None,
        };
        assert!(req.into_parts().is_err());
    }
}
