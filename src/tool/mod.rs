//! The contract between a dispatcher and the tools it hosts.
//!
//! A [`Tooler`] describes one capability (name, version, hardware
//! requirement, parameter schema) and creates a [`Task`] per job. Tasks are
//! driven synchronously by the dispatcher and must keep `status` cheap.

pub mod timer;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::{Job, JobStatus};

/// Hardware tag for CPU-bound tools.
pub const HARDWARE_CPU: &str = "cpu";
/// Hardware tag for GPU-bound tools.
pub const HARDWARE_GPU: &str = "gpu";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("cannot move task from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("task failed: {0}")]
    Failed(String),
}

/// Immutable description of a tool as seen across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub version: String,
    /// Hardware tag the tool occupies while running.
    pub requirement: String,
    /// Tool-defined parameter schema, opaque to the queue.
    pub parameters: String,
}

impl Tool {
    /// Whether two descriptors name the same capability, ignoring ids.
    pub fn same_capability(&self, other: &Tool) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.version == other.version
            && self.requirement == other.requirement
            && self.parameters == other.parameters
    }
}

pub trait Tooler: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> &str;
    fn kind(&self) -> &str;
    fn version(&self) -> &str;
    fn requirement(&self) -> &str;
    fn parameters(&self) -> String;

    fn new_task(&self, job: Job) -> Result<Box<dyn Task>, TaskError>;

    fn descriptor(&self) -> Tool {
        Tool {
            id: self.id(),
            name: self.name().to_string(),
            kind: self.kind().to_string(),
            version: self.version().to_string(),
            requirement: self.requirement().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// One job running under a tool.
///
/// `run` on a running task is a no-op; `run` and `pause` on a terminal task
/// fail with [`TaskError::InvalidTransition`].
pub trait Task: Send {
    fn run(&mut self) -> Result<(), TaskError>;
    fn pause(&mut self) -> Result<(), TaskError>;
    /// Stop the task for good and return its final state.
    fn quit(&mut self) -> Job;
    fn status(&self) -> Job;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, version: &str) -> Tool {
        Tool {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: "Test".to_string(),
            version: version.to_string(),
            requirement: HARDWARE_CPU.to_string(),
            parameters: "{}".to_string(),
        }
    }

    #[test]
    fn same_capability_ignores_id() {
        let a = tool("Timer", "CPU");
        let b = tool("Timer", "CPU");
        assert_ne!(a.id, b.id);
        assert!(a.same_capability(&b));
    }

    #[test]
    fn different_version_is_a_different_capability() {
        assert!(!tool("Timer", "CPU").same_capability(&tool("Timer", "GPU")));
    }
}
