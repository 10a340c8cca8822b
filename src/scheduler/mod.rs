//! The central queue.
//!
//! - [`job`]: the job record and its lifecycle
//! - [`stack`]: the ordered backlog
//! - [`pool`]: resources, their hardware slots and tool canonicalization
//! - [`queue`]: [`Queue`], the locked owner of both and its operations
//! - [`keeper`]: the periodic reconciliation loop
//! - [`manager`]: the contract for resource provisioning backends

pub mod job;
mod keeper;
pub mod manager;
pub mod pool;
pub mod queue;
pub mod stack;
pub(crate) mod state;

pub use job::{Job, JobStatus};
pub use manager::{DirectManager, ResourceManager};
pub use pool::{canonicalize, Resource, ResourcePool, ResourceStatus};
pub use queue::Queue;
pub use stack::JobStack;
pub use state::QueueStatus;
