//! Worker side of the system.
//!
//! A resource process hosts one [`Dispatcher`] holding the locally
//! registered tools and the tasks started on them by the queue. The
//! dispatcher is served over gRPC by [`crate::grpc::server::ResourceServer`].
//!
//! Tool code is untrusted: a panic inside a tool is caught at the
//! dispatcher boundary, logged, and reported as a failed job.

pub mod dispatcher;

pub use dispatcher::{DispatchError, Dispatcher, AUTH_FAILED};
