//! The queue <-> resource RPC channel.
//!
//! - [`messages`]: prost wire types and conversions to the domain model
//! - [`client`]: [`client::ResourceClient`] as used by the queue, over
//!   gRPC or in-process
//! - [`resource_service`]: the tonic service wrapping a dispatcher
//! - [`server`]: hosting that service with optional mTLS

pub mod client;
pub mod messages;
pub mod resource_service;
pub mod server;

pub use client::{GrpcResourceClient, LocalResourceClient, ResourceClient};
