pub mod config;
pub mod dashboard;
pub mod error;
pub mod grpc;
pub mod persist;
pub mod scheduler;
pub mod shutdown;
pub mod tls;
pub mod tool;
pub mod worker;

// Generated tonic client and server for the resource service
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/cracklord.ResourceService.rs"));
}
