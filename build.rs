use tonic_build::manual::{Builder, Method, Service};

/// One unary method of the resource service, encoded with prost.
fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::grpc::messages::{}", input))
        .output_type(format!("crate::grpc::messages::{}", output))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    let service = Service::builder()
        .name("ResourceService")
        .package("cracklord")
        .method(unary("ping", "Ping", "PingRequest", "PingResponse"))
        .method(unary(
            "resource_hardware",
            "ResourceHardware",
            "AuthRequest",
            "HardwareResponse",
        ))
        .method(unary(
            "resource_tools",
            "ResourceTools",
            "AuthRequest",
            "ToolsResponse",
        ))
        .method(unary("add_task", "AddTask", "TaskRequest", "JobMessage"))
        .method(unary("task_status", "TaskStatus", "TaskRequest", "JobMessage"))
        .method(unary("task_pause", "TaskPause", "TaskRequest", "JobMessage"))
        .method(unary("task_run", "TaskRun", "TaskRequest", "JobMessage"))
        .method(unary("task_quit", "TaskQuit", "TaskRequest", "JobMessage"))
        .build();

    Builder::new().compile(&[service]);

    println!("cargo:rerun-if-changed=build.rs");
}
