// ABOUTME: Build script generating the Lookout gRPC service code.
// ABOUTME: Uses tonic-build's manual builder over hand-written prost messages.

fn main() {
    let lookout = tonic_build::manual::Service::builder()
        .name("Lookout")
        .package("lookout.v1")
        .method(
            tonic_build::manual::Method::builder()
                .name("agent_stream")
                .route_name("AgentStream")
                .input_type("crate::AgentMessage")
                .output_type("crate::ServerMessage")
                .codec_path("tonic::codec::ProstCodec")
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .method(
            tonic_build::manual::Method::builder()
                .name("io_stream")
                .route_name("IoStream")
                .input_type("crate::IoFrame")
                .output_type("crate::IoFrame")
                .codec_path("tonic::codec::ProstCodec")
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[lookout]);

    println!("cargo:rerun-if-changed=build.rs");
}
