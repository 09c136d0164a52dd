// ABOUTME: gRPC service implementations for the dashboard
// ABOUTME: Lookout (agent task stream and session IO stream)

pub mod agent;

pub use agent::LookoutService;
