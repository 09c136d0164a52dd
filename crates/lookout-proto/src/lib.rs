// ABOUTME: Wire types for the lookout agent protocol and the generated gRPC service.
// ABOUTME: Messages are prost-derived by hand; service stubs come from build.rs.

#![allow(clippy::derive_partial_eq_without_eq)]

/// Kinds of one-shot command understood by agents.
///
/// Numbering is part of the wire protocol and must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum TaskKind {
    Unspecified = 0,
    HttpGet = 1,
    IcmpPing = 2,
    TcpPing = 3,
    Command = 4,
    Upgrade = 6,
    Keepalive = 7,
    ReportHostInfo = 10,
    /// Open a file-manager session; payload carries the session ID.
    OpenSession = 11,
}

impl TaskKind {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            TaskKind::Unspecified => "unspecified",
            TaskKind::HttpGet => "http_get",
            TaskKind::IcmpPing => "icmp_ping",
            TaskKind::TcpPing => "tcp_ping",
            TaskKind::Command => "command",
            TaskKind::Upgrade => "upgrade",
            TaskKind::Keepalive => "keepalive",
            TaskKind::ReportHostInfo => "report_host_info",
            TaskKind::OpenSession => "open_session",
        }
    }
}

/// A command pushed down an agent's stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Task {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(enumeration = "TaskKind", tag = "2")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

/// Sent once after a successful registration.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Welcome {
    #[prost(string, tag = "1")]
    pub server_id: String,
    #[prost(string, tag = "2")]
    pub agent_id: String,
    #[prost(string, tag = "3")]
    pub connection_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerMessage {
    #[prost(oneof = "server_message::Payload", tags = "1, 2")]
    pub payload: Option<server_message::Payload>,
}

pub mod server_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Welcome(super::Welcome),
        #[prost(message, tag = "2")]
        Task(super::Task),
    }
}

/// Static facts an agent reports about its host.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HostInfo {
    #[prost(string, tag = "1")]
    pub platform: String,
    #[prost(string, tag = "2")]
    pub platform_version: String,
    #[prost(string, tag = "3")]
    pub arch: String,
    #[prost(string, repeated, tag = "4")]
    pub cpu: Vec<String>,
    #[prost(uint64, tag = "5")]
    pub mem_total: u64,
    #[prost(uint64, tag = "6")]
    pub boot_time: u64,
    #[prost(string, tag = "7")]
    pub agent_version: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Register {
    /// Stable agent identifier; the server assigns one when empty.
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, repeated, tag = "3")]
    pub tags: Vec<String>,
    #[prost(message, optional, tag = "4")]
    pub host: Option<HostInfo>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Heartbeat {
    #[prost(int64, tag = "1")]
    pub timestamp_ms: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HostReport {
    #[prost(message, optional, tag = "1")]
    pub host: Option<HostInfo>,
}

/// Outcome of a task previously pushed to the agent.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TaskResult {
    #[prost(uint64, tag = "1")]
    pub task_id: u64,
    #[prost(enumeration = "TaskKind", tag = "2")]
    pub kind: i32,
    #[prost(bool, tag = "3")]
    pub successful: bool,
    #[prost(string, tag = "4")]
    pub data: String,
    #[prost(float, tag = "5")]
    pub delay_ms: f32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AgentMessage {
    #[prost(oneof = "agent_message::Payload", tags = "1, 2, 3, 4")]
    pub payload: Option<agent_message::Payload>,
}

pub mod agent_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Register(super::Register),
        #[prost(message, tag = "2")]
        Heartbeat(super::Heartbeat),
        #[prost(message, tag = "3")]
        HostReport(super::HostReport),
        #[prost(message, tag = "4")]
        TaskResult(super::TaskResult),
    }
}

/// One chunk of an interactive session relay. The first frame an agent sends
/// on `IoStream` names the session; later frames leave `session_id` empty.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IoFrame {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

include!(concat!(env!("OUT_DIR"), "/lookout.v1.Lookout.rs"));

/// Fully-qualified gRPC service name, used as the path prefix of every call.
pub const SERVICE_NAME: &str = "lookout.v1.Lookout";

// Re-export client types under a client module
pub mod client {
    pub use super::lookout_client::LookoutClient;
}

// Re-export server types under a server module
pub mod server {
    pub use super::lookout_server::{Lookout, LookoutServer};
}
