// ABOUTME: In-memory registries: the control plane's only shared mutable state.
// ABOUTME: Each registry owns one lock and exposes operations, never its map.

pub mod agents;
pub mod jobs;
pub mod tokens;

pub use agents::{AgentConnection, AgentMeta, AgentRegistry, AgentSummary};
pub use jobs::{Cover, JobId, JobKind, JobRegistry, ScheduledJob};
pub use tokens::{ApiToken, TokenRegistry, UserId};
