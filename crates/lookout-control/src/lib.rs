// ABOUTME: Control plane for the lookout fleet-monitoring dashboard
// ABOUTME: Agent registry, task dispatch, session tunnels, scheduler bridge, HTTP/gRPC on one port

pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod mux;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod services;
pub mod session;
pub mod state;
pub mod stream;
pub mod task;

pub use config::Config;
pub use dispatch::{DispatchOutcome, DispatchReport, Dispatcher};
pub use error::{ControlError, Result};
pub use server::{run, Dashboard};
pub use session::{SessionManager, SessionState};
pub use state::ControlState;
pub use task::TaskMessage;
