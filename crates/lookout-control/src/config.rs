// ABOUTME: Dashboard configuration loaded from TOML, every field defaulted.
// ABOUTME: Converts the on-disk seconds/milliseconds into the runtime settings each component takes.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::registry::UserId;
use crate::session::SessionConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Single listener shared by the HTTP API, WebSockets and gRPC.
    pub listen_addr: String,
    pub session: SessionSection,
    pub dispatch: DispatchSection,
    pub auth: AuthSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8008".to_string(),
            session: SessionSection::default(),
            dispatch: DispatchSection::default(),
            auth: AuthSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub attach_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub max_sessions: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            attach_timeout_secs: 10,
            idle_timeout_secs: 300,
            keepalive_interval_secs: 10,
            max_sessions: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub send_timeout_ms: u64,
    /// Period of the keepalive task fan-out to every agent.
    pub agent_keepalive_secs: u64,
    /// Delay after startup before all agents are asked for host info.
    pub report_host_info_delay_secs: u64,
    /// Outbound buffer per agent stream.
    pub channel_buffer: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5000,
            agent_keepalive_secs: 20,
            report_host_info_delay_secs: 15,
            channel_buffer: crate::stream::DEFAULT_CHANNEL_BUFFER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Seeded into the token registry at startup so the API is reachable
    /// before any token has been issued.
    pub bootstrap_token: Option<String>,
    pub bootstrap_user: UserId,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            bootstrap_token: None,
            bootstrap_user: 1,
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config file path (~/.config/lookout/dashboard.toml)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lookout")
            .join("dashboard.toml")
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        anyhow::ensure!(
            self.session.max_sessions > 0,
            "session.max_sessions must be at least 1"
        );
        anyhow::ensure!(
            self.session.attach_timeout_secs > 0,
            "session.attach_timeout_secs must be at least 1"
        );
        anyhow::ensure!(
            self.session.keepalive_interval_secs > 0,
            "session.keepalive_interval_secs must be at least 1"
        );
        anyhow::ensure!(
            self.dispatch.agent_keepalive_secs > 0,
            "dispatch.agent_keepalive_secs must be at least 1"
        );
        anyhow::ensure!(
            self.dispatch.channel_buffer > 0,
            "dispatch.channel_buffer must be at least 1"
        );
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("Invalid listen_addr {:?}", self.listen_addr))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            attach_timeout: Duration::from_secs(self.session.attach_timeout_secs),
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            keepalive_interval: Duration::from_secs(self.session.keepalive_interval_secs),
            max_sessions: self.session.max_sessions,
            send_timeout: self.send_timeout(),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.send_timeout_ms)
    }

    pub fn agent_keepalive(&self) -> Duration {
        Duration::from_secs(self.dispatch.agent_keepalive_secs)
    }

    pub fn report_host_info_delay(&self) -> Duration {
        Duration::from_secs(self.dispatch.report_host_info_delay_secs)
    }
}
