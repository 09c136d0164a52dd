// ABOUTME: Dashboard server setup and lifecycle
// ABOUTME: Serves HTTP and gRPC on one listener and runs the periodic agent tasks

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use lookout_proto::server::LookoutServer;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::http;
use crate::mux::multiplex;
use crate::scheduler::engine::CronEngine;
use crate::services::LookoutService;
use crate::state::ControlState;
use crate::task::TaskMessage;

/// A configured dashboard, ready to serve.
pub struct Dashboard {
    config: Config,
    state: Arc<ControlState>,
    engine: Arc<CronEngine>,
}

impl Dashboard {
    pub async fn new(config: Config) -> Result<Self> {
        let engine = Arc::new(CronEngine::start().await.context("starting cron engine")?);
        let state = ControlState::new(&config, engine.clone());
        state.seed_bootstrap_token(&config).await;
        Ok(Self {
            config,
            state,
            engine,
        })
    }

    pub fn state(&self) -> Arc<ControlState> {
        self.state.clone()
    }

    /// HTTP and gRPC behind one service.
    pub fn router(&self) -> Router {
        let grpc = tonic::service::Routes::new(LookoutServer::new(LookoutService::new(
            self.state.clone(),
        )))
        .into_axum_router();
        multiplex(grpc, http::router(self.state.clone()))
    }

    /// Serve until `shutdown` resolves, then stop background tasks, close
    /// every agent stream and session, and stop the cron engine.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let background = spawn_background(&self.config, &self.state, &cancel);
        let app = self.router();

        let state = self.state.clone();
        let stop = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                stop.cancel();
                state.sessions.shutdown();
                let closed = state.agents.clear().await;
                info!(agents = closed, "Closed agent streams");
            })
            .await
            .context("running server")?;

        cancel.cancel();
        for task in background {
            let _ = task.await;
        }
        self.engine.shutdown().await;
        info!("Server shut down gracefully");
        Ok(())
    }
}

/// Run the dashboard until Ctrl+C or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Dashboard listening on {} (HTTP + gRPC)", addr);

    Dashboard::new(config)
        .await?
        .serve(listener, shutdown_signal())
        .await
}

fn spawn_background(
    config: &Config,
    state: &ControlState,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(keepalive_loop(
            state.dispatcher.clone(),
            config.agent_keepalive(),
            cancel.clone(),
        )),
        tokio::spawn(report_host_info_after(
            state.dispatcher.clone(),
            config.report_host_info_delay(),
            cancel.clone(),
        )),
    ]
}

/// Push a keepalive task to every agent each `period`.
async fn keepalive_loop(dispatcher: Dispatcher, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = dispatcher.dispatch_all(TaskMessage::keepalive()).await;
                debug!(agents = report.len(), delivered = report.delivered(), "Keepalive sent");
            }
        }
    }
}

/// Ask every agent for host info once, `delay` after startup.
async fn report_host_info_after(dispatcher: Dispatcher, delay: Duration, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {
            let report = dispatcher.dispatch_all(TaskMessage::report_host_info()).await;
            info!(agents = report.len(), "Requested host info from connected agents");
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentConnection, AgentMeta, AgentRegistry};
    use crate::stream::TaskStream;
    use futures::{FutureExt, StreamExt};
    use lookout_proto::{server_message, TaskKind};

    async fn dispatcher_with_agent() -> (Dispatcher, crate::stream::OutboundTasks) {
        let agents = Arc::new(AgentRegistry::new());
        let (stream, outbound) = TaskStream::channel(8);
        agents
            .upsert(AgentConnection::new("A1", "c1", stream, AgentMeta::default()))
            .await;
        (Dispatcher::new(agents, Duration::from_secs(1)), outbound)
    }

    fn kind(msg: lookout_proto::ServerMessage) -> TaskKind {
        match msg.payload {
            Some(server_message::Payload::Task(task)) => task.kind(),
            other => panic!("expected task, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_loop_ticks_until_cancelled() {
        let (dispatcher, mut outbound) = dispatcher_with_agent().await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(keepalive_loop(
            dispatcher,
            Duration::from_secs(20),
            cancel.clone(),
        ));

        let started = Instant::now();
        assert_eq!(kind(outbound.next().await.unwrap().unwrap()), TaskKind::Keepalive);
        assert_eq!(kind(outbound.next().await.unwrap().unwrap()), TaskKind::Keepalive);
        assert!(started.elapsed() >= Duration::from_secs(40));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_info_requested_once_after_delay() {
        let (dispatcher, mut outbound) = dispatcher_with_agent().await;
        let started = Instant::now();
        report_host_info_after(dispatcher, Duration::from_secs(15), CancellationToken::new())
            .await;

        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(
            kind(outbound.next().await.unwrap().unwrap()),
            TaskKind::ReportHostInfo
        );
    }

    #[tokio::test]
    async fn test_cancel_skips_host_info_request() {
        let (dispatcher, mut outbound) = dispatcher_with_agent().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        report_host_info_after(dispatcher, Duration::from_secs(3600), cancel).await;
        assert!(outbound.next().now_or_never().is_none());
    }
}
