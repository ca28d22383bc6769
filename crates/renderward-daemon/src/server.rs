//! Host wiring: the supervised renderer behind a multi-client manager

use crate::config::HostConfig;
use anyhow::Context;
use renderward_core::bridge::BridgeStatistics;
use renderward_core::ipc::ManagerStatistics;
use renderward_core::process::ProcessInfo;
use renderward_core::{
    IpcConfig, IpcManager, IpcMessage, RenderBridge, RenderCommand, RenderResult, ResultStatus,
};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Channel carrying render commands from clients
pub const RENDER_CHANNEL: &str = "render";
/// Channel answering with a [`HostStatus`]
pub const STATUS_CHANNEL: &str = "status";
/// Channel the host broadcasts renderer lifecycle events on
pub const PROCESS_CHANNEL: &str = "process";

/// How long the renderer gets to exit after `Destroy`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
pub struct HostStatus {
    pub ready: bool,
    pub healthy: bool,
    pub renderer: Option<ProcessInfo>,
    pub bridge: BridgeStatistics,
    pub manager: Option<ManagerStatistics>,
    pub clients: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct ProcessEvent {
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

pub struct Host {
    bridge: Arc<RenderBridge>,
    manager: Arc<IpcManager>,
}

impl Host {
    /// Launch the configured renderer and start serving clients
    pub fn start(config: &HostConfig) -> anyhow::Result<Self> {
        let bridge = Arc::new(RenderBridge::new(config.bridge_config()));
        let pid = bridge
            .start_render_process(config.renderer.clone())
            .context("starting renderer")?;
        tracing::info!(pid, executable = %config.renderer.executable.display(), "renderer ready");

        Self::serve(bridge, config.manager.clone())
    }

    /// Serve clients in front of an already running bridge
    pub fn serve(bridge: Arc<RenderBridge>, manager: IpcConfig) -> anyhow::Result<Self> {
        let manager = Arc::new(IpcManager::new(manager));

        let b = Arc::clone(&bridge);
        manager.register_handler(RENDER_CHANNEL, move |message| {
            Some(handle_render(&b, message))
        });

        let b = Arc::clone(&bridge);
        let m = Arc::downgrade(&manager);
        manager.register_handler(STATUS_CHANNEL, move |_| {
            let status = status(&b, m.upgrade().as_deref());
            serde_json::to_string(&status).ok()
        });

        let m = Arc::downgrade(&manager);
        bridge.on_process_started(move |pid| {
            announce(&m, &ProcessEvent { event: "started", pid: Some(pid), exit_code: None });
        });
        let m = Arc::downgrade(&manager);
        bridge.on_process_exited(move |code| {
            announce(&m, &ProcessEvent { event: "exited", pid: None, exit_code: Some(code) });
        });

        manager.on_connection(|pid, connected| {
            tracing::info!(pid, connected, "client connection changed");
        });
        manager.on_error(|error| {
            tracing::warn!(error = %error, "manager error");
        });

        manager.start().context("starting manager")?;
        tracing::info!(pipe = %manager.config().pipe_name, "serving clients");
        Ok(Self { bridge, manager })
    }

    #[must_use]
    pub fn status(&self) -> HostStatus {
        status(&self.bridge, Some(&self.manager))
    }

    /// Recover the renderer if it stopped answering. Returns whether a
    /// recovery was attempted.
    pub fn check_health(&self) -> bool {
        if self.bridge.is_healthy() {
            return false;
        }
        tracing::warn!(last_error = ?self.bridge.last_error(), "renderer unhealthy, recovering");
        if let Err(e) = self.bridge.attempt_recovery() {
            tracing::error!(error = %e, "recovery failed");
        }
        true
    }

    /// Stop serving clients, then stop the renderer (Destroy, wait, terminate)
    pub fn shutdown(&self) {
        self.manager.stop();
        self.bridge.stop_render_process(SHUTDOWN_GRACE);
        self.bridge.shutdown();
        tracing::info!("host stopped");
    }
}

/// Parse a JSON [`RenderCommand`] and forward it to the renderer
fn handle_render(bridge: &RenderBridge, message: &IpcMessage) -> String {
    let result = match serde_json::from_str::<RenderCommand>(&message.payload) {
        Ok(command) => {
            tracing::debug!(
                from = %message.message_id,
                command = ?command.command_type,
                widget_id = command.widget_id,
                "forwarding render request"
            );
            bridge.send(command)
        }
        Err(e) => RenderResult::failure(0, 0, format!("invalid command: {e}"))
            .with_status(ResultStatus::InvalidParameters),
    };
    serde_json::to_string(&result).unwrap_or_default()
}

fn status(bridge: &RenderBridge, manager: Option<&IpcManager>) -> HostStatus {
    HostStatus {
        ready: bridge.is_ready(),
        healthy: bridge.is_healthy(),
        renderer: bridge.supervisor().process_info(),
        bridge: bridge.statistics(),
        manager: manager.map(IpcManager::statistics),
        clients: manager.map(IpcManager::connected_processes).unwrap_or_default(),
    }
}

fn announce(manager: &Weak<IpcManager>, event: &ProcessEvent) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    if let Ok(payload) = serde_json::to_string(event) {
        manager.broadcast(PROCESS_CHANNEL, payload);
    }
}

/// Run the host until SIGINT/SIGTERM (Ctrl-C on Windows)
pub async fn run(config: HostConfig) -> anyhow::Result<()> {
    let interval = config.health_check_interval();
    let host = Arc::new(tokio::task::spawn_blocking(move || Host::start(&config)).await??);
    let status = host.status();
    tracing::info!(
        ready = status.ready,
        pid = ?status.renderer.map(|info| info.pid),
        "host running"
    );

    let health = interval.map(|period| {
        let host = Arc::clone(&host);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let host = Arc::clone(&host);
                if tokio::task::spawn_blocking(move || host.check_health()).await.is_err() {
                    tracing::error!("health check panicked");
                }
            }
        })
    });

    wait_for_signal().await?;

    if let Some(health) = health {
        health.abort();
    }
    tokio::task::spawn_blocking(move || host.shutdown()).await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use futures::StreamExt;
    use signal_hook::consts::signal::{SIGINT, SIGTERM};

    let mut signals = signal_hook_tokio::Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    if let Some(signal) = signals.next().await {
        tracing::info!(signal, "shutting down");
    }
    handle.close();
    Ok(())
}

#[cfg(windows)]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("ctrl-c received, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderward_core::{
        BridgeConfig, ChildEndpoint, CommandType, EchoBackend, IpcEndpoints, IpcMode,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique(tag: &str) -> String {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        format!(
            "renderward_host_{tag}_{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn ready_bridge() -> (Arc<RenderBridge>, std::thread::JoinHandle<u64>) {
        let bridge = Arc::new(RenderBridge::new(BridgeConfig {
            mode: IpcMode::Hybrid,
            shared_memory_name: unique("shm"),
            shared_memory_size: 64 * 1024,
            pipe_name: unique("pipe"),
            poll_interval_ms: 20,
            startup_timeout_ms: 3000,
            ..BridgeConfig::default()
        }));
        bridge.initialize().unwrap();
        let endpoints: IpcEndpoints = bridge.config().endpoints();
        let child = std::thread::spawn(move || {
            let mut endpoint =
                ChildEndpoint::connect(&endpoints, 1024 * 1024, Duration::from_secs(3)).unwrap();
            endpoint.run(&mut EchoBackend::default()).unwrap()
        });
        bridge.handshake().unwrap();
        (bridge, child)
    }

    fn client(pipe: &str) -> IpcManager {
        let client = IpcManager::new(IpcConfig::client(pipe));
        client.start().unwrap();
        assert!(client.wait_connected(Duration::from_secs(3)));
        client
    }

    #[test]
    fn render_requests_are_forwarded() {
        let (bridge, child) = ready_bridge();
        let pipe = unique("host");
        let host = Host::serve(Arc::clone(&bridge), IpcConfig::server(pipe.clone())).unwrap();
        let client = client(&pipe);

        let command = RenderCommand::new(CommandType::Render, 7);
        let payload = serde_json::to_string(&command).unwrap();
        let response = client
            .send_request(RENDER_CHANNEL, payload, Duration::from_secs(5))
            .unwrap();
        let result: RenderResult = serde_json::from_str(&response).unwrap();
        assert!(result.is_success(), "{}", result.error_message);
        assert_eq!(result.widget_id, 7);

        let response = client
            .send_request(STATUS_CHANNEL, "", Duration::from_secs(5))
            .unwrap();
        let status: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(status["ready"], true);
        assert_eq!(status["clients"].as_array().map(Vec::len), Some(1));

        client.stop();
        assert!(bridge.send_command_fire_and_forget(RenderCommand::new(CommandType::Destroy, 0)));
        assert!(child.join().unwrap() >= 2);
        host.shutdown();
    }

    #[test]
    fn malformed_command_is_rejected_without_reaching_renderer() {
        let (bridge, _child) = ready_bridge();
        let pipe = unique("bad");
        let host = Host::serve(Arc::clone(&bridge), IpcConfig::server(pipe.clone())).unwrap();
        let client = client(&pipe);
        let sent_before = bridge.statistics().commands_sent;

        let response = client
            .send_request(RENDER_CHANNEL, "{not json", Duration::from_secs(5))
            .unwrap();
        let result: RenderResult = serde_json::from_str(&response).unwrap();
        assert_eq!(result.status, ResultStatus::InvalidParameters);
        assert!(result.error_message.starts_with("invalid command"));
        assert_eq!(bridge.statistics().commands_sent, sent_before);

        client.stop();
        host.shutdown();
    }

    #[test]
    fn health_check_without_launched_renderer_keeps_serving() {
        // The echo renderer runs on a thread, so there is no process to supervise.
        let (bridge, _child) = ready_bridge();
        let host = Host::serve(bridge, IpcConfig::server(unique("health"))).unwrap();
        assert!(host.check_health());
        assert!(host.manager.is_running());

        let status = host.status();
        assert!(!status.healthy);
        assert!(status.renderer.is_none());
        assert!(status.clients.is_empty());
        host.shutdown();
    }
}
