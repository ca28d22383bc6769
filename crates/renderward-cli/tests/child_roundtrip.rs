//! Runs the real `renderward child` binary behind the supervisor and bridge

use renderward_core::{
    BridgeConfig, CommandType, IpcMode, LaunchConfig, RenderBridge, RenderCommand, RestartPolicy,
    SandboxPolicy,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn renderer(args: &[&str]) -> LaunchConfig {
    let mut builder = LaunchConfig::builder(env!("CARGO_BIN_EXE_renderward"))
        .arg("child")
        .sandbox(SandboxPolicy::permissive())
        .restart_delay(Duration::from_millis(50), Duration::from_millis(200))
        .monitor_interval(Duration::from_millis(50));
    for arg in args {
        builder = builder.arg(*arg);
    }
    builder.build()
}

fn bridge(mode: IpcMode) -> RenderBridge {
    RenderBridge::new(
        BridgeConfig {
            mode,
            poll_interval_ms: 20,
            ..BridgeConfig::default()
        }
        .with_unique_names(),
    )
}

fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    f()
}

#[test]
fn hybrid_commands_reach_the_child() {
    let bridge = bridge(IpcMode::Hybrid);
    let pid = bridge.start_render_process(renderer(&[])).unwrap();
    assert!(pid > 0);
    assert!(bridge.is_ready());
    assert!(bridge.is_healthy());

    for widget in 1..=5 {
        let result = bridge.send_command(
            RenderCommand::new(CommandType::Render, widget),
            Duration::from_secs(5),
        );
        assert!(result.is_success(), "{}", result.error_message);
        assert_eq!(result.widget_id, widget);
    }

    let stats = bridge.statistics();
    assert_eq!(stats.commands_timed_out, 0);
    assert!(stats.results_received >= 6);

    bridge.stop_render_process(Duration::from_secs(5));
    assert!(!bridge.supervisor().is_alive());
    bridge.shutdown();
}

#[test]
fn pipe_only_child() {
    let bridge = bridge(IpcMode::NamedPipes);
    bridge.start_render_process(renderer(&[])).unwrap();
    let result = bridge.send(RenderCommand::new(CommandType::GetSystemSnapshot, 0));
    assert!(result.is_success(), "{}", result.error_message);
    bridge.shutdown();
}

#[test]
fn crashed_child_is_restarted_and_handshaken_again() {
    let bridge = bridge(IpcMode::Hybrid);
    let started = Arc::new(AtomicUsize::new(0));
    let exited = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&started);
    bridge.on_process_started(move |_| {
        s.fetch_add(1, Ordering::SeqCst);
    });
    let e = Arc::clone(&exited);
    bridge.on_process_exited(move |code| {
        assert_eq!(code, 3);
        e.fetch_add(1, Ordering::SeqCst);
    });

    let mut launch = renderer(&["--exit-after", "1"]);
    launch.restart_policy = RestartPolicy::OnCrash;
    let first = bridge.start_render_process(launch).unwrap();

    // The handshake used up the allowance; this command kills the child.
    let result = bridge.send_command(
        RenderCommand::new(CommandType::Render, 1),
        Duration::from_millis(500),
    );
    assert!(!result.is_success());

    assert!(wait_for(Duration::from_secs(10), || started.load(Ordering::SeqCst) == 2));
    assert_eq!(exited.load(Ordering::SeqCst), 1);
    assert!(bridge.is_ready());
    assert_ne!(bridge.supervisor().pid(), Some(first));
    assert_eq!(bridge.supervisor().restart_count(), 1);

    bridge.shutdown();
}
