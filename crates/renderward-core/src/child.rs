//! Renderer side of the launch contract
//!
//! A renderer process builds a [`ChildEndpoint`] from its command line,
//! then hands it a [`RenderBackend`]. The endpoint answers every command on
//! the transport it came in on and returns after `Destroy`.

use crate::config::{IpcEndpoints, MAX_PIPE_MESSAGE_SIZE};
use crate::pipe::NamedPipeChannel;
use crate::shm::SharedMemoryChannel;
use crate::transport::{TransportChannel, TransportKind};
use crate::{CommandType, RenderCommand, RenderResult, RenderwardError, Result, ResultStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const RECONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// How long the pipe may stay unreachable before the parent is presumed gone
const PARENT_LOST_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces a result for each command the parent sends
pub trait RenderBackend: Send {
    fn handle(&mut self, command: &RenderCommand) -> RenderResult;
}

/// Reference backend: accepts every command and reports timing
#[derive(Debug)]
pub struct EchoBackend {
    started: Instant,
    frames: u32,
    initialized: bool,
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            initialized: false,
        }
    }
}

impl RenderBackend for EchoBackend {
    #[allow(clippy::cast_precision_loss)]
    fn handle(&mut self, command: &RenderCommand) -> RenderResult {
        let began = Instant::now();
        let result = RenderResult::success(command.command_id, command.widget_id);

        let result = match command.command_type {
            CommandType::Initialize => {
                self.initialized = true;
                result
            }
            _ if !self.initialized => result
                .with_status(ResultStatus::InvalidParameters)
                .with_error("renderer not initialized"),
            CommandType::Render => {
                self.frames = self.frames.wrapping_add(1);
                result
            }
            CommandType::Resize if command.bounds.width < 0 || command.bounds.height < 0 => result
                .with_status(ResultStatus::InvalidParameters)
                .with_error("negative size"),
            _ => result,
        };

        let uptime = self.started.elapsed().as_secs_f32();
        let mut result = result.with_render_time(began.elapsed().as_secs_f64() * 1000.0);
        result.frame_count = self.frames;
        if uptime > 0.0 {
            result.average_fps = self.frames as f32 / uptime;
        }
        result
    }
}

/// Client side of both transports inside the renderer process
pub struct ChildEndpoint {
    endpoints: IpcEndpoints,
    shm: Option<SharedMemoryChannel>,
    pipe: Option<NamedPipeChannel>,
    max_message: usize,
    poll: Duration,
    stop: Arc<AtomicBool>,
    pipe_lost_at: Option<Instant>,
}

impl ChildEndpoint {
    /// Connect every endpoint that is named; at least one must succeed
    pub fn connect(endpoints: &IpcEndpoints, max_message: usize, timeout: Duration) -> Result<Self> {
        let mut failures = Vec::new();

        let shm = endpoints.shared_memory.as_deref().and_then(|name| {
            SharedMemoryChannel::connect(name)
                .inspect_err(|e| {
                    tracing::warn!(name, error = %e, "shared memory unavailable");
                    failures.push(e.to_string());
                })
                .ok()
        });
        let pipe = endpoints.named_pipe.as_deref().and_then(|name| {
            NamedPipeChannel::connect(name, max_message, timeout)
                .inspect_err(|e| {
                    tracing::warn!(name, error = %e, "pipe unavailable");
                    failures.push(e.to_string());
                })
                .ok()
        });

        if shm.is_none() && pipe.is_none() {
            return Err(RenderwardError::ChannelInit(if failures.is_empty() {
                "no transport endpoints given".into()
            } else {
                failures.join("; ")
            }));
        }

        tracing::info!(
            shared_memory = shm.is_some(),
            named_pipe = pipe.is_some(),
            "renderer endpoint connected"
        );
        Ok(Self {
            endpoints: endpoints.clone(),
            shm,
            pipe,
            max_message,
            poll: Duration::from_millis(20),
            stop: Arc::new(AtomicBool::new(false)),
            pipe_lost_at: None,
        })
    }

    /// Connect using `--shared-memory=` / `--named-pipe=` arguments
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::connect(
            &IpcEndpoints::from_args(args),
            MAX_PIPE_MESSAGE_SIZE,
            Duration::from_secs(5),
        )
    }

    /// Wait per transport in each loop pass
    #[must_use]
    pub const fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Flag that makes [`run`](Self::run) return after the current pass
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Serve commands until `Destroy` or a stop request
    ///
    /// Returns how many commands were answered.
    pub fn run(&mut self, backend: &mut dyn RenderBackend) -> Result<u64> {
        let mut handled = 0u64;
        while !self.stop.load(Ordering::Acquire) {
            let Some((command, via)) = self.next_command() else {
                if self
                    .pipe_lost_at
                    .is_some_and(|at| at.elapsed() > PARENT_LOST_TIMEOUT)
                {
                    tracing::warn!(handled, "parent unreachable, renderer exiting");
                    break;
                }
                continue;
            };
            tracing::debug!(command_id = command.command_id, command_type = ?command.command_type, ?via, "command received");

            let result = backend.handle(&command);
            self.reply(&result, via);
            handled += 1;

            if command.command_type == CommandType::Destroy {
                tracing::info!(handled, "destroy received, renderer exiting");
                break;
            }
        }
        self.cleanup();
        Ok(handled)
    }

    fn next_command(&mut self) -> Option<(RenderCommand, TransportKind)> {
        if let Some(shm) = &self.shm {
            match shm.receive_command(self.poll) {
                Ok(Some(command)) => return Some((command, TransportKind::SharedMemory)),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "shared memory receive failed"),
            }
        }

        self.ensure_pipe();
        match &self.pipe {
            Some(pipe) if pipe.is_connected() => match pipe.receive_command(self.poll) {
                Ok(Some(command)) => Some((command, TransportKind::NamedPipe)),
                Ok(None) => None,
                Err(e) => {
                    tracing::debug!(error = %e, "pipe receive failed");
                    None
                }
            },
            _ => {
                if self.shm.is_none() {
                    std::thread::sleep(self.poll);
                }
                None
            }
        }
    }

    /// Reconnect a dropped pipe; the parent keeps listening
    fn ensure_pipe(&mut self) {
        if self.pipe.as_ref().is_some_and(NamedPipeChannel::is_connected) {
            return;
        }
        let Some(name) = self.endpoints.named_pipe.as_deref() else {
            return;
        };
        match NamedPipeChannel::connect(name, self.max_message, RECONNECT_TIMEOUT) {
            Ok(pipe) => {
                tracing::info!(pipe = name, "render pipe reconnected");
                self.pipe = Some(pipe);
                self.pipe_lost_at = None;
            }
            Err(e) => {
                tracing::trace!(pipe = name, error = %e, "pipe reconnect failed");
                self.pipe_lost_at.get_or_insert_with(Instant::now);
            }
        }
    }

    /// Answer on `via`, falling back to the other transport
    fn reply(&self, result: &RenderResult, via: TransportKind) {
        let shm = self.shm.as_ref().map(|c| c as &dyn TransportChannel);
        let pipe = self.pipe.as_ref().map(|c| c as &dyn TransportChannel);
        let (first, second) = match via {
            TransportKind::SharedMemory => (shm, pipe),
            TransportKind::NamedPipe => (pipe, shm),
        };

        for channel in [first, second].into_iter().flatten() {
            match channel.send_result(result) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(command_id = result.command_id, via = ?channel.kind(), error = %e, "result send failed");
                }
            }
        }
        tracing::error!(command_id = result.command_id, "result could not be delivered");
    }

    fn cleanup(&self) {
        if let Some(shm) = &self.shm {
            shm.cleanup();
        }
        if let Some(pipe) = &self.pipe {
            pipe.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RenderRect;
    use crate::pipe::tests::pipe_name;

    #[test]
    fn echo_backend_requires_initialize() {
        let mut backend = EchoBackend::default();
        let mut render = RenderCommand::new(CommandType::Render, 2);
        render.command_id = 8;
        let early = backend.handle(&render);
        assert_eq!(early.status, ResultStatus::InvalidParameters);

        assert!(backend.handle(&RenderCommand::new(CommandType::Initialize, 0)).is_success());
        let result = backend.handle(&render);
        assert!(result.is_success());
        assert_eq!(result.command_id, 8);
        assert_eq!(result.widget_id, 2);
        assert_eq!(result.frame_count, 1);
    }

    #[test]
    fn echo_backend_rejects_negative_resize() {
        let mut backend = EchoBackend::default();
        backend.handle(&RenderCommand::new(CommandType::Initialize, 0));
        let resize =
            RenderCommand::new(CommandType::Resize, 1).with_bounds(RenderRect::new(0, 0, -5, 10));
        assert_eq!(backend.handle(&resize).status, ResultStatus::InvalidParameters);
    }

    #[test]
    fn no_endpoints_is_an_init_error() {
        let err = ChildEndpoint::from_args(["--unrelated"]).err().unwrap();
        assert!(matches!(err, RenderwardError::ChannelInit(_)));
    }

    #[test]
    fn missing_transports_are_reported() {
        let endpoints = IpcEndpoints {
            shared_memory: Some(pipe_name("absent_shm")),
            named_pipe: Some(pipe_name("absent_pipe")),
        };
        let result = ChildEndpoint::connect(&endpoints, 1024, Duration::from_millis(100));
        assert!(matches!(result, Err(RenderwardError::ChannelInit(_))));
    }

    #[test]
    fn replies_on_the_arrival_transport() {
        let name = pipe_name("child_reply");
        let server = NamedPipeChannel::create_server(&name, 4096).unwrap();
        let endpoints = IpcEndpoints {
            shared_memory: None,
            named_pipe: Some(name),
        };
        let child = std::thread::spawn(move || {
            let mut endpoint =
                ChildEndpoint::connect(&endpoints, 4096, Duration::from_secs(2)).unwrap();
            endpoint.run(&mut EchoBackend::default()).unwrap()
        });
        assert!(server.accept(Duration::from_secs(2)).unwrap());

        let mut init = RenderCommand::new(CommandType::Initialize, 0);
        init.command_id = 1;
        server.send_command(&init).unwrap();
        let reply = server.receive_result(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(reply.command_id, 1);

        let mut destroy = RenderCommand::new(CommandType::Destroy, 0);
        destroy.command_id = 2;
        server.send_command(&destroy).unwrap();
        let reply = server.receive_result(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(reply.command_id, 2);
        assert_eq!(child.join().unwrap(), 2);
    }
}
