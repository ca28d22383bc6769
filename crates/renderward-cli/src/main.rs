//! renderward CLI - launch renderers, act as one, and talk to a host

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use renderward_core::child::EchoBackend;
use renderward_core::config::default_manager_pipe_name;
use renderward_core::{
    BridgeConfig, ChildEndpoint, CommandType, IpcConfig, IpcEndpoints, IpcManager, IpcMode,
    LaunchConfig, RenderBackend, RenderBridge, RenderCommand, RenderRect, RenderResult,
    RestartPolicy, SandboxPolicy,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "renderward")]
#[command(author, version, about = "Sandboxed out-of-process renderer hosting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a renderer, handshake, send one command and print the result
    Launch {
        /// Renderer executable (defaults to this binary in `child` mode)
        #[arg(short, long)]
        renderer: Option<PathBuf>,

        /// Extra arguments for the renderer
        #[arg(long = "renderer-arg")]
        renderer_args: Vec<String>,

        #[arg(short, long, value_enum, default_value = "hybrid")]
        mode: Mode,

        #[arg(short, long, value_enum, default_value = "render")]
        command: Command,

        #[arg(short, long, default_value = "1")]
        widget: u32,

        /// Command timeout in milliseconds
        #[arg(short, long, default_value = "5000")]
        timeout: u64,

        /// Launch without sandbox restrictions
        #[arg(long)]
        permissive: bool,

        /// Sandbox policy JSON file
        #[arg(long, conflicts_with = "permissive")]
        policy: Option<PathBuf>,
    },

    /// Serve the renderer side of the launch contract with an echo backend
    Child {
        #[arg(long = "shared-memory")]
        shared_memory: Option<String>,

        #[arg(long = "named-pipe")]
        named_pipe: Option<String>,

        /// Exit with code 3 after answering this many commands
        #[arg(long)]
        exit_after: Option<u64>,
    },

    /// Print the resolved sandbox policy as JSON
    Policy {
        /// Start from the permissive policy instead of the default
        #[arg(long)]
        permissive: bool,

        /// Policy JSON file to validate and print
        #[arg(long, conflicts_with = "permissive")]
        file: Option<PathBuf>,
    },

    /// Send one request to a running host and print the response
    Send {
        /// Channel to address
        channel: String,

        /// Request payload
        payload: String,

        /// Host pipe (defaults to RENDERWARD_PIPE or the built-in name)
        #[arg(short, long)]
        pipe: Option<String>,

        /// Response timeout in milliseconds
        #[arg(short, long, default_value = "5000")]
        timeout: u64,

        /// Send as a notification and do not wait
        #[arg(long)]
        notify: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Hybrid,
    SharedMemory,
    NamedPipes,
}

impl From<Mode> for IpcMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Hybrid => Self::Hybrid,
            Mode::SharedMemory => Self::SharedMemory,
            Mode::NamedPipes => Self::NamedPipes,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Command {
    Render,
    Resize,
    SystemSnapshot,
    ProcessSnapshot,
}

impl From<Command> for CommandType {
    fn from(command: Command) -> Self {
        match command {
            Command::Render => Self::Render,
            Command::Resize => Self::Resize,
            Command::SystemSnapshot => Self::GetSystemSnapshot,
            Command::ProcessSnapshot => Self::GetProcessSnapshot,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("renderward=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Launch {
            renderer,
            renderer_args,
            mode,
            command,
            widget,
            timeout,
            permissive,
            policy,
        } => {
            let policy = load_policy(permissive, policy.as_deref())?;
            let (executable, mut args) = match renderer {
                Some(path) => (path, Vec::new()),
                None => (
                    std::env::current_exe().context("locating own executable")?,
                    vec!["child".to_string()],
                ),
            };
            args.extend(renderer_args);

            let mut launch = LaunchConfig::builder(executable)
                .restart_policy(RestartPolicy::Never)
                .sandbox(policy)
                .build();
            launch.args = args;

            let bridge = RenderBridge::new(
                BridgeConfig {
                    mode: mode.into(),
                    ..BridgeConfig::default()
                }
                .with_unique_names(),
            );
            let pid = bridge
                .start_render_process(launch)
                .context("starting renderer")?;
            tracing::info!(pid, "renderer ready");

            let command = RenderCommand::new(command.into(), widget)
                .with_bounds(RenderRect::new(0, 0, 800, 600));
            let result = bridge.send_command(command, Duration::from_millis(timeout));

            println!("{}", serde_json::to_string_pretty(&result)?);
            println!("{}", serde_json::to_string_pretty(&bridge.statistics())?);
            if let Some(report) = bridge.supervisor().sandbox_report() {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }

            bridge.shutdown();
            if !result.is_success() {
                bail!("command failed: {}", result.error_message);
            }
        }

        Commands::Child {
            shared_memory,
            named_pipe,
            exit_after,
        } => {
            let endpoints = IpcEndpoints {
                shared_memory,
                named_pipe,
            };
            let mut endpoint = ChildEndpoint::connect(
                &endpoints,
                renderward_core::config::MAX_PIPE_MESSAGE_SIZE,
                Duration::from_secs(5),
            )
            .context("connecting to parent")?;

            let mut backend = FaultyBackend {
                inner: EchoBackend::default(),
                handled: 0,
                exit_after,
            };
            let handled = endpoint.run(&mut backend)?;
            tracing::info!(handled, "renderer finished");
        }

        Commands::Policy { permissive, file } => {
            let policy = load_policy(permissive, file.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&policy)?);
        }

        Commands::Send {
            channel,
            payload,
            pipe,
            timeout,
            notify,
        } => {
            let pipe = pipe.unwrap_or_else(default_manager_pipe_name);
            let manager = IpcManager::new(IpcConfig {
                max_reconnect_attempts: 1,
                ..IpcConfig::client(pipe.clone())
            });
            manager.start()?;
            if !manager.wait_connected(Duration::from_millis(timeout)) {
                bail!("no host listening on {pipe}");
            }

            if notify {
                if !manager.send(&channel, payload) {
                    bail!("notification could not be queued");
                }
                // Give the sender thread a moment before stopping.
                std::thread::sleep(Duration::from_millis(100));
            } else {
                let response = manager
                    .send_request(&channel, payload, Duration::from_millis(timeout))
                    .with_context(|| format!("no response on channel {channel}"))?;
                println!("{response}");
            }
            manager.stop();
        }
    }

    Ok(())
}

fn load_policy(permissive: bool, file: Option<&std::path::Path>) -> anyhow::Result<SandboxPolicy> {
    let policy = match file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None if permissive => SandboxPolicy::permissive(),
        None => SandboxPolicy::default(),
    };
    policy.validate()?;
    Ok(policy)
}

/// Echo backend that can be told to die, for exercising restarts
struct FaultyBackend {
    inner: EchoBackend,
    handled: u64,
    exit_after: Option<u64>,
}

impl RenderBackend for FaultyBackend {
    fn handle(&mut self, command: &RenderCommand) -> RenderResult {
        if self.exit_after.is_some_and(|limit| self.handled >= limit) {
            tracing::warn!(handled = self.handled, "exiting on request");
            std::process::exit(3);
        }
        self.handled += 1;
        self.inner.handle(command)
    }
}
