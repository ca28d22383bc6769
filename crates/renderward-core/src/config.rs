//! Supervisor, sandbox and IPC configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default shared-memory name used by the bridge
pub const DEFAULT_SHARED_MEMORY_NAME: &str = "RenderwardSharedMemory";

/// Default named-pipe name used by the bridge
pub const DEFAULT_PIPE_NAME: &str = "RenderwardPipe";

/// Default pipe name for the multi-client manager
pub const DEFAULT_MANAGER_PIPE_NAME: &str = "RenderwardManager";

/// Smallest accepted shared-memory region
pub const MIN_SHARED_MEMORY_SIZE: usize = 64 * 1024;

/// Largest accepted shared-memory region
pub const MAX_SHARED_MEMORY_SIZE: usize = 16 * 1024 * 1024;

/// Hard ceiling for a single pipe message
pub const MAX_PIPE_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// What the supervisor does when the child exits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Never restart
    Never,
    /// Restart on non-zero exit codes
    #[default]
    OnCrash,
    /// Restart on any exit
    Always,
    /// Restart on crash with exponentially growing delay
    ExponentialBackoff,
}

impl RestartPolicy {
    /// Delay before restart number `attempts` (0-based)
    ///
    /// `min(base * 2^min(attempts, 5), max)` for [`RestartPolicy::ExponentialBackoff`],
    /// `base` for everything else.
    #[must_use]
    pub fn delay(self, attempts: u32, base: Duration, max: Duration) -> Duration {
        match self {
            Self::ExponentialBackoff => {
                let factor = 1u32 << attempts.min(5);
                base.saturating_mul(factor).min(max)
            }
            Self::Never | Self::OnCrash | Self::Always => base,
        }
    }

    /// Whether an exit with `exit_code` warrants a restart under this policy
    #[must_use]
    pub const fn wants_restart(self, exit_code: i32) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::OnCrash | Self::ExponentialBackoff => exit_code != 0,
        }
    }
}

/// Network posture recorded for the child
///
/// Not enforced at the OS boundary; it is logged as a recommendation for
/// whoever manages the firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkPolicy {
    FullAccess,
    #[default]
    LocalhostOnly,
    Blocked,
    UserPrompt,
}

/// Which libraries the child is expected to load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DllPolicy {
    AllowAll,
    SignedOnly,
    #[default]
    ValidatedOnly,
    SystemOnly,
}

/// Hardening applied to the child before it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Put the child in a job object (cgroup on Linux)
    pub job_object: bool,
    pub max_memory_mb: u64,
    /// CPU hard cap, 1-100
    pub max_cpu_percent: u32,
    pub max_active_processes: u32,
    pub kill_on_job_close: bool,
    /// Parent cgroup used on Linux
    pub cgroup_parent: PathBuf,

    /// Lower the integrity level (Landlock write restriction on Linux)
    pub low_integrity: bool,
    /// Paths the child may still write when running at low integrity
    pub writable_paths: Vec<PathBuf>,
    pub restrict_ui_access: bool,

    pub mitigations: bool,
    pub dep: bool,
    pub aslr: bool,
    pub control_flow_guard: bool,
    pub prohibit_dynamic_code: bool,
    pub win32k_lockdown: bool,
    pub enforce_code_signing: bool,
    pub disable_extension_points: bool,

    pub reduce_privileges: bool,
    pub restricted_sids: bool,

    pub dll_policy: DllPolicy,
    pub trusted_dll_directory: Option<PathBuf>,
    pub network_policy: NetworkPolicy,
    pub allowed_hosts: Vec<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            job_object: true,
            max_memory_mb: 512,
            max_cpu_percent: 80,
            max_active_processes: 1,
            kill_on_job_close: true,
            cgroup_parent: PathBuf::from("/sys/fs/cgroup/renderward"),
            low_integrity: false,
            writable_paths: vec![std::env::temp_dir()],
            restrict_ui_access: false,
            mitigations: true,
            dep: true,
            aslr: true,
            control_flow_guard: true,
            prohibit_dynamic_code: false,
            win32k_lockdown: false,
            enforce_code_signing: false,
            disable_extension_points: true,
            reduce_privileges: true,
            restricted_sids: false,
            dll_policy: DllPolicy::ValidatedOnly,
            trusted_dll_directory: None,
            network_policy: NetworkPolicy::LocalhostOnly,
            allowed_hosts: Vec::new(),
        }
    }
}

impl SandboxPolicy {
    /// Create a new policy builder
    #[must_use]
    pub fn builder() -> SandboxPolicyBuilder {
        SandboxPolicyBuilder::default()
    }

    /// Policy with every optional protection switched off
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            job_object: false,
            mitigations: false,
            reduce_privileges: false,
            disable_extension_points: false,
            dll_policy: DllPolicy::AllowAll,
            network_policy: NetworkPolicy::FullAccess,
            ..Self::default()
        }
    }

    /// Reject values the OS layers cannot express
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_cpu_percent == 0 || self.max_cpu_percent > 100 {
            return Err(crate::RenderwardError::Config(format!(
                "max_cpu_percent must be 1-100, got {}",
                self.max_cpu_percent
            )));
        }
        if self.job_object && self.max_active_processes == 0 {
            return Err(crate::RenderwardError::Config(
                "max_active_processes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for SandboxPolicy
#[derive(Debug, Default)]
pub struct SandboxPolicyBuilder {
    policy: SandboxPolicy,
}

impl SandboxPolicyBuilder {
    #[must_use]
    pub fn job_object(mut self, enabled: bool) -> Self {
        self.policy.job_object = enabled;
        self
    }

    #[must_use]
    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.policy.max_memory_mb = mb;
        self
    }

    #[must_use]
    pub fn max_cpu_percent(mut self, percent: u32) -> Self {
        self.policy.max_cpu_percent = percent.clamp(1, 100);
        self
    }

    #[must_use]
    pub fn max_active_processes(mut self, count: u32) -> Self {
        self.policy.max_active_processes = count;
        self
    }

    #[must_use]
    pub fn low_integrity(mut self, enabled: bool) -> Self {
        self.policy.low_integrity = enabled;
        self
    }

    #[must_use]
    pub fn writable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy.writable_paths.push(path.into());
        self
    }

    #[must_use]
    pub fn mitigations(mut self, enabled: bool) -> Self {
        self.policy.mitigations = enabled;
        self
    }

    #[must_use]
    pub fn prohibit_dynamic_code(mut self, enabled: bool) -> Self {
        self.policy.prohibit_dynamic_code = enabled;
        self
    }

    #[must_use]
    pub fn win32k_lockdown(mut self, enabled: bool) -> Self {
        self.policy.win32k_lockdown = enabled;
        self
    }

    #[must_use]
    pub fn reduce_privileges(mut self, enabled: bool) -> Self {
        self.policy.reduce_privileges = enabled;
        self
    }

    #[must_use]
    pub fn restrict_ui_access(mut self, enabled: bool) -> Self {
        self.policy.restrict_ui_access = enabled;
        self
    }

    #[must_use]
    pub fn network_policy(mut self, policy: NetworkPolicy) -> Self {
        self.policy.network_policy = policy;
        self
    }

    #[must_use]
    pub fn dll_policy(mut self, policy: DllPolicy) -> Self {
        self.policy.dll_policy = policy;
        self
    }

    #[must_use]
    pub fn build(self) -> SandboxPolicy {
        self.policy
    }
}

/// Transport resources handed to the child on its command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcEndpoints {
    pub shared_memory: Option<String>,
    pub named_pipe: Option<String>,
}

impl IpcEndpoints {
    /// Command-line arguments understood by the child
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(name) = &self.shared_memory {
            args.push(format!("--shared-memory={name}"));
        }
        if let Some(name) = &self.named_pipe {
            args.push(format!("--named-pipe={name}"));
        }
        args
    }

    /// Pick the endpoints out of a child's argument list
    #[must_use]
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut endpoints = Self {
            shared_memory: None,
            named_pipe: None,
        };
        for arg in args {
            let arg = arg.as_ref();
            if let Some(name) = arg.strip_prefix("--shared-memory=") {
                endpoints.shared_memory = Some(name.to_string());
            } else if let Some(name) = arg.strip_prefix("--named-pipe=") {
                endpoints.named_pipe = Some(name.to_string());
            }
        }
        endpoints
    }
}

/// How to start and keep the renderer process alive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Defaults to the executable's directory
    pub working_dir: Option<PathBuf>,
    pub ipc: Option<IpcEndpoints>,

    pub restart_policy: RestartPolicy,
    pub max_restart_attempts: u32,
    pub restart_delay_ms: u64,
    pub max_restart_delay_ms: u64,
    /// How long one liveness wait lasts in the monitor loop
    pub monitor_interval_ms: u64,

    pub sandbox: SandboxPolicy,
    pub hide_console: bool,
    pub inherit_handles: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            args: Vec::new(),
            working_dir: None,
            ipc: None,
            restart_policy: RestartPolicy::OnCrash,
            max_restart_attempts: 5,
            restart_delay_ms: 1000,
            max_restart_delay_ms: 30_000,
            monitor_interval_ms: 1000,
            sandbox: SandboxPolicy::default(),
            hide_console: true,
            inherit_handles: false,
        }
    }
}

impl LaunchConfig {
    /// Create a new launch config builder
    #[must_use]
    pub fn builder(executable: impl Into<PathBuf>) -> LaunchConfigBuilder {
        LaunchConfigBuilder {
            config: Self {
                executable: executable.into(),
                ..Self::default()
            },
        }
    }

    /// Full argument list, transport arguments last
    #[must_use]
    pub fn command_line(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(ipc) = &self.ipc {
            args.extend(ipc.to_args());
        }
        args
    }

    #[must_use]
    pub fn restart_delay(&self, attempts: u32) -> Duration {
        self.restart_policy.delay(
            attempts,
            Duration::from_millis(self.restart_delay_ms),
            Duration::from_millis(self.max_restart_delay_ms),
        )
    }

    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

/// Builder for LaunchConfig
#[derive(Debug)]
pub struct LaunchConfigBuilder {
    config: LaunchConfig,
}

impl LaunchConfigBuilder {
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn ipc(mut self, endpoints: IpcEndpoints) -> Self {
        self.config.ipc = Some(endpoints);
        self
    }

    #[must_use]
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.config.restart_policy = policy;
        self
    }

    #[must_use]
    pub fn max_restart_attempts(mut self, attempts: u32) -> Self {
        self.config.max_restart_attempts = attempts;
        self
    }

    #[must_use]
    pub fn restart_delay(mut self, base: Duration, max: Duration) -> Self {
        self.config.restart_delay_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self.config.max_restart_delay_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.config.monitor_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn sandbox(mut self, policy: SandboxPolicy) -> Self {
        self.config.sandbox = policy;
        self
    }

    #[must_use]
    pub fn hide_console(mut self, hide: bool) -> Self {
        self.config.hide_console = hide;
        self
    }

    #[must_use]
    pub fn build(self) -> LaunchConfig {
        self.config
    }
}

/// Which transports the bridge uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpcMode {
    SharedMemory,
    NamedPipes,
    /// Shared memory first, pipe as fallback
    #[default]
    Hybrid,
}

impl IpcMode {
    #[must_use]
    pub const fn uses_shared_memory(self) -> bool {
        matches!(self, Self::SharedMemory | Self::Hybrid)
    }

    #[must_use]
    pub const fn uses_pipe(self) -> bool {
        matches!(self, Self::NamedPipes | Self::Hybrid)
    }
}

/// Settings for the render bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mode: IpcMode,
    pub shared_memory_name: String,
    pub shared_memory_size: usize,
    pub pipe_name: String,
    pub max_message_size: usize,
    pub default_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    /// Receive-loop wait per transport, also the timeout sweep period
    pub poll_interval_ms: u64,
    /// How long a write waits for an unread slot before giving up
    pub slot_wait_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: IpcMode::Hybrid,
            shared_memory_name: DEFAULT_SHARED_MEMORY_NAME.into(),
            shared_memory_size: 4 * 1024 * 1024,
            pipe_name: DEFAULT_PIPE_NAME.into(),
            max_message_size: 1024 * 1024,
            default_timeout_ms: 5000,
            handshake_timeout_ms: 2000,
            startup_timeout_ms: 10_000,
            poll_interval_ms: 100,
            slot_wait_ms: 50,
        }
    }
}

impl BridgeConfig {
    /// Same settings with resource names made unique to this process
    #[must_use]
    pub fn with_unique_names(mut self) -> Self {
        let suffix = format!("{}_{:x}", std::process::id(), crate::protocol::now_millis());
        self.shared_memory_name = format!("{}_{suffix}", self.shared_memory_name);
        self.pipe_name = format!("{}_{suffix}", self.pipe_name);
        self
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Endpoints the child should be told about
    #[must_use]
    pub fn endpoints(&self) -> IpcEndpoints {
        IpcEndpoints {
            shared_memory: self
                .mode
                .uses_shared_memory()
                .then(|| self.shared_memory_name.clone()),
            named_pipe: self.mode.uses_pipe().then(|| self.pipe_name.clone()),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.mode.uses_shared_memory()
            && !(MIN_SHARED_MEMORY_SIZE..=MAX_SHARED_MEMORY_SIZE).contains(&self.shared_memory_size)
        {
            return Err(crate::RenderwardError::Config(format!(
                "shared memory size {} outside {MIN_SHARED_MEMORY_SIZE}..={MAX_SHARED_MEMORY_SIZE}",
                self.shared_memory_size
            )));
        }
        if self.max_message_size == 0 || self.max_message_size > MAX_PIPE_MESSAGE_SIZE {
            return Err(crate::RenderwardError::Config(format!(
                "max message size {} outside 1..={MAX_PIPE_MESSAGE_SIZE}",
                self.max_message_size
            )));
        }
        Ok(())
    }
}

/// Role of a multi-client manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpcRole {
    Server,
    Client,
}

/// Settings for the multi-client manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub pipe_name: String,
    pub role: IpcRole,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub timeout_ms: u64,
    pub enable_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            pipe_name: default_manager_pipe_name(),
            role: IpcRole::Server,
            max_connections: 10,
            max_message_size: 64 * 1024,
            timeout_ms: 5000,
            enable_reconnect: true,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 5,
        }
    }
}

impl IpcConfig {
    #[must_use]
    pub fn server(pipe_name: impl Into<String>) -> Self {
        Self {
            pipe_name: pipe_name.into(),
            role: IpcRole::Server,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn client(pipe_name: impl Into<String>) -> Self {
        Self {
            pipe_name: pipe_name.into(),
            role: IpcRole::Client,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Get the manager pipe name from RENDERWARD_PIPE or the built-in default
pub fn default_manager_pipe_name() -> String {
    std::env::var("RENDERWARD_PIPE").unwrap_or_else(|_| DEFAULT_MANAGER_PIPE_NAME.to_string())
}
