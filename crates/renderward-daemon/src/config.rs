//! Host configuration

use anyhow::{Context, bail};
use renderward_core::{BridgeConfig, IpcConfig, IpcRole, LaunchConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "RENDERWARD_CONFIG";

/// Configuration for the host daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Multi-client manager; always run as a server
    pub manager: IpcConfig,

    /// Transports to the renderer
    pub bridge: BridgeConfig,

    /// Renderer process and its sandbox
    pub renderer: LaunchConfig,

    /// Suffix transport names with this process's id so hosts can coexist
    pub unique_names: bool,

    /// How often an unhealthy renderer is recovered (0 disables)
    pub health_check_interval_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        let renderer = LaunchConfig::builder(default_renderer()).arg("child").build();
        Self {
            manager: IpcConfig::default(),
            bridge: BridgeConfig::default(),
            renderer,
            unique_names: true,
            health_check_interval_ms: 5000,
        }
    }
}

/// The `renderward` binary next to this one, else whatever is on PATH
fn default_renderer() -> PathBuf {
    let name = if cfg!(windows) { "renderward.exe" } else { "renderward" };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}

impl HostConfig {
    /// Load from `path`, else from `RENDERWARD_CONFIG`, else the defaults
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let config: Self = serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?;
                tracing::info!(path = %path.display(), "configuration loaded");
                config
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.manager.role != IpcRole::Server {
            bail!("the host manager must run as a server");
        }
        if self.renderer.executable.as_os_str().is_empty() {
            bail!("no renderer executable configured");
        }
        self.bridge.validate()?;
        self.renderer.sandbox.validate()?;
        Ok(())
    }

    /// Bridge settings with unique names applied when requested
    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        if self.unique_names {
            self.bridge.clone().with_unique_names()
        } else {
            self.bridge.clone()
        }
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = HostConfig::default();
        config.validate().unwrap();
        assert_eq!(config.renderer.args, vec!["child".to_string()]);
        assert_eq!(config.health_check_interval(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"unique_names": false, "bridge": {{"mode": "NamedPipes"}}, "health_check_interval_ms": 0}}"#
        )
        .unwrap();

        let config = HostConfig::load(Some(file.path())).unwrap();
        assert!(!config.unique_names);
        assert_eq!(config.bridge.mode, renderward_core::IpcMode::NamedPipes);
        assert_eq!(config.bridge.max_message_size, BridgeConfig::default().max_message_size);
        assert_eq!(config.health_check_interval(), None);
        assert_eq!(config.bridge_config().pipe_name, config.bridge.pipe_name);
    }

    #[test]
    fn client_role_is_rejected() {
        let config = HostConfig {
            manager: IpcConfig::client("x"),
            ..HostConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unreadable_file_is_an_error() {
        assert!(HostConfig::load(Some(Path::new("/nonexistent/renderward.json"))).is_err());
    }

    #[test]
    fn unique_names_differ_from_configured() {
        let config = HostConfig::default();
        assert_ne!(config.bridge_config().pipe_name, config.bridge.pipe_name);
    }
}
