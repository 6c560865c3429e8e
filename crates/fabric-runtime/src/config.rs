//! Layered runtime configuration (§4.K, §6).
//!
//! Assembled in order: built-in defaults, an optional TOML file, then
//! environment variable overrides. Invalid configuration is a caller-visible,
//! non-retryable error surfaced before any network activity — nothing here
//! touches the network or the filesystem beyond reading its own config file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable holding the credentials directory path.
pub const ENV_CREDENTIALS: &str = "FABRIC_CREDENTIALS";
/// Environment variable holding the inherited agent socket fd number.
pub const ENV_AGENT_FD: &str = "FABRIC_AGENT_FD";
/// Environment variable holding a comma-separated namespace-root override.
pub const ENV_NAMESPACE_ROOT: &str = "FABRIC_NAMESPACE_ROOT";
/// Environment variable overriding where the config file itself is read from.
pub const ENV_CONFIG_DIR: &str = "FABRIC_CONFIG_DIR";

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Where this principal's credentials are persisted.
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Roots the resolver starts every name resolution from.
    #[serde(default)]
    pub namespace: NamespaceConfig,
    /// Default listen behavior for servers started by this process.
    #[serde(default)]
    pub listen: ListenConfig,
    /// Security agent connection settings, if principal operations are
    /// delegated out of process.
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Where credentials live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Directory holding `privatekey.pem`, `blessingstore.data`, etc. Empty
    /// means platform default.
    #[serde(default)]
    pub dir: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self { dir: String::new() }
    }
}

/// The namespace roots a resolver consults first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Root mount-table endpoints, tried in order.
    #[serde(default)]
    pub roots: Vec<String>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self { roots: Vec::new() }
    }
}

/// Defaults for a [`fabric_transport::ListenSpec`] built by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address to bind to. `0.0.0.0:0` picks an OS-assigned ephemeral port.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Protocol name recorded in published endpoints.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Reverse-dial proxy address, if this process cannot accept inbound
    /// connections directly.
    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            protocol: default_protocol(),
            proxy: None,
        }
    }
}

/// Security agent connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Inherited agent socket file descriptor number, if principal
    /// operations are delegated to an out-of-process agent.
    #[serde(default)]
    pub socket_fd: Option<i32>,
    /// UNIX socket path, used instead of `socket_fd` when connecting to an
    /// agent not reached via an inherited descriptor.
    #[serde(default)]
    pub socket_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { socket_fd: None, socket_path: String::new() }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_protocol() -> String {
    "quic".to_string()
}

impl RuntimeConfig {
    /// Load configuration: start from defaults, layer in a TOML file at
    /// `config_path()` if one exists, then apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(ENV_CREDENTIALS) {
            self.credentials.dir = dir;
        }
        if let Ok(fd) = std::env::var(ENV_AGENT_FD) {
            if let Ok(fd) = fd.parse() {
                self.agent.socket_fd = Some(fd);
            }
        }
        if let Ok(roots) = std::env::var(ENV_NAMESPACE_ROOT) {
            self.namespace.roots = roots.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }
    }

    /// The credentials directory, falling back to a platform default under
    /// `$HOME` when unset.
    pub fn credentials_dir(&self) -> PathBuf {
        if self.credentials.dir.is_empty() {
            Self::default_credentials_dir()
        } else {
            PathBuf::from(&self.credentials.dir)
        }
    }

    fn config_path() -> PathBuf {
        if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
            return PathBuf::from(dir).join("fabric.toml");
        }
        Self::default_config_dir().join("fabric.toml")
    }

    fn default_config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            home_subdir("Library/Application Support/fabric")
        }
        #[cfg(target_os = "linux")]
        {
            home_subdir(".fabric")
        }
        #[cfg(target_os = "windows")]
        {
            home_subdir("fabric")
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            home_subdir(".fabric")
        }
    }

    fn default_credentials_dir() -> PathBuf {
        Self::default_config_dir().join("credentials")
    }
}

fn home_subdir(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/fabric"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_a_config_file() {
        let config = RuntimeConfig::default();
        assert_eq!(config.listen.bind_addr, "0.0.0.0:0");
        assert_eq!(config.listen.protocol, "quic");
        assert!(config.namespace.roots.is_empty());
        assert!(config.agent.socket_fd.is_none());
    }

    #[test]
    fn toml_round_trips() {
        let config = RuntimeConfig::default();
        let text = toml::to_string(&config).expect("serialize");
        let parsed: RuntimeConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.listen.bind_addr, config.listen.bind_addr);
    }

    #[test]
    fn namespace_root_env_override_splits_on_comma() {
        let mut config = RuntimeConfig::default();
        std::env::set_var(ENV_NAMESPACE_ROOT, "@5@quic@10.0.0.1:0@@0@@@@, @5@quic@10.0.0.2:0@@0@@@@");
        config.apply_env_overrides();
        std::env::remove_var(ENV_NAMESPACE_ROOT);
        assert_eq!(config.namespace.roots.len(), 2);
    }
}
