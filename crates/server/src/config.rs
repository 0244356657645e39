//! Host configuration loaded from TOML.

use anyhow::{Context, Result};
use blockhost_net::{AuthMode, FLAG_PASSWORD, MAX_CLIENT_FRAME};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default config file looked up by the binary.
pub const DEFAULT_CONFIG_PATH: &str = "config/host.toml";

/// Port the host listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 2593;

/// Session host settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    /// Address to bind.
    pub bind_address: IpAddr,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// How logins are checked.
    pub auth_mode: AuthMode,
    /// Extra ServerInfo flag bits.
    pub server_flags: u8,
    /// Player limit. Connections beyond it are closed on accept.
    pub max_connections: usize,
    /// Upper bound on one reactor wait.
    pub select_timeout_ms: u64,
    /// Unparsed bytes buffered per connection before it is dropped.
    pub max_inbound_bytes: usize,
    /// Directory of `*.toml` account files.
    pub accounts_dir: Option<PathBuf>,
    /// Class of the entity created for each player.
    pub player_class: String,
    /// Simulation step length.
    pub tick_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            auth_mode: AuthMode::Open,
            server_flags: 0,
            max_connections: 16,
            select_timeout_ms: 50,
            max_inbound_bytes: 128 * 1024,
            accounts_dir: None,
            player_class: "base/human".to_owned(),
            tick_ms: 50,
        }
    }
}

impl HostConfig {
    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err:#}. Using defaults", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("Host config not found at {}. Using defaults", path.display());
                Self::default()
            }
            Err(err) => {
                warn!("Failed to read {}: {err}. Using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("invalid host config")
    }

    /// Save configuration to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Address the listener binds.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Flags announced in ServerInfo.
    pub fn announced_flags(&self) -> u8 {
        match self.auth_mode {
            AuthMode::Key => self.server_flags | FLAG_PASSWORD,
            AuthMode::Open => self.server_flags,
        }
    }

    /// Reactor wait bound.
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms.max(1))
    }

    /// Simulation step.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Per-connection receive cap, never below one maximal client frame.
    pub fn inbound_limit(&self) -> usize {
        if self.max_inbound_bytes < MAX_CLIENT_FRAME {
            warn!(
                configured = self.max_inbound_bytes,
                minimum = MAX_CLIENT_FRAME,
                "max_inbound_bytes too small for a valid frame, raising it"
            );
        }
        self.max_inbound_bytes.max(MAX_CLIENT_FRAME)
    }
}
