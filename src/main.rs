//! blockhost - session host for a multiplayer voxel world
//!
//! Loads the host config, prepares the shared world and account store, then
//! serves clients until the process is stopped.

use anyhow::{Context, Result};
use blockhost_core::LockFacility;
use blockhost_net::AuthMode;
use blockhost_server::{
    AccountStore, HostConfig, LoadStrategy, MemoryWorld, SessionHandle, SessionHost,
    SharedFacility, WorldGate,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::{env, io};
use tracing::{info, warn};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting blockhost v{}", env!("CARGO_PKG_VERSION"));

    let cli = CliOptions::parse(env::args().skip(1));
    let config = cli.apply(HostConfig::load_from_path(&cli.config_path));

    let mut accounts = AccountStore::new();
    if let Some(dir) = &config.accounts_dir {
        let report = accounts
            .load_from_directory(dir, LoadStrategy::SkipFailures)
            .with_context(|| format!("loading accounts from {}", dir.display()))?;
        info!(loaded = report.loaded, skipped = report.skipped, "accounts loaded");
    } else if config.auth_mode == AuthMode::Key {
        warn!("key authentication without an accounts directory; every login will fail");
    }

    let facility = Arc::new(LockFacility::new(MemoryWorld::default(), accounts));
    let mut host = SessionHost::bind(config.clone(), Arc::clone(&facility), ())
        .context("failed to start session host")?;

    let simulation = spawn_simulation(facility, host.handle(), &config)
        .context("failed to start simulation thread")?;

    let served = host.run().context("session host failed");
    host.shutdown();
    if simulation.join().is_err() {
        warn!("simulation thread panicked");
    }
    served
}

/// Advance the world clock every tick until the host stops.
fn spawn_simulation<W: WorldGate>(
    facility: SharedFacility<W>,
    handle: SessionHandle,
    config: &HostConfig,
) -> io::Result<JoinHandle<()>> {
    let interval = config.tick_interval();
    thread::Builder::new()
        .name("simulation".to_owned())
        .spawn(move || {
            while handle.is_running() {
                thread::sleep(interval);
                facility.world().borrow_mut().tick();
            }
        })
}

/// Command-line overrides for the host config.
#[derive(Debug, Default, PartialEq)]
struct CliOptions {
    config_path: PathBuf,
    port: Option<u16>,
    bind_address: Option<IpAddr>,
    accounts_dir: Option<PathBuf>,
    auth_mode: Option<AuthMode>,
}

impl CliOptions {
    fn parse<I: Iterator<Item = String>>(mut args: I) -> Self {
        let mut opts = CliOptions {
            config_path: PathBuf::from(blockhost_server::config::DEFAULT_CONFIG_PATH),
            ..CliOptions::default()
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    if let Some(path) = args.next() {
                        opts.config_path = PathBuf::from(path);
                    } else {
                        tracing::error!("--config requires a file path");
                    }
                }
                "--port" => {
                    if let Some(raw) = args.next() {
                        match raw.parse::<u16>() {
                            Ok(value) => opts.port = Some(value),
                            Err(err) => {
                                tracing::error!(%err, value = %raw, "--port must be a port number");
                            }
                        }
                    } else {
                        tracing::error!("--port requires a port number");
                    }
                }
                "--bind" => {
                    if let Some(raw) = args.next() {
                        match raw.parse::<IpAddr>() {
                            Ok(value) => opts.bind_address = Some(value),
                            Err(err) => {
                                tracing::error!(%err, value = %raw, "--bind must be an IP address");
                            }
                        }
                    } else {
                        tracing::error!("--bind requires an IP address");
                    }
                }
                "--accounts" => {
                    if let Some(path) = args.next() {
                        opts.accounts_dir = Some(PathBuf::from(path));
                    } else {
                        tracing::error!("--accounts requires a directory path");
                    }
                }
                "--auth" => match args.next().as_deref() {
                    Some("open") => opts.auth_mode = Some(AuthMode::Open),
                    Some("key") => opts.auth_mode = Some(AuthMode::Key),
                    Some(other) => {
                        tracing::error!(value = %other, "--auth must be `open` or `key`");
                    }
                    None => tracing::error!("--auth requires `open` or `key`"),
                },
                other => tracing::warn!(arg = %other, "ignoring unknown argument"),
            }
        }

        opts
    }

    fn apply(&self, mut config: HostConfig) -> HostConfig {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(addr) = self.bind_address {
            config.bind_address = addr;
        }
        if let Some(dir) = &self.accounts_dir {
            config.accounts_dir = Some(dir.clone());
        }
        if let Some(mode) = self.auth_mode {
            config.auth_mode = mode;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliOptions {
        CliOptions::parse(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn flags_override_config() {
        let cli = parse(&["--port", "4000", "--auth", "key", "--accounts", "acct"]);
        let config = cli.apply(HostConfig::default());
        assert_eq!(config.port, 4000);
        assert_eq!(config.auth_mode, AuthMode::Key);
        assert_eq!(config.accounts_dir, Some(PathBuf::from("acct")));
        assert_eq!(config.max_connections, HostConfig::default().max_connections);
    }

    #[test]
    fn bad_values_are_ignored() {
        let cli = parse(&["--port", "huge", "--bind", "nowhere", "--auth", "maybe"]);
        assert_eq!(cli.port, None);
        assert_eq!(cli.bind_address, None);
        assert_eq!(cli.auth_mode, None);
        assert_eq!(cli.apply(HostConfig::default()), HostConfig::default());
    }

    #[test]
    fn config_path_defaults() {
        let cli = parse(&[]);
        assert_eq!(
            cli.config_path,
            PathBuf::from(blockhost_server::config::DEFAULT_CONFIG_PATH)
        );
    }
}
