//! Service configuration
//!
//! Values come from the command line (or `VMCTL_*` environment variables),
//! then an optional TOML file, then built-in defaults.

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vmctl_common::{ExecutorSettings, FailureDetection};

/// Default listen address
pub const DEFAULT_LISTEN: &str = "0.0.0.0:25000";

/// Long flags that may also be written with a single dash (`-key`).
const LONG_FLAGS: &[&str] = &[
    "key",
    "listen",
    "config",
    "virsh",
    "connect",
    "failure-detection",
    "command-timeout",
    "debug",
];

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "vmctl")]
#[command(about = "Start or restart libvirt domains on behalf of signed HTTP requests")]
#[command(version)]
pub struct Cli {
    /// JWT key used to sign the exchanged data
    #[arg(short, long, env = "VMCTL_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Listen address [default: 0.0.0.0:25000]
    #[arg(short, long, env = "VMCTL_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short, long, env = "VMCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// virsh binary [default: virsh]
    #[arg(long, env = "VMCTL_VIRSH")]
    pub virsh: Option<String>,

    /// libvirt connection URI [default: qemu:///system]
    #[arg(long, env = "VMCTL_CONNECT")]
    pub connect: Option<String>,

    /// How a virsh run is judged: stderr-markers or exit-status
    #[arg(long)]
    pub failure_detection: Option<FailureDetection>,

    /// Kill a virsh run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub command_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Cli {
    /// Parse process arguments, accepting `-key` style long flags.
    pub fn parse_normalized() -> Self {
        Self::parse_from(normalize_args(std::env::args()))
    }
}

/// Rewrite single-dash long flags (`-key`, `-listen=...`) to their
/// double-dash form. Everything after `--` is left alone.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Vec::new();
    let mut passthrough = false;

    for arg in args {
        if passthrough || arg == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }

        let rewritten = arg
            .strip_prefix('-')
            .filter(|rest| !rest.starts_with('-'))
            .filter(|rest| {
                let name = rest.split('=').next().unwrap_or_default();
                LONG_FLAGS.contains(&name)
            })
            .map(|rest| format!("--{}", rest));

        out.push(rewritten.unwrap_or(arg));
    }

    out
}

/// On-disk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listen address
    pub listen: SocketAddr,

    /// Shared secret; the command line takes precedence
    pub key: Option<String>,

    /// virsh invocation settings
    pub executor: ExecutorSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 25000)),
            key: None,
            executor: ExecutorSettings::default(),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Fully resolved, immutable settings
#[derive(Clone)]
pub struct Settings {
    pub key: String,
    pub listen: SocketAddr,
    pub executor: ExecutorSettings,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("key", &"<redacted>")
            .field("listen", &self.listen)
            .field("executor", &self.executor)
            .finish()
    }
}

impl Settings {
    /// Merge command line over the config file over defaults.
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => ServiceConfig::load(path)?,
            None => ServiceConfig::default(),
        };
        Self::merge(cli, file)
    }

    pub fn merge(cli: &Cli, file: ServiceConfig) -> anyhow::Result<Self> {
        let key = cli
            .key
            .clone()
            .or(file.key)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("No JWT key provided, aborting."))?;

        let mut executor = file.executor;
        if let Some(virsh) = &cli.virsh {
            executor.binary = virsh.clone();
        }
        if let Some(connect) = &cli.connect {
            executor.connect_uri = connect.clone();
        }
        if let Some(detection) = cli.failure_detection {
            executor.failure_detection = detection;
        }
        if let Some(secs) = cli.command_timeout {
            executor.command_timeout = Some(Duration::from_secs(secs));
        }

        Ok(Self {
            key,
            listen: cli.listen.unwrap_or(file.listen),
            executor,
        })
    }
}
