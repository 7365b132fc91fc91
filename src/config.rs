//! Startup configuration: CLI flags, environment overrides and path layout.
//!
//! Flags are parsed with clap; anything unrecognised is ignored so older
//! launch scripts keep working across versions. The parsed flags resolve
//! into an immutable [`Settings`] passed to the bridge at initialisation.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Pacing between server node starts, overridable via
/// `MATTERBRIDGE_START_MATTER_INTERVAL_MS`.
const DEFAULT_START_MATTER_INTERVAL: Duration = Duration::from_millis(1000);

/// Pause after all nodes are up before plugins are configured, overridable
/// via `MATTERBRIDGE_PAUSE_MATTER_INTERVAL_MS`.
const DEFAULT_PAUSE_MATTER_INTERVAL: Duration = Duration::from_millis(500);

/// Operating mode of the bridge process. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// All plugins share one server node and one aggregator.
    Bridge,
    /// Each plugin owns its own server node.
    Childbridge,
    /// Controller mode (commissions other devices; no aggregation).
    Controller,
    /// Test mode: no network side effects beyond loopback.
    Test,
}

/// Log level for the bridge or the Matter engine logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Map onto the `log` crate filter. `notice` has no direct equivalent
    /// and rides on `info`; `fatal` rides on `error`.
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info | LogLevel::Notice => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error | LogLevel::Fatal => log::LevelFilter::Error,
        }
    }
}

/// Virtual device exposure mode (how helper devices appear in controllers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VirtualMode {
    #[default]
    Disabled,
    Light,
    Outlet,
    Switch,
}

/// Command line flags. Unknown flags are ignored rather than rejected.
#[derive(Debug, Parser)]
#[command(name = "matterbridge", about = "Matter bridge for heterogeneous smart-home devices", ignore_errors = true)]
pub struct Cli {
    /// Run in bridge mode: one server node, one aggregator (default).
    #[arg(long, group = "mode")]
    pub bridge: bool,

    /// Run in childbridge mode: one server node per plugin.
    #[arg(long, group = "mode")]
    pub childbridge: bool,

    /// Run in controller mode.
    #[arg(long, group = "mode")]
    pub controller: bool,

    /// Run in test mode.
    #[arg(long, group = "mode")]
    pub test: bool,

    /// Base directory; state lives in <homedir>/.matterbridge.
    #[arg(long, env = "MATTERBRIDGE_HOMEDIR")]
    pub homedir: Option<PathBuf>,

    /// Profile name; suffixes the storage directories.
    #[arg(long, env = "MATTERBRIDGE_PROFILE")]
    pub profile: Option<String>,

    /// Frontend port; 0 disables the WebSocket listener.
    #[arg(long, default_value_t = 8283)]
    pub frontend: u16,

    /// Matter server node port.
    #[arg(long, default_value_t = 5540)]
    pub port: u16,

    /// Commissioning passcode.
    #[arg(long, default_value_t = 20242025)]
    pub passcode: u32,

    /// Commissioning discriminator (12 bit).
    #[arg(long, default_value_t = 3840)]
    pub discriminator: u16,

    /// Network interface for mDNS advertising.
    #[arg(long)]
    pub mdnsinterface: Option<String>,

    /// Bind address for IPv4.
    #[arg(long)]
    pub ipv4address: Option<Ipv4Addr>,

    /// Bind address for IPv6.
    #[arg(long)]
    pub ipv6address: Option<Ipv6Addr>,

    /// Bridge log level.
    #[arg(long, value_enum, default_value = "info")]
    pub logger: LogLevel,

    /// Matter engine log level.
    #[arg(long, value_enum, default_value = "info")]
    pub matterlogger: LogLevel,

    /// Shortcut for --logger debug.
    #[arg(long)]
    pub debug: bool,

    /// Verbose engine logging.
    #[arg(long)]
    pub verbose: bool,

    /// Serve the frontend over TLS.
    #[arg(long)]
    pub ssl: bool,

    /// Never try to elevate privileges for the package tool.
    #[arg(long)]
    pub nosudo: bool,

    /// Running inside a container: skip host-specific probes.
    #[arg(long)]
    pub docker: bool,

    /// Do not expose virtual helper devices.
    #[arg(long)]
    pub novirtual: bool,

    /// Warn when process memory exceeds the watermark.
    #[arg(long)]
    pub memorycheck: bool,

    /// Enable the inspector endpoint.
    #[arg(long)]
    pub inspect: bool,

    /// Resource monitor sampling interval in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub snapshotinterval: u64,
}

/// Resolved, immutable runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub mode: Mode,
    /// `<homedir>/.matterbridge`.
    pub home_dir: PathBuf,
    pub profile: Option<String>,
    pub frontend_port: u16,
    pub matter_port: u16,
    pub passcode: u32,
    pub discriminator: u16,
    pub mdns_interface: Option<String>,
    pub ipv4_address: Option<Ipv4Addr>,
    pub ipv6_address: Option<Ipv6Addr>,
    pub logger_level: LogLevel,
    pub matter_logger_level: LogLevel,
    pub verbose: bool,
    pub ssl: bool,
    pub no_sudo: bool,
    pub docker: bool,
    pub no_virtual: bool,
    pub memory_check: bool,
    pub inspect: bool,
    pub virtual_mode: VirtualMode,
    #[serde(with = "duration_millis")]
    pub snapshot_interval: Duration,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Self {
        let mode = if cli.childbridge {
            Mode::Childbridge
        } else if cli.controller {
            Mode::Controller
        } else if cli.test {
            Mode::Test
        } else {
            Mode::Bridge
        };

        let base = cli
            .homedir
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            mode,
            home_dir: base.join(".matterbridge"),
            profile: cli.profile.clone(),
            frontend_port: cli.frontend,
            matter_port: cli.port,
            passcode: cli.passcode,
            discriminator: cli.discriminator,
            mdns_interface: cli.mdnsinterface.clone(),
            ipv4_address: cli.ipv4address,
            ipv6_address: cli.ipv6address,
            logger_level: if cli.debug { LogLevel::Debug } else { cli.logger },
            matter_logger_level: cli.matterlogger,
            verbose: cli.verbose,
            ssl: cli.ssl,
            no_sudo: cli.nosudo,
            docker: cli.docker,
            no_virtual: cli.novirtual,
            memory_check: cli.memorycheck,
            inspect: cli.inspect,
            virtual_mode: VirtualMode::default(),
            snapshot_interval: Duration::from_millis(cli.snapshotinterval.max(1000)),
        }
    }

    /// Node-level blob storage: `storage` or `storage.<profile>`.
    pub fn storage_dir(&self) -> PathBuf {
        self.home_dir.join(self.profiled("storage"))
    }

    /// Matter engine storage: `matterstorage` or `matterstorage.<profile>`.
    pub fn matter_storage_dir(&self) -> PathBuf {
        self.home_dir.join(self.profiled("matterstorage"))
    }

    fn profiled(&self, name: &str) -> String {
        match &self.profile {
            Some(profile) => format!("{name}.{profile}"),
            None => name.to_string(),
        }
    }

    pub fn start_matter_interval(&self) -> Duration {
        env_millis("MATTERBRIDGE_START_MATTER_INTERVAL_MS").unwrap_or(DEFAULT_START_MATTER_INTERVAL)
    }

    pub fn pause_matter_interval(&self) -> Duration {
        env_millis("MATTERBRIDGE_PAUSE_MATTER_INTERVAL_MS").unwrap_or(DEFAULT_PAUSE_MATTER_INTERVAL)
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
