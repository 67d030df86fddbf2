use crate::template::CommandTemplate;
use anyhow::{Result, anyhow};
use clap::{Args, Parser, ValueEnum};
use std::{path::PathBuf, time::Duration};

const HEADING_PORTS: &str = "Ports";
const HEADING_NAMESPACES: &str = "Namespaces";
const HEADING_TOOLS: &str = "Tools";
const HEADING_TIMING: &str = "Timing";
const HEADING_DEBUG: &str = "Debug";

pub const USAGE: &str = "portwrap [-h] -p HOST_PORT -P GUEST_PORT COMMAND [COMMAND_ARG ...]";

#[derive(Parser, Debug)]
#[command(
    name = "portwrap",
    version,
    about = "Run a command in a network namespace, forwarding one host port into it",
    override_usage = USAGE
)]
pub struct Config {
    #[command(flatten)]
    pub ports: PortOptions,

    #[command(flatten)]
    pub namespace: NamespaceOptions,

    #[command(flatten)]
    pub tools: ToolOptions,

    #[command(flatten)]
    pub timing: TimingOptions,

    #[command(flatten)]
    pub debug: DebugOptions,

    /// Command to run; `{guest-port}` is replaced by the guest port
    #[arg(
        value_name = "COMMAND",
        required = true,
        num_args = 1..,
        trailing_var_arg = true
    )]
    pub command: Vec<String>,
}

impl Config {
    pub fn template(&self) -> CommandTemplate {
        CommandTemplate::new(self.command.clone())
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.namespace.sync
    }
}

#[derive(Args, Debug)]
pub struct PortOptions {
    #[arg(
        short = 'p',
        long,
        value_name = "HOST_PORT",
        help = "Host-accessible port",
        value_parser = clap::value_parser!(u16).range(1..),
        help_heading = HEADING_PORTS
    )]
    pub host_port: u16,

    #[arg(
        short = 'P',
        long,
        value_name = "GUEST_PORT",
        help = "Namespace-accessible port",
        value_parser = clap::value_parser!(u16).range(1..),
        help_heading = HEADING_PORTS
    )]
    pub guest_port: u16,
}

/// How the wrapped command is held back until forwarding is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SyncMode {
    /// The namespace tool blocks before exec until the forward is installed
    #[default]
    Gated,

    /// The command starts immediately and may race the forward
    Ungated,
}

#[derive(Args, Debug)]
pub struct NamespaceOptions {
    #[arg(
        long,
        value_enum,
        default_value_t = SyncMode::Gated,
        help = "Synchronization between forwarding and command start",
        help_heading = HEADING_NAMESPACES
    )]
    pub sync: SyncMode,

    #[arg(
        long = "no-unshare-user",
        action = clap::ArgAction::SetFalse,
        help = "Keep the caller's user namespace",
        help_heading = HEADING_NAMESPACES
    )]
    pub unshare_user: bool,
}

#[derive(Args, Debug)]
pub struct ToolOptions {
    #[arg(
        long,
        env = "PORTWRAP_BWRAP",
        default_value = "bwrap",
        help = "Namespace creation tool",
        help_heading = HEADING_TOOLS
    )]
    pub bwrap: PathBuf,

    #[arg(
        long,
        env = "PORTWRAP_SLIRP4NETNS",
        default_value = "slirp4netns",
        help = "User-mode network stack",
        help_heading = HEADING_TOOLS
    )]
    pub slirp4netns: PathBuf,
}

#[derive(Args, Debug)]
pub struct TimingOptions {
    #[arg(
        long,
        env = "PORTWRAP_INFO_TIMEOUT",
        value_name = "SECS",
        default_value = "30",
        value_parser = parse_seconds,
        help = "How long to wait for the namespace to report its pid",
        help_heading = HEADING_TIMING
    )]
    pub info_timeout: Duration,

    #[arg(
        long,
        env = "PORTWRAP_STARTUP_TIMEOUT",
        value_name = "SECS",
        default_value = "10",
        value_parser = parse_seconds,
        help = "How long to wait for the network stack control socket",
        help_heading = HEADING_TIMING
    )]
    pub startup_timeout: Duration,

    #[arg(
        long,
        env = "PORTWRAP_SETTLE",
        value_name = "SECS",
        default_value = "2",
        value_parser = parse_seconds,
        help = "Budget for connecting to the control socket once it exists",
        help_heading = HEADING_TIMING
    )]
    pub settle: Duration,
}

#[derive(Args, Debug)]
pub struct DebugOptions {
    #[arg(short, long, help = "Log at debug level", help_heading = HEADING_DEBUG)]
    pub verbose: bool,
}

fn parse_seconds(input: &str) -> Result<Duration> {
    let secs = input.trim().parse::<f64>()?;
    Duration::try_from_secs_f64(secs).map_err(|error| anyhow!("{input}: {error}"))
}
