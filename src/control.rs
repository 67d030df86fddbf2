//! Client for the network stack's JSON control socket.

use crate::error::{ControlStage, PortwrapError};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    io::{self, Read, Write},
    net::Ipv4Addr,
    os::unix::net::UnixStream,
    path::Path,
    thread,
    time::{Duration, Instant},
};

/// Address the network stack assigns to the namespace side of its tap device.
pub const GUEST_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 100);
pub const HOST_ADDR: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

const RESPONSE_BYTES: usize = 1024;
const BACKOFF_START: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Host port to guest port, fixed for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub guest_port: u16,
}

impl PortMapping {
    pub fn new(host_port: u16, guest_port: u16) -> Self {
        Self {
            host_port,
            guest_port,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwardDirective {
    execute: &'static str,
    arguments: HostForward,
}

#[derive(Debug, Clone, Serialize)]
struct HostForward {
    proto: &'static str,
    host_addr: Ipv4Addr,
    host_port: u16,
    guest_addr: Ipv4Addr,
    guest_port: u16,
}

impl ForwardDirective {
    pub fn tcp(mapping: PortMapping) -> Self {
        Self {
            execute: "add_hostfwd",
            arguments: HostForward {
                proto: "tcp",
                host_addr: HOST_ADDR,
                host_port: mapping.host_port,
                guest_addr: GUEST_ADDR,
                guest_port: mapping.guest_port,
            },
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to encode forwarding directive")
    }
}

/// Installs one TCP forward and returns the peer's raw response.
///
/// The socket may exist before the peer accepts on it, so connecting is
/// retried with backoff for up to `settle`. Send and receive are tried once.
/// The response must be read before closing or the peer reports failure.
pub fn send_forward(socket: &Path, mapping: PortMapping, settle: Duration) -> Result<String> {
    let directive = ForwardDirective::tcp(mapping);
    let request = directive.to_json()?;
    info!("Sending {}", String::from_utf8_lossy(&request));

    let mut stream = connect_with_backoff(socket, settle)?;

    stream
        .write_all(&request)
        .map_err(|error| PortwrapError::control(socket, ControlStage::Send, error))?;

    let mut buffer = [0u8; RESPONSE_BYTES];
    let n = stream
        .read(&mut buffer)
        .map_err(|error| PortwrapError::control(socket, ControlStage::Receive, error))?;

    if n == 0 {
        return Err(PortwrapError::control(
            socket,
            ControlStage::EmptyResponse,
            io::Error::from(io::ErrorKind::UnexpectedEof),
        )
        .into());
    }

    let response = String::from_utf8_lossy(&buffer[..n]).into_owned();
    info!("Network stack replied: {}", response.trim_end());

    // The reply is not interpreted; an error object is only surfaced.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&response) {
        if let Some(error) = value.get("error") {
            warn!("Network stack reported an error for the forward: {error}");
        }
    }

    Ok(response)
}

fn connect_with_backoff(socket: &Path, budget: Duration) -> Result<UnixStream> {
    let started = Instant::now();
    let mut delay = BACKOFF_START;

    loop {
        match UnixStream::connect(socket) {
            Ok(stream) => return Ok(stream),
            Err(error) if is_transient(&error) && started.elapsed() + delay <= budget => {
                debug!(
                    "Control socket {} not accepting yet ({error}), retrying in {delay:?}",
                    socket.display()
                );
                thread::sleep(delay);
                delay = (delay * 2).min(BACKOFF_MAX);
            }
            Err(error) => {
                return Err(PortwrapError::control(socket, ControlStage::Connect, error).into());
            }
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}
