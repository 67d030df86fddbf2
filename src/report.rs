use crate::error::PortwrapError;
use anyhow::{Context, Result};
use log::debug;
use nix::{
    errno::Errno,
    fcntl::OFlag,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    unistd::{pipe2, read},
};
use serde::Deserialize;
use std::{
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    time::{Duration, Instant},
};

/// Upper bound on a single `poll()` so interrupts are noticed promptly.
const POLL_SLICE: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 4096;

/// Metadata the namespace tool reports once the namespace exists.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NamespaceInfo {
    /// Pid of the wrapped command, in the caller's pid namespace.
    #[serde(rename = "child-pid")]
    pub child_pid: i32,

    #[serde(rename = "net-namespace", default)]
    pub net_namespace: Option<u64>,
}

/// One-shot channel over which the namespace tool reports its metadata.
#[derive(Debug)]
pub struct ReportChannel {
    /// Read end of the pipe
    reader: OwnedFd,

    /// Write end of the pipe
    writer: OwnedFd,
}

impl ReportChannel {
    /// Create new instance of `ReportChannel`
    pub fn new() -> Result<Self> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC)
            .context("Failed to create pipe for namespace metadata")?;

        Ok(Self { reader, writer })
    }

    /// Splits into the parent's reader and the end handed to the tool.
    pub fn split(self) -> (ReportReader, ReportWriter) {
        (
            ReportReader {
                reader: self.reader,
            },
            ReportWriter {
                writer: self.writer,
            },
        )
    }
}

/// Child-side end. Its descriptor number goes on the tool's command line.
#[derive(Debug)]
pub struct ReportWriter {
    writer: OwnedFd,
}

impl ReportWriter {
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.writer.as_raw_fd()
    }
}

impl AsFd for ReportWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.writer.as_fd()
    }
}

/// Parent-side end.
#[derive(Debug)]
pub struct ReportReader {
    reader: OwnedFd,
}

impl ReportReader {
    /// Blocks until a complete report arrives, the channel closes, `timeout`
    /// passes or `interrupted` returns a signal. The deadline covers the
    /// whole report, not just its first byte. Consumes the channel.
    pub fn receive<F>(self, timeout: Duration, interrupted: F) -> Result<NamespaceInfo>
    where
        F: Fn() -> Option<i32>,
    {
        let deadline = Instant::now() + timeout;
        let mut received = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(signal) = interrupted() {
                return Err(PortwrapError::Interrupted { signal }.into());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let reason = if is_blank(&received) {
                    format!("no metadata reported within {timeout:?}")
                } else {
                    format!("metadata report incomplete after {timeout:?}")
                };
                return Err(PortwrapError::namespace(reason).into());
            }

            let slice = remaining.min(POLL_SLICE);
            let mut fds = [PollFd::new(self.reader.as_fd(), PollFlags::POLLIN)];

            match poll(&mut fds, PollTimeout::from(slice.as_millis() as u16)) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(error) => return Err(error).context("Failed to poll metadata channel"),
            }

            // Readable, so this does not block.
            let n = match read(&self.reader, &mut chunk) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(error) => return Err(error).context("Failed to read metadata channel"),
            };

            if n == 0 {
                debug!("metadata channel closed after {} bytes", received.len());
                return decode_report(&received)?.ok_or_else(|| {
                    let reason = if is_blank(&received) {
                        "namespace tool exited before reporting metadata".to_string()
                    } else {
                        format!(
                            "metadata report truncated: {}",
                            String::from_utf8_lossy(&received).trim()
                        )
                    };
                    PortwrapError::namespace(reason).into()
                });
            }

            received.extend_from_slice(&chunk[..n]);
            if let Some(info) = decode_report(&received)? {
                return Ok(info);
            }
        }
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

/// Decodes the first report in `bytes`, or `None` while it is incomplete.
fn decode_report(bytes: &[u8]) -> Result<Option<NamespaceInfo>> {
    let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter::<NamespaceInfo>();

    let info = match stream.next() {
        None => return Ok(None),
        Some(Err(error)) if error.is_eof() => return Ok(None),
        Some(Err(error)) => {
            return Err(PortwrapError::namespace(format!("malformed metadata: {error}")).into());
        }
        Some(Ok(info)) => info,
    };

    if info.child_pid <= 0 {
        return Err(PortwrapError::namespace(format!(
            "reported invalid child pid {}",
            info.child_pid
        ))
        .into());
    }

    Ok(Some(info))
}
