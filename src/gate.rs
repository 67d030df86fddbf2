use core::fmt;

use anyhow::{Context, Result};
use nix::{
    fcntl::OFlag,
    unistd::{pipe2, write},
};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Holds the wrapped command back until the parent releases it.
///
/// The [`GateEnd`] is handed to the namespace tool, which blocks reading it
/// before exec'ing the command. EOF unblocks the tool as well, so a gate
/// must outlive any namespace that could still start unreleased.
pub struct StartGate {
    writer: OwnedFd,
    released: bool,
}

/// Read end of the gate, inherited by the namespace tool.
#[derive(Debug)]
pub struct GateEnd {
    reader: OwnedFd,
}

impl GateEnd {
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

impl AsFd for GateEnd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

impl StartGate {
    pub fn new() -> Result<(Self, GateEnd)> {
        let (reader, writer) =
            pipe2(OFlag::O_CLOEXEC).context("Failed to create start gate pipe")?;

        let gate = Self {
            writer,
            released: false,
        };

        Ok((gate, GateEnd { reader }))
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Lets the wrapped command start. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        write(&self.writer, b"1").context("Failed to release start gate")?;
        self.released = true;
        Ok(())
    }
}

impl fmt::Debug for StartGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartGate")
            .field("fd", &self.writer)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::read;

    #[test]
    fn test_release_once() -> Result<()> {
        let (mut gate, end) = StartGate::new()?;
        assert!(!gate.is_released());

        gate.release()?;
        gate.release()?;
        assert!(gate.is_released());

        drop(gate);

        let mut buffer = [0u8; 8];
        assert_eq!(read(&end, &mut buffer)?, 1);
        assert_eq!(read(&end, &mut buffer)?, 0);
        Ok(())
    }
}
