use std::{fmt, io, path::PathBuf, time::Duration};
use thiserror::Error;

/// Failures that end a single invocation.
///
/// Components return `anyhow::Result` and raise these as the root cause, so
/// callers can recover the category with `downcast_ref::<PortwrapError>()`.
#[derive(Debug, Error)]
pub enum PortwrapError {
    #[error("invalid arguments: {0}")]
    Argument(String),

    #[error("namespace creation failed: {reason}")]
    NamespaceCreation { reason: String },

    #[error("control socket {} did not appear within {:?}", socket.display(), waited)]
    StartupTimeout { socket: PathBuf, waited: Duration },

    #[error("control channel {} failed during {stage}: {source}", socket.display())]
    ControlChannel {
        socket: PathBuf,
        stage: ControlStage,
        #[source]
        source: io::Error,
    },

    #[error("interrupted by signal {signal}")]
    Interrupted { signal: i32 },
}

impl PortwrapError {
    pub fn namespace<S: Into<String>>(reason: S) -> Self {
        Self::NamespaceCreation {
            reason: reason.into(),
        }
    }

    pub fn control(socket: impl Into<PathBuf>, stage: ControlStage, source: io::Error) -> Self {
        Self::ControlChannel {
            socket: socket.into(),
            stage,
            source,
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted { signal } => 128 + signal,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStage {
    Connect,
    Send,
    Receive,
    EmptyResponse,
}

impl fmt::Display for ControlStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Connect => "connect",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::EmptyResponse => "receive (empty response)",
        };
        f.write_str(stage)
    }
}

/// Finds the categorised failure in an error chain, if any.
pub fn classify(error: &anyhow::Error) -> Option<&PortwrapError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<PortwrapError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_interrupt_exit_code() {
        let error = PortwrapError::Interrupted { signal: 2 };
        assert_eq!(error.exit_code(), 130);
        assert_eq!(PortwrapError::namespace("gone").exit_code(), 1);
    }

    #[test]
    fn test_classify_through_context() {
        let result: anyhow::Result<()> = Err(PortwrapError::namespace("no report"))
            .context("Failed to start namespace");

        let error = result.unwrap_err();
        assert!(matches!(
            classify(&error),
            Some(PortwrapError::NamespaceCreation { .. })
        ));
    }

    #[test]
    fn test_control_stage_in_message() {
        let error = PortwrapError::control(
            "/tmp/x.sock",
            ControlStage::Connect,
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        let message = error.to_string();
        assert!(message.contains("/tmp/x.sock"), "{message}");
        assert!(message.contains("connect"), "{message}");
    }
}
