//! Custom error types for the device server.
//!
//! Two layers, both built with `thiserror`:
//!
//! - **`TransportError`**: a single request/response exchange with the
//!   oscilloscope failed (timeout, link error, closed socket, malformed
//!   binary block). Every transport error carries a [`FaultSignature`] so the
//!   trigger monitor can count consecutive faults of the same kind.
//! - **`DaqError`**: the crate-wide error. Wraps transport errors and adds the
//!   non-transport fault classes the control loop distinguishes:
//!   - **`Decode`**: a waveform payload was malformed or too short. Recovered
//!     by skipping that channel for the current cycle.
//!   - **`Coercion`**: an instrument reply could not be converted into the
//!     PV's value kind. Recovered by skipping that PV.
//!   - **`Startup`**: the transport could not be opened or the device did not
//!     identify itself. Fatal.
//!   - **`Template`**, **`UnknownPv`**, **`InvalidValue`**, **`ReadOnly`**:
//!     programming or client errors around the PV table.
//!   - **`Configuration`** / **`Config`**: semantic and parse errors in the
//!     server configuration.
//!
//! By using `#[from]`, `DaqError` is created from the underlying error types
//! with the `?` operator.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Classification key for a transport fault.
///
/// Two faults with the same signature are "the same fault" for the purpose of
/// consecutive-fault escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSignature {
    /// The device did not answer within the session timeout.
    Timeout,
    /// The underlying link reported an I/O error.
    Io,
    /// The device closed the connection.
    Closed,
    /// The device answered with something that is not valid framing.
    Protocol,
}

impl fmt::Display for FaultSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FaultSignature::Timeout => "ERR:TMO",
            FaultSignature::Io => "ERR:IO",
            FaultSignature::Closed => "ERR:CLOSED",
            FaultSignature::Protocol => "ERR:PROTOCOL",
        };
        write!(f, "{}", label)
    }
}

/// Failure of one exchange on the instrument link.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timeout after {timeout:?} waiting for reply to '{command}'")]
    Timeout { command: String, timeout: Duration },

    #[error("I/O error during '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed by device during '{command}'")]
    Closed { command: String },

    #[error("malformed reply to '{command}': {reason}")]
    Protocol { command: String, reason: String },
}

impl TransportError {
    /// Signature used for consecutive-fault counting.
    pub fn signature(&self) -> FaultSignature {
        match self {
            TransportError::Timeout { .. } => FaultSignature::Timeout,
            TransportError::Io { .. } => FaultSignature::Io,
            TransportError::Closed { .. } => FaultSignature::Closed,
            TransportError::Protocol { .. } => FaultSignature::Protocol,
        }
    }

    pub(crate) fn io(command: &str, source: std::io::Error) -> Self {
        TransportError::Io {
            command: command.to_string(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Transport fault: {0}")]
    Transport(#[from] TransportError),

    #[error("Waveform decode error on channel {channel}: {reason}")]
    Decode { channel: u8, reason: String },

    #[error("Cannot coerce '{text}' for PV '{pv}': {reason}")]
    Coercion {
        pv: String,
        text: String,
        reason: String,
    },

    #[error("Invalid command template for PV '{pv}': {reason}")]
    Template { pv: String, reason: String },

    #[error("Unknown PV '{0}'")]
    UnknownPv(String),

    #[error("PV '{0}' is read-only")]
    ReadOnly(String),

    #[error("Invalid value for PV '{pv}': {reason}")]
    InvalidValue { pv: String, reason: String },

    #[error("Control loop is not accepting requests")]
    LoopClosed,

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// The transport fault behind this error, if it is one.
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            DaqError::Transport(err) => Some(err),
            _ => None,
        }
    }

    /// Transport faults abort the remainder of a cycle; everything else only
    /// affects the item being processed.
    pub fn is_transport(&self) -> bool {
        matches!(self, DaqError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_follows_variant() {
        let timeout = TransportError::Timeout {
            command: "TRIG_MODE?".into(),
            timeout: Duration::from_millis(5000),
        };
        assert_eq!(timeout.signature(), FaultSignature::Timeout);
        assert_eq!(timeout.signature().to_string(), "ERR:TMO");

        let closed = TransportError::Closed {
            command: "*IDN?".into(),
        };
        assert_eq!(closed.signature(), FaultSignature::Closed);
    }

    #[test]
    fn transport_errors_convert_and_classify() {
        let err: DaqError = TransportError::io(
            "C1:WF? DAT1",
            std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        )
        .into();
        assert!(err.is_transport());
        assert_eq!(
            err.as_transport().map(TransportError::signature),
            Some(FaultSignature::Io)
        );
        assert!(err.to_string().contains("C1:WF? DAT1"));

        let decode = DaqError::Decode {
            channel: 2,
            reason: "short".into(),
        };
        assert!(!decode.is_transport());
        assert!(decode.as_transport().is_none());
    }
}
