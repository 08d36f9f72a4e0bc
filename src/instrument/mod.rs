//! Instrument link.
//!
//! [`ScpiTransport`] is the request/response channel to the oscilloscope:
//! text writes, text queries, raw binary reads, buffer clear, and a timeout.
//! A transport is never used directly. [`InstrumentSession`] owns it behind an
//! async mutex and hands out an [`InstrumentGuard`] for the duration of one
//! exchange (or a group of exchanges that must not be interleaved, such as
//! "request waveform, read waveform"). The guard releases the link when it is
//! dropped.
//!
//! Implementations:
//! - [`tcp::TcpTransport`]: line-terminated SCPI over a TCP socket.
//! - [`mock::MockScope`]: scriptable simulated oscilloscope.

pub mod mock;
pub mod tcp;

use crate::error::{AppResult, DaqError, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{trace, warn};

/// Request/response channel to the instrument.
///
/// Methods take `&mut self`: exclusivity is enforced by [`InstrumentSession`].
#[async_trait]
pub trait ScpiTransport: Send {
    /// Send a command; no reply is read.
    async fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Send a query and read one line of reply, without the terminator.
    async fn query(&mut self, command: &str) -> Result<String, TransportError>;

    /// Read a binary reply to a previously written request.
    async fn read_raw(&mut self) -> Result<Bytes, TransportError>;

    /// Discard pending input.
    async fn clear(&mut self) -> Result<(), TransportError>;

    /// Current request timeout.
    fn timeout(&self) -> Duration;

    /// Change the request timeout.
    fn set_timeout(&mut self, timeout: Duration);
}

/// Shared instrument session.
///
/// At most one exchange is in flight at any time across all callers.
pub struct InstrumentSession {
    resource: String,
    transport: Mutex<Box<dyn ScpiTransport>>,
}

impl InstrumentSession {
    /// Wrap an opened transport.
    pub fn new(resource: impl Into<String>, transport: impl ScpiTransport + 'static) -> Self {
        Self {
            resource: resource.into(),
            transport: Mutex::new(Box::new(transport)),
        }
    }

    /// Resource identifier the session was opened with.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Acquire exclusive access to the link.
    pub async fn lock(&self) -> InstrumentGuard<'_> {
        InstrumentGuard {
            transport: self.transport.lock().await,
        }
    }

    /// Send a command, or a query when it contains `?`.
    ///
    /// Returns the reply of a query.
    pub async fn command(&self, command: &str) -> AppResult<Option<String>> {
        let mut link = self.lock().await;
        if command.contains('?') {
            Ok(Some(link.query(command).await?))
        } else {
            link.write(command).await?;
            Ok(None)
        }
    }

    /// Single write under its own lock scope.
    pub async fn write(&self, command: &str) -> AppResult<()> {
        self.lock().await.write(command).await
    }

    /// Single query under its own lock scope.
    pub async fn query(&self, command: &str) -> AppResult<String> {
        self.lock().await.query(command).await
    }

    /// Recover after a fault: drop late replies still in the input buffer,
    /// then clear the status and error registers. Best effort.
    pub async fn clear_status(&self) {
        let mut link = self.lock().await;
        if let Err(err) = link.clear().await {
            warn!(error = %err, "Failed to flush instrument input");
        }
        if let Err(err) = link.write(CLEAR_STATUS).await {
            warn!(error = %err, "Failed to clear instrument status");
        }
    }
}

/// Clears the event status register and the error queue.
pub const CLEAR_STATUS: &str = "*CLS";

/// Exclusive borrow of the instrument link.
pub struct InstrumentGuard<'a> {
    transport: MutexGuard<'a, Box<dyn ScpiTransport>>,
}

impl InstrumentGuard<'_> {
    /// Send a command.
    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        trace!(command, "scope write");
        self.transport.write(command).await.map_err(DaqError::from)
    }

    /// Send a query and return the trimmed reply.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        trace!(command, "scope query");
        let reply = self.transport.query(command).await?;
        let reply = reply.trim().to_string();
        trace!(command, reply = %reply, "scope reply");
        Ok(reply)
    }

    /// Query a numeric value (first token of the reply).
    pub async fn query_f64(&mut self, command: &str) -> AppResult<f64> {
        let reply = self.query(command).await?;
        parse_f64_response(command, &reply)
    }

    /// Read a binary reply.
    pub async fn read_raw(&mut self) -> AppResult<Bytes> {
        let raw = self.transport.read_raw().await?;
        trace!(bytes = raw.len(), "scope raw read");
        Ok(raw)
    }

    /// Discard pending input.
    pub async fn clear(&mut self) -> AppResult<()> {
        self.transport.clear().await.map_err(DaqError::from)
    }

    /// Current request timeout.
    pub fn timeout(&self) -> Duration {
        self.transport.timeout()
    }

    /// Change the request timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.transport.set_timeout(timeout);
    }
}

/// Parse a numeric reply; a trailing unit token is ignored.
pub fn parse_f64_response(command: &str, reply: &str) -> AppResult<f64> {
    let token = reply.split_whitespace().next().unwrap_or("");
    token.parse::<f64>().map_err(|e| DaqError::Coercion {
        pv: command.to_string(),
        text: reply.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::mock::MockScope;
    use super::*;

    #[tokio::test]
    async fn command_dispatches_on_question_mark() {
        let scope = MockScope::lecroy(2);
        let session = InstrumentSession::new("TCPIP::mock::INSTR", scope.clone());

        let reply = session.command("*IDN?").await.unwrap();
        assert!(reply.unwrap().contains("LECROY"));

        assert_eq!(session.command("TRIG_MODE NORM").await.unwrap(), None);
        assert_eq!(session.query("TRIG_MODE?").await.unwrap(), "NORM");
        assert!(scope.sent().contains(&"TRIG_MODE NORM".to_string()));
    }

    #[tokio::test]
    async fn guard_serializes_exchanges() {
        let scope = MockScope::lecroy(1);
        let session = std::sync::Arc::new(InstrumentSession::new("mock", scope.clone()));

        let guard = session.lock().await;
        let other = session.clone();
        let pending = tokio::spawn(async move { other.query("*IDN?").await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        drop(guard);
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn timeout_is_configurable() {
        let session = InstrumentSession::new("mock", MockScope::lecroy(1));
        let mut link = session.lock().await;
        assert_eq!(link.timeout(), Duration::from_millis(5000));
        link.set_timeout(Duration::from_millis(250));
        assert_eq!(link.timeout(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn late_reply_is_discarded_on_recovery() {
        use super::tcp::{SocketResource, TcpTransport};
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            // Answer the trigger query too late.
            tokio::time::sleep(Duration::from_millis(100)).await;
            socket.get_mut().write_all(b"AUTO\n").await.unwrap();
            loop {
                line.clear();
                if socket.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                if line.trim() == "C1:TRACE?" {
                    socket.get_mut().write_all(b"ON\n").await.unwrap();
                }
            }
        });

        let resource = SocketResource {
            host: "127.0.0.1".into(),
            port,
        };
        let transport = TcpTransport::connect(&resource, Duration::from_millis(50)).await.unwrap();
        let session = InstrumentSession::new("TCPIP::127.0.0.1::INSTR", transport);

        assert!(session.query("TRIG_MODE?").await.unwrap_err().is_transport());
        tokio::time::sleep(Duration::from_millis(150)).await;
        session.clear_status().await;
        assert_eq!(session.query("C1:TRACE?").await.unwrap(), "ON");
    }

    #[test]
    fn numeric_replies_tolerate_units() {
        assert_eq!(parse_f64_response("C1:VOLT_DIV?", "5.00E-01 V").unwrap(), 0.5);
        assert!(parse_f64_response("C1:VOLT_DIV?", "OFF").is_err());
    }
}
