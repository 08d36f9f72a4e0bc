//! SCPI over a raw TCP socket.
//!
//! Commands and replies are terminated by `\n`. Binary transfers use the
//! IEEE 488.2 definite-length block format `#<d><len><bytes>`, optionally
//! preceded by a short text header (`DAT1,`), followed by the terminator.

use super::ScpiTransport;
use crate::error::{AppResult, DaqError, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Default raw-socket SCPI port, used for `TCPIP::<host>::INSTR` resources.
pub const DEFAULT_PORT: u16 = 5025;

/// Longest text header accepted in front of a binary block.
const MAX_BLOCK_PREFIX: usize = 64;

/// Host and port parsed from a resource string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketResource {
    pub host: String,
    pub port: u16,
}

impl SocketResource {
    /// Parse `TCPIP[n]::<host>::INSTR` or `TCPIP[n]::<host>::<port>::SOCKET`.
    pub fn parse(resource: &str, default_port: u16) -> AppResult<Self> {
        let invalid = |reason: &str| {
            DaqError::Configuration(format!("invalid resource '{}': {}", resource, reason))
        };
        let parts: Vec<&str> = resource.split("::").collect();
        let interface = parts.first().map(|p| p.to_ascii_uppercase()).unwrap_or_default();
        if !interface.starts_with("TCPIP") {
            return Err(invalid("only TCPIP resources are supported"));
        }
        match parts.as_slice() {
            [_, host, kind] if kind.eq_ignore_ascii_case("INSTR") && !host.is_empty() => Ok(Self {
                host: host.to_string(),
                port: default_port,
            }),
            [_, host, port, kind] if kind.eq_ignore_ascii_case("SOCKET") && !host.is_empty() => {
                let port = port.parse().map_err(|_| invalid("bad port"))?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(invalid("expected TCPIP::<host>::INSTR or TCPIP::<host>::<port>::SOCKET")),
        }
    }
}

/// Line-terminated SCPI over TCP.
pub struct TcpTransport {
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl TcpTransport {
    /// Connect to the instrument.
    pub async fn connect(resource: &SocketResource, request_timeout: Duration) -> AppResult<Self> {
        let addr = format!("{}:{}", resource.host, resource.port);
        let stream = timeout(request_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DaqError::Startup(format!("connection timeout to {}", addr)))?
            .map_err(|e| DaqError::Startup(format!("failed to connect to {}: {}", addr, e)))?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        info!("Connected to oscilloscope at {}", addr);
        Ok(Self {
            stream: BufReader::new(stream),
            timeout: request_timeout,
        })
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        let line = format!("{}\n", command);
        let io = |e| TransportError::io(command, e);
        self.stream.get_mut().write_all(line.as_bytes()).await.map_err(io)?;
        self.stream.get_mut().flush().await.map_err(io)
    }

    async fn read_line(&mut self, command: &str) -> Result<String, TransportError> {
        let mut reply = String::new();
        match timeout(self.timeout, self.stream.read_line(&mut reply)).await {
            Ok(Ok(0)) => Err(TransportError::Closed {
                command: command.to_string(),
            }),
            Ok(Ok(_)) => Ok(reply.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(e)) => Err(TransportError::io(command, e)),
            Err(_) => Err(self.timed_out(command)),
        }
    }

    async fn read_block(&mut self) -> Result<Bytes, TransportError> {
        const WHAT: &str = "read_raw";
        let protocol = |reason: String| TransportError::Protocol {
            command: WHAT.to_string(),
            reason,
        };

        let mut prefix = Vec::new();
        let n = self
            .stream
            .read_until(b'#', &mut prefix)
            .await
            .map_err(|e| TransportError::io(WHAT, e))?;
        if n == 0 {
            return Err(TransportError::Closed {
                command: WHAT.to_string(),
            });
        }
        if prefix.last() != Some(&b'#') || prefix.len() > MAX_BLOCK_PREFIX {
            return Err(protocol(format!("no block header in {} bytes", prefix.len())));
        }

        let digits = self.stream.read_u8().await.map_err(|e| TransportError::io(WHAT, e))?;
        let digits = (digits as char)
            .to_digit(10)
            .ok_or_else(|| protocol(format!("bad length digit 0x{:02x}", digits)))?;

        let body = if digits == 0 {
            // Indefinite length: the terminator ends the block.
            let mut body = Vec::new();
            self.stream
                .read_until(b'\n', &mut body)
                .await
                .map_err(|e| TransportError::io(WHAT, e))?;
            if body.last() == Some(&b'\n') {
                body.pop();
            }
            body
        } else {
            let mut len_text = vec![0u8; digits as usize];
            self.stream
                .read_exact(&mut len_text)
                .await
                .map_err(|e| TransportError::io(WHAT, e))?;
            let len: usize = std::str::from_utf8(&len_text)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| protocol("bad block length".into()))?;
            let mut body = vec![0u8; len];
            self.stream
                .read_exact(&mut body)
                .await
                .map_err(|e| TransportError::io(WHAT, e))?;
            let mut terminator = String::new();
            self.stream
                .read_line(&mut terminator)
                .await
                .map_err(|e| TransportError::io(WHAT, e))?;
            body
        };
        debug!(bytes = body.len(), "Binary block received");
        Ok(Bytes::from(body))
    }

    fn timed_out(&self, command: &str) -> TransportError {
        TransportError::Timeout {
            command: command.to_string(),
            timeout: self.timeout,
        }
    }
}

#[async_trait]
impl ScpiTransport for TcpTransport {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        timeout(self.timeout, self.send(command))
            .await
            .map_err(|_| self.timed_out(command))?
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write(command).await?;
        self.read_line(command).await
    }

    async fn read_raw(&mut self) -> Result<Bytes, TransportError> {
        let request_timeout = self.timeout;
        match timeout(request_timeout, self.read_block()).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out("read_raw")),
        }
    }

    async fn clear(&mut self) -> Result<(), TransportError> {
        // Consume any data in BufReader's internal buffer
        let buffered = self.stream.buffer().len();
        if buffered > 0 {
            debug!("Flushing {} bytes from buffer", buffered);
            self.stream.consume(buffered);
        }

        // Drain whatever is already waiting on the socket
        let mut discard = [0u8; 256];
        loop {
            match timeout(Duration::from_millis(10), self.stream.get_mut().read(&mut discard)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => debug!("Flushed {} stale bytes from stream", n),
                Ok(Err(e)) => return Err(TransportError::io("clear", e)),
            }
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn resource_strings() {
        assert_eq!(
            SocketResource::parse("TCPIP::192.168.1.100::INSTR", DEFAULT_PORT).unwrap(),
            SocketResource {
                host: "192.168.1.100".into(),
                port: DEFAULT_PORT
            }
        );
        assert_eq!(
            SocketResource::parse("TCPIP0::scope.lab::1861::SOCKET", DEFAULT_PORT)
                .unwrap()
                .port,
            1861
        );
        assert!(SocketResource::parse("GPIB0::1::INSTR", DEFAULT_PORT).is_err());
        assert!(SocketResource::parse("TCPIP::host::x::SOCKET", DEFAULT_PORT).is_err());
        assert!(SocketResource::parse("TCPIP::::INSTR", DEFAULT_PORT).is_err());
    }

    async fn serve(reply: Vec<u8>) -> SocketResource {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            socket.get_mut().write_all(&reply).await.unwrap();
            // Keep the connection open until the client is done.
            let _ = socket.read_line(&mut line).await;
        });
        SocketResource {
            host: "127.0.0.1".into(),
            port,
        }
    }

    #[tokio::test]
    async fn query_reads_one_line() {
        let resource = serve(b"LECROY,WR9254M,0,9.2\n".to_vec()).await;
        let mut link = TcpTransport::connect(&resource, Duration::from_secs(1)).await.unwrap();
        assert_eq!(link.query("*IDN?").await.unwrap(), "LECROY,WR9254M,0,9.2");
    }

    #[tokio::test]
    async fn definite_length_block_is_binary_safe() {
        let mut reply = b"DAT1,#18".to_vec();
        reply.extend_from_slice(&[0x00, 0x0a, 0xff, 0x0a, 0x12, 0x34, 0x0a, 0x00]);
        reply.push(b'\n');
        let resource = serve(reply).await;

        let mut link = TcpTransport::connect(&resource, Duration::from_secs(1)).await.unwrap();
        link.write("C1:WF? DAT1").await.unwrap();
        let raw = link.read_raw().await.unwrap();
        assert_eq!(&raw[..], &[0x00, 0x0a, 0xff, 0x0a, 0x12, 0x34, 0x0a, 0x00]);
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let resource = serve(Vec::new()).await;
        let mut link = TcpTransport::connect(&resource, Duration::from_millis(50)).await.unwrap();
        let err = link.query("TRIG_MODE?").await.unwrap_err();
        assert_eq!(err.signature(), crate::error::FaultSignature::Timeout);
    }
}
