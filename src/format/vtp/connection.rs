use super::{parse_response_line, ConnectError, ProtocolError, Response, MAX_LINE_LENGTH};
use crate::Result;
use bytes::{Buf, BytesMut};
use log::{debug, trace};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, Duration};

/// Per-line wait before a reply read counts as timed out.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Timed-out line reads tolerated within one reply.
pub const READ_ATTEMPTS: u32 = 3;

const PROBE_TIMEOUT: Duration = Duration::from_millis(10);

/// Line-level I/O on the VTP control socket.
#[derive(Debug)]
pub struct VtpConnection {
    stream: TcpStream,
    buffer: BytesMut,
    read_timeout: Duration,
    utf8: bool,
}

impl VtpConnection {
    /// Resolves `host` and connects to the first address that answers
    /// within `connect_timeout`.
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let target = format!("{}:{}", host, port);
        let lookup = timeout(connect_timeout, lookup_host(target.clone())).await;
        let addrs: Vec<SocketAddr> = match lookup {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => {
                debug!("lookup of {} failed: {}", target, e);
                return Err(ConnectError::Dns(target).into());
            }
            Err(_) => return Err(ConnectError::Timeout(target).into()),
        };
        if addrs.is_empty() {
            return Err(ConnectError::Dns(target).into());
        }

        let mut last_error = None;
        for addr in addrs {
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    debug!("control connection to {} established", addr);
                    return Ok(Self {
                        stream,
                        buffer: BytesMut::with_capacity(4096),
                        read_timeout: DEFAULT_READ_TIMEOUT,
                        utf8: true,
                    });
                }
                Ok(Err(e)) => {
                    last_error = Some(ConnectError::Refused {
                        addr: addr.to_string(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => last_error = Some(ConnectError::Timeout(addr.to_string())),
            }
        }

        Err(last_error.unwrap_or(ConnectError::Dns(target)).into())
    }

    /// Sets the per-line read timeout.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Selects UTF-8 (lossy) or Latin-1 decoding of reply lines.
    pub fn set_utf8(&mut self, utf8: bool) {
        self.utf8 = utf8;
    }

    /// Local end of the control socket; data listeners bind next to it.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Sends `line` followed by CRLF.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        trace!("> {}", line);
        let mut out = Vec::with_capacity(line.len() + 2);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one CRLF- or LF-terminated line.
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let raw = self.buffer.split_to(pos + 1);
                let mut end = pos;
                if end > 0 && raw[end - 1] == b'\r' {
                    end -= 1;
                }
                let line = self.decode(&raw[..end]);
                trace!("< {}", line);
                return Ok(line);
            }

            if self.buffer.len() > MAX_LINE_LENGTH {
                let len = self.buffer.len();
                self.buffer.advance(len);
                return Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH).into());
            }

            match timeout(self.read_timeout, self.stream.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => return Err(ProtocolError::Closed.into()),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ProtocolError::Timeout.into()),
            }
        }
    }

    /// Reads reply lines until the final one.
    ///
    /// Up to [`READ_ATTEMPTS`] line timeouts are tolerated before the reply is
    /// abandoned.
    pub async fn read_response(&mut self) -> Result<Response> {
        let mut lines = Vec::new();
        let mut timeouts = 0;

        loop {
            let line = match self.read_line().await {
                Ok(line) => line,
                Err(crate::VtpError::Protocol(ProtocolError::Timeout)) => {
                    timeouts += 1;
                    if timeouts >= READ_ATTEMPTS {
                        return Err(ProtocolError::Timeout.into());
                    }
                    debug!("reply timeout {}/{}", timeouts, READ_ATTEMPTS);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let parsed = parse_response_line(&line)?;
            lines.push(parsed.payload.to_string());
            if parsed.is_final {
                return Ok(Response {
                    code: parsed.code,
                    lines,
                });
            }
        }
    }

    /// Checks that the idle control socket is still usable.
    ///
    /// The server never sends outside a command exchange, so pending data is
    /// treated like end of stream.
    pub async fn probe(&mut self) -> bool {
        if !self.buffer.is_empty() {
            debug!("{} unsolicited bytes buffered on control socket", self.buffer.len());
            return false;
        }

        let mut byte = [0u8; 1];
        match timeout(PROBE_TIMEOUT, self.stream.peek(&mut byte)).await {
            Err(_) => true,
            Ok(Ok(0)) => {
                debug!("control socket closed by peer");
                false
            }
            Ok(Ok(_)) => {
                debug!("unsolicited data on control socket");
                false
            }
            Ok(Err(e)) => {
                debug!("control socket probe failed: {}", e);
                false
            }
        }
    }

    /// Half-closes the socket.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn decode(&self, raw: &[u8]) -> String {
        if self.utf8 {
            String::from_utf8_lossy(raw).into_owned()
        } else {
            raw.iter().map(|&b| b as char).collect()
        }
    }
}
