use super::{format_port_command, ControlChannel, DataStreamId, ProtocolError};
use crate::utils::ReadSource;
use crate::{Result, VtpError};
use log::{debug, warn};
use socket2::SockRef;
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

/// An accepted data connection for one [`DataStreamId`].
///
/// Cheap to clone; clones share the socket so a background reader and its
/// owner can both reach it.
#[derive(Debug, Clone)]
pub struct DataSocket {
    id: DataStreamId,
    peer: SocketAddr,
    stream: Arc<TcpStream>,
}

impl DataSocket {
    /// Wraps an already connected stream.
    pub fn from_stream(id: DataStreamId, stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            id,
            peer,
            stream: Arc::new(stream),
        })
    }

    /// Stream this socket belongs to.
    pub fn id(&self) -> DataStreamId {
        self.id
    }

    /// Address the backend connected from.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Waits up to `wait` for the socket to become readable.
    ///
    /// End of stream and socket errors count as readable; the following read
    /// reports them.
    pub async fn wait_readable(&self, wait: Duration) -> bool {
        matches!(timeout(wait, self.stream.readable()).await, Ok(Ok(())))
    }

    /// Non-blocking read.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    /// Reads at least one byte, or returns `Ok(0)` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }

    /// Shuts both directions down, waking any task blocked on the socket.
    pub fn shutdown(&self) {
        if let Err(e) = SockRef::from(self.stream.as_ref()).shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("{} data socket shutdown: {}", self.id, e);
            }
        }
    }
}

impl ReadSource for DataSocket {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }
}

/// Push-style data connection for one stream id.
///
/// `open` listens on an ephemeral port next to the control socket's local
/// address, advertises it with `PORT` and accepts the backend's connection.
/// `close` sends `ABRT` and shuts the socket down.
#[derive(Debug)]
pub struct DataChannel {
    id: DataStreamId,
    control: Arc<ControlChannel>,
    socket: Option<DataSocket>,
    accept_timeout: Option<Duration>,
}

impl DataChannel {
    /// Creates a closed channel for `id`.
    pub fn new(control: Arc<ControlChannel>, id: DataStreamId) -> Self {
        Self {
            id,
            control,
            socket: None,
            accept_timeout: None,
        }
    }

    /// Bounds how long `open` waits for the backend to connect back.
    /// `None` waits indefinitely.
    pub fn with_accept_timeout(mut self, accept_timeout: Option<Duration>) -> Self {
        self.accept_timeout = accept_timeout;
        self
    }

    /// Stream id of this channel.
    pub fn id(&self) -> DataStreamId {
        self.id
    }

    /// Whether a socket is currently open.
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// The open socket, if any.
    pub fn socket(&self) -> Option<&DataSocket> {
        self.socket.as_ref()
    }

    /// Opens a fresh data connection, closing any previous one first.
    ///
    /// Exactly one listener is created and it is always dropped before this
    /// returns.
    pub async fn open(&mut self) -> Result<DataSocket> {
        self.close().await;

        let local = self.control.local_addr().await?;
        let ip = match local.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => ip.to_ipv4_mapped().ok_or_else(|| {
                ProtocolError::Malformed(format!("cannot advertise IPv6 address {} in PORT", ip))
            })?,
        };

        let listener = TcpListener::bind(SocketAddrV4::new(ip, 0)).await?;
        let addr = match listener.local_addr()? {
            SocketAddr::V4(addr) => addr,
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "listener bound to non-IPv4 address {}",
                    other
                ))
                .into())
            }
        };

        debug!("waiting for {} data connection on {}", self.id, addr);
        self.control
            .send_command(&format_port_command(self.id, addr))
            .await?;

        let accepted = match self.accept_timeout {
            Some(limit) => match timeout(limit, listener.accept()).await {
                Ok(result) => result,
                Err(_) => {
                    drop(listener);
                    self.abort().await;
                    return Err(VtpError::Socket(format!(
                        "backend did not open the {} connection within {:?}",
                        self.id, limit
                    )));
                }
            },
            None => listener.accept().await,
        };
        drop(listener);

        let (stream, peer) = accepted?;
        debug!("{} data connection from {}", self.id, peer);

        let socket = DataSocket {
            id: self.id,
            peer,
            stream: Arc::new(stream),
        };
        self.socket = Some(socket.clone());
        Ok(socket)
    }

    /// Aborts the stream on the backend and closes the local socket.
    ///
    /// Calling this on a closed channel does nothing.
    pub async fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.abort().await;
            socket.shutdown();
            debug!("{} data connection closed", self.id);
        }
    }

    async fn abort(&self) {
        let command = format!("ABRT {}", self.id.as_u8());
        if let Err(e) = self.control.send_command(&command).await {
            warn!("could not abort {} stream: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn parse_port(args: &str) -> SocketAddr {
        let mut parts = args.split_whitespace();
        parts.next();
        let nums: Vec<u16> = parts
            .next()
            .unwrap()
            .split(',')
            .map(|n| n.parse().unwrap())
            .collect();
        let ip = std::net::Ipv4Addr::new(nums[0] as u8, nums[1] as u8, nums[2] as u8, nums[3] as u8);
        SocketAddr::from((ip, (nums[4] << 8) | nums[5]))
    }

    /// Backend that connects back on PORT and writes `payload` there.
    async fn backend(payload: &'static [u8], log: Arc<StdMutex<Vec<String>>>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write.write_all(b"220 ready\r\n").await.unwrap();
            let mut lines = BufReader::new(read).lines();
            let mut data = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                log.lock().unwrap().push(line.clone());
                if let Some(args) = line.strip_prefix("PORT ") {
                    write.write_all(b"220 Port ok\r\n").await.unwrap();
                    let mut out = TcpStream::connect(parse_port(args)).await.unwrap();
                    out.write_all(payload).await.unwrap();
                    data.push(out);
                } else {
                    write.write_all(b"220 ok\r\n").await.unwrap();
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn test_open_read_close() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let port = backend(b"hello", log.clone()).await;
        let control = Arc::new(ControlChannel::new("127.0.0.1", port));
        control.connect().await.unwrap();

        let mut channel = DataChannel::new(control, DataStreamId::Replay)
            .with_accept_timeout(Some(Duration::from_secs(5)));
        let socket = channel.open().await.unwrap();
        assert!(channel.is_open());
        assert_eq!(socket.id(), DataStreamId::Replay);

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        while got.len() < 5 {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"hello");

        channel.close().await;
        assert!(!channel.is_open());
        channel.close().await;

        let seen = log.lock().unwrap().clone();
        assert!(seen.iter().any(|l| l.starts_with("PORT 1 127,0,0,1,")));
        assert_eq!(seen.iter().filter(|l| *l == "ABRT 1").count(), 1);
    }

    #[tokio::test]
    async fn test_open_without_control_connection() {
        let control = Arc::new(ControlChannel::default());
        let mut channel = DataChannel::new(control, DataStreamId::Live);
        assert!(channel.open().await.is_err());
        assert!(!channel.is_open());
    }
}
