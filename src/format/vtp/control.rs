use super::connection::DEFAULT_READ_TIMEOUT;
use super::{codes, ConnectError, ProtocolError, Response, VtpConnection, DEFAULT_PORT};
use crate::utils::LogThrottle;
use crate::{Result, VtpError};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::time::Duration;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of attempts for a list command answered with 451.
pub const DEFAULT_BUSY_RETRIES: u32 = 5;

/// Default sleep between busy retries.
pub const DEFAULT_BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(750);

/// The single control connection to a streamdev backend.
///
/// Every exchange runs under one async mutex, so at most one command is in
/// flight no matter how many tasks share the channel. Callers waiting for
/// the lock queue on the mutex, not on the network.
#[derive(Debug)]
pub struct ControlChannel {
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    busy_retries: u32,
    busy_retry_interval: Duration,
    connection: Mutex<Option<VtpConnection>>,
    connected: AtomicBool,
    utf8: AtomicBool,
    failure_log: LogThrottle,
}

impl ControlChannel {
    /// Creates a disconnected channel for `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            busy_retries: DEFAULT_BUSY_RETRIES,
            busy_retry_interval: DEFAULT_BUSY_RETRY_INTERVAL,
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            utf8: AtomicBool::new(true),
            failure_log: LogThrottle::default(),
        }
    }

    /// Sets the TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-line reply timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets how often and how fast list commands are retried on 451.
    pub fn with_busy_retry(mut self, retries: u32, interval: Duration) -> Self {
        self.busy_retries = retries.max(1);
        self.busy_retry_interval = interval;
        self
    }

    /// `host:port` of the backend.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the last connect succeeded and nothing has failed since.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether the backend reported a UTF-8 charset.
    pub fn is_utf8(&self) -> bool {
        self.utf8.load(Ordering::Relaxed)
    }

    /// Opens the control connection, replacing any existing one.
    ///
    /// Reads the greeting, negotiates `CAPS TS` and asks for the backend
    /// charset. Failures are logged at most once per throttle interval.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        self.connect_locked(&mut guard).await
    }

    /// Returns true when a usable control connection exists afterwards.
    ///
    /// An idle connection that reports end of stream or unsolicited data is
    /// dropped and a fresh one is opened.
    pub async fn check_connection(&self) -> bool {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_mut() {
            if conn.probe().await {
                return true;
            }
            warn!("control connection to {} lost, reconnecting", self.endpoint());
            self.drop_connection(&mut guard);
        }
        self.connect_locked(&mut guard).await.is_ok()
    }

    /// Sends one command and returns its reply.
    ///
    /// Non-2xx codes are returned as [`ProtocolError::Status`], except a
    /// `550 No ...` reply, which yields an empty [`Response`]. I/O failures
    /// and timeouts drop the connection so the next
    /// [`check_connection`](Self::check_connection) reconnects.
    pub async fn send_command(&self, command: &str) -> Result<Response> {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or(ProtocolError::Closed)?;

        let result = match conn.write_line(command).await {
            Ok(()) => conn.read_response().await,
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if is_connection_fatal(&e) {
                    debug!("dropping control connection after {:?} failed: {}", command, e);
                    self.drop_connection(&mut guard);
                }
                return Err(e);
            }
        };

        if response.is_success() {
            Ok(response)
        } else if response.is_no_data() {
            debug!("{:?}: {}", command, response.message());
            Ok(Response {
                code: response.code,
                lines: Vec::new(),
            })
        } else {
            Err(ProtocolError::Status {
                code: response.code,
                message: response.message().to_string(),
            }
            .into())
        }
    }

    /// Runs a list command (`LSTC`, `LSTT`, `LSTR`, `LSTE ...`) and returns
    /// its payload lines, retrying while the backend answers busy.
    pub async fn list(&self, command: &str) -> Result<Vec<String>> {
        let mut attempt = 1;
        loop {
            match self.send_command(command).await {
                Err(VtpError::Protocol(ProtocolError::Status { code, .. }))
                    if code == codes::BUSY && attempt < self.busy_retries =>
                {
                    debug!(
                        "{:?}: backend busy, retry {}/{}",
                        command, attempt, self.busy_retries
                    );
                    attempt += 1;
                    tokio::time::sleep(self.busy_retry_interval).await;
                }
                result => return result.map(|response| response.lines),
            }
        }
    }

    /// Queries `STAT <topic>` and returns the reply text.
    pub async fn stat(&self, topic: &str) -> Result<String> {
        let response = self.send_command(&format!("STAT {}", topic)).await?;
        Ok(response.lines.join("\n"))
    }

    /// Local address of the control socket.
    pub async fn local_addr(&self) -> Result<SocketAddr> {
        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(conn) => conn.local_addr(),
            None => Err(ProtocolError::Closed.into()),
        }
    }

    /// Says goodbye and closes the control connection. Never fails.
    pub async fn quit(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(mut conn) = guard.take() {
            match conn.write_line("QUIT").await {
                Ok(()) => match conn.read_response().await {
                    Ok(response) if response.code == codes::CLOSING => {}
                    Ok(response) => debug!("QUIT answered with {}", response.code),
                    Err(e) => debug!("no reply to QUIT: {}", e),
                },
                Err(e) => debug!("cannot send QUIT: {}", e),
            }
            let _ = conn.shutdown().await;
            info!("disconnected from {}", self.endpoint());
        }
        self.connected.store(false, Ordering::Release);
    }

    async fn connect_locked(&self, slot: &mut Option<VtpConnection>) -> Result<()> {
        self.drop_connection(slot);

        match self.handshake().await {
            Ok(conn) => {
                *slot = Some(conn);
                self.connected.store(true, Ordering::Release);
                self.failure_log.reset();
                info!("connected to VTP backend at {}", self.endpoint());
                Ok(())
            }
            Err(e) => {
                if let Some(suppressed) = self.failure_log.admit() {
                    if suppressed > 0 {
                        error!(
                            "cannot connect to {}: {} ({} similar failures suppressed)",
                            self.endpoint(),
                            e,
                            suppressed
                        );
                    } else {
                        error!("cannot connect to {}: {}", self.endpoint(), e);
                    }
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<VtpConnection> {
        let mut conn = VtpConnection::connect(&self.host, self.port, self.connect_timeout)
            .await?
            .with_read_timeout(self.read_timeout);

        let greeting = conn
            .read_response()
            .await
            .map_err(|e| ConnectError::Greeting(e.to_string()))?;
        if greeting.code != codes::OK {
            return Err(ConnectError::Greeting(format!(
                "{} {}",
                greeting.code,
                greeting.message()
            ))
            .into());
        }
        debug!("greeting: {}", greeting.message());

        conn.write_line("CAPS TS").await?;
        let caps = conn
            .read_response()
            .await
            .map_err(|e| ConnectError::Negotiation(e.to_string()))?;
        if caps.code != codes::OK {
            return Err(ConnectError::Negotiation(format!(
                "CAPS TS answered {} {}",
                caps.code,
                caps.message()
            ))
            .into());
        }

        // Older servers do not know STAT; keep the UTF-8 default then.
        conn.write_line("STAT charset").await?;
        let charset = conn.read_response().await?;
        let utf8 = !charset.is_success() || charset.message().to_ascii_uppercase().contains("UTF-8");
        conn.set_utf8(utf8);
        self.utf8.store(utf8, Ordering::Relaxed);

        Ok(conn)
    }

    fn drop_connection(&self, slot: &mut Option<VtpConnection>) {
        slot.take();
        self.connected.store(false, Ordering::Release);
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

fn is_connection_fatal(error: &VtpError) -> bool {
    matches!(
        error,
        VtpError::Io(_)
            | VtpError::Protocol(ProtocolError::Closed)
            | VtpError::Protocol(ProtocolError::Timeout)
            | VtpError::Protocol(ProtocolError::LineTooLong(_))
            | VtpError::Protocol(ProtocolError::Malformed(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    type Handler = Arc<dyn Fn(&str) -> String + Send + Sync>;

    /// Accepts connections forever and answers each line via `handler`.
    async fn scripted(greeting: &'static str, handler: Handler) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    write.write_all(greeting.as_bytes()).await.unwrap();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply = handler(&line);
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    fn standard(line: &str) -> String {
        match line {
            "CAPS TS" => "220 Capability \"TS\" accepted\r\n".into(),
            "STAT charset" => "220 ISO-8859-15\r\n".into(),
            "LSTT" => "550 No timers defined\r\n".into(),
            "LSTC" => "250-1 ARD\r\n250 2 ZDF\r\n".into(),
            "QUIT" => "221 Bye\r\n".into(),
            _ => "500 Unknown command\r\n".into(),
        }
    }

    async fn connected(handler: Handler) -> ControlChannel {
        let port = scripted("220 VTP/1.0 ready\r\n", handler).await;
        let channel = ControlChannel::new("127.0.0.1", port);
        channel.connect().await.unwrap();
        channel
    }

    #[tokio::test]
    async fn test_connect_negotiates_caps_and_charset() {
        let channel = connected(Arc::new(standard)).await;
        assert!(channel.is_connected());
        assert!(!channel.is_utf8());
        assert!(channel.local_addr().await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_greeting() {
        let port = scripted("554 Access denied\r\n", Arc::new(standard)).await;
        let channel = ControlChannel::new("127.0.0.1", port);
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, VtpError::Connect(ConnectError::Greeting(_))));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_caps_rejected() {
        let port = scripted(
            "220 ready\r\n",
            Arc::new(|_: &str| "561 Capability unknown\r\n".to_string()),
        )
        .await;
        let channel = ControlChannel::new("127.0.0.1", port);
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(
            err,
            VtpError::Connect(ConnectError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_send_command_statuses() {
        let channel = connected(Arc::new(standard)).await;

        let response = channel.send_command("LSTC").await.unwrap();
        assert_eq!(response.lines, vec!["1 ARD", "2 ZDF"]);

        let response = channel.send_command("LSTT").await.unwrap();
        assert!(response.lines.is_empty());

        match channel.send_command("FOO").await {
            Err(VtpError::Protocol(ProtocolError::Status { code, message })) => {
                assert_eq!(code, 500);
                assert_eq!(message, "Unknown command");
            }
            other => panic!("unexpected {:?}", other),
        }
        // A status failure keeps the connection.
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let channel = ControlChannel::default();
        let err = channel.send_command("STAT name").await.unwrap_err();
        assert!(matches!(err, VtpError::Protocol(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_list_retries_while_busy() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler: Handler = Arc::new(move |line: &str| {
            if line == "LSTR" {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return "451 Busy\r\n".into();
                }
                return "250 1 Movie\r\n".into();
            }
            standard(line)
        });
        let channel = connected(handler)
            .await
            .with_busy_retry(5, Duration::from_millis(5));

        let lines = channel.list("LSTR").await.unwrap();
        assert_eq!(lines, vec!["1 Movie"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_list_gives_up_after_retries() {
        let handler: Handler = Arc::new(|line: &str| match line {
            "LSTR" => "451 Busy\r\n".into(),
            other => standard(other),
        });
        let channel = connected(handler)
            .await
            .with_busy_retry(2, Duration::from_millis(5));

        let err = channel.list("LSTR").await.unwrap_err();
        assert!(matches!(
            err,
            VtpError::Protocol(ProtocolError::Status { code: 451, .. })
        ));
    }

    #[tokio::test]
    async fn test_check_connection_reconnects() {
        let channel = connected(Arc::new(standard)).await;
        assert!(channel.check_connection().await);

        channel.quit().await;
        assert!(!channel.is_connected());
        assert!(channel.check_connection().await);
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let channel = ControlChannel::new("127.0.0.1", port);
        assert!(!channel.check_connection().await);
        assert!(channel.connect().await.is_err());
    }
}
