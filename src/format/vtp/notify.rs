//! Listener for the `DataResponse` stream.
//!
//! The backend pushes short text lines here: user notifications
//! (`IMSG`, `WMSG`, `EMSG`) and change hints for timers (`MODT`, `DELT`,
//! `ADDT`) and channels (`MODC`, `DELC`, `ADDC`).

use super::{DataSocket, MAX_LINE_LENGTH};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Severity of a backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// `IMSG`
    Info,
    /// `WMSG`
    Warning,
    /// `EMSG`
    Error,
}

/// A user-facing message pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    /// Severity
    pub level: MessageLevel,
    /// Message text
    pub text: String,
    /// When the line was received
    pub received_at: DateTime<Utc>,
}

/// One decoded `DataResponse` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `IMSG`/`WMSG`/`EMSG <text>`
    Message(MessageLevel, String),
    /// `MODT`, `DELT` or `ADDT`
    TimersChanged,
    /// `MODC`, `DELC` or `ADDC`
    ChannelsChanged,
    /// Anything else, kept verbatim
    Unknown(String),
}

/// Decodes a line received on the `DataResponse` stream.
pub fn parse_notification(line: &str) -> Notification {
    let line = line.trim_end();
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command.to_ascii_uppercase().as_str() {
        "IMSG" => Notification::Message(MessageLevel::Info, rest.to_string()),
        "WMSG" => Notification::Message(MessageLevel::Warning, rest.to_string()),
        "EMSG" => Notification::Message(MessageLevel::Error, rest.to_string()),
        "MODT" | "DELT" | "ADDT" => Notification::TimersChanged,
        "MODC" | "DELC" | "ADDC" => Notification::ChannelsChanged,
        _ => Notification::Unknown(line.to_string()),
    }
}

/// Receiver of backend notifications.
#[async_trait]
pub trait BackendEvents: Send + Sync {
    /// A message meant for the user.
    async fn message(&self, message: BackendMessage);

    /// The timer list changed on the backend.
    async fn timers_changed(&self) {}

    /// The channel list changed on the backend.
    async fn channels_changed(&self) {}
}

/// Background task reading a `DataResponse` socket.
#[derive(Debug)]
pub struct NotificationListener {
    socket: DataSocket,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NotificationListener {
    /// Starts reading `socket` and dispatching to `events`.
    pub fn spawn(socket: DataSocket, events: Arc<dyn BackendEvents>) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen(socket.clone(), events, cancel.clone()));
        Self {
            socket,
            cancel,
            task: Some(task),
        }
    }

    /// Whether the task is still reading.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Cancels the task, shuts the socket down and waits for the task to end.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.socket.shutdown();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("notification listener ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn listen(socket: DataSocket, events: Arc<dyn BackendEvents>, cancel: CancellationToken) {
    let mut pending = BytesMut::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.read(&mut chunk) => match result {
                Ok(0) => {
                    debug!("backend closed the notification stream");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("notification stream read failed: {}", e);
                    break;
                }
            },
        };
        pending.extend_from_slice(&chunk[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw = pending.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw[..pos]);
            dispatch(line.trim_end_matches('\r'), events.as_ref()).await;
        }
        if pending.len() > MAX_LINE_LENGTH {
            warn!("dropping {} bytes of oversized notification", pending.len());
            pending.clear();
        }
    }
}

async fn dispatch(line: &str, events: &dyn BackendEvents) {
    if line.is_empty() {
        return;
    }
    match parse_notification(line) {
        Notification::Message(level, text) => {
            info!("backend message ({:?}): {}", level, text);
            events
                .message(BackendMessage {
                    level,
                    text,
                    received_at: Utc::now(),
                })
                .await;
        }
        Notification::TimersChanged => events.timers_changed().await,
        Notification::ChannelsChanged => events.channels_changed().await,
        Notification::Unknown(line) => debug!("unhandled backend notification: {}", line),
    }
}
