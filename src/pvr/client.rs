use super::{ChannelAuthorizer, LiveStreamSession, RecordingStreamSession};
use crate::config::ClientConfig;
use crate::format::ts::FillerStream;
use crate::format::vtp::{
    BackendEvents, ControlChannel, DataChannel, DataStreamId, NotificationListener,
};
use crate::Result;
use log::{debug, error, warn};
use std::io::SeekFrom;
use std::sync::Arc;

/// Origin of a recording seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start
    Set,
    /// From the current position
    Cur,
    /// Back from the known end
    End,
    /// Only asks whether seeking is supported
    Possible,
}

/// Disk usage reported by `STAT disk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveSpace {
    /// Total size in MiB
    pub total_mb: u64,
    /// Free space in MiB
    pub free_mb: u64,
    /// Used space in percent
    pub used_percent: u8,
}

impl DriveSpace {
    /// Parses `<total>MB <free>MB <percent>%`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut fields = text.split_whitespace();
        let total_mb = fields.next()?.strip_suffix("MB")?.parse().ok()?;
        let free_mb = fields.next()?.strip_suffix("MB")?.parse().ok()?;
        let used_percent = fields.next()?.strip_suffix('%')?.parse().ok()?;
        Some(Self {
            total_mb,
            free_mb,
            used_percent,
        })
    }
}

/// Player-facing client for one streamdev backend.
///
/// Every call reports failure through its return value: `false`, `None`,
/// `0` or `-1`. Errors are logged here and never propagated. Live TV and
/// recording playback are mutually exclusive; opening one closes the other.
pub struct PvrClient {
    config: ClientConfig,
    control: Arc<ControlChannel>,
    live: LiveStreamSession,
    recording: RecordingStreamSession,
    notifications: Option<(DataChannel, NotificationListener)>,
}

impl PvrClient {
    /// Creates a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        let control = Arc::new(
            ControlChannel::new(&config.host, config.port)
                .with_connect_timeout(config.connect_timeout)
                .with_read_timeout(config.read_timeout)
                .with_busy_retry(config.busy_retries, config.busy_retry_interval),
        );
        let live = LiveStreamSession::new(control.clone(), &config, FillerStream::builtin());
        let recording = RecordingStreamSession::new(control.clone(), &config);

        Self {
            config,
            control,
            live,
            recording,
            notifications: None,
        }
    }

    /// Replaces the channel authorizer used by live TV.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn ChannelAuthorizer>) -> Self {
        self.live = self.live.with_authorizer(authorizer);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared control channel.
    pub fn control(&self) -> &Arc<ControlChannel> {
        &self.control
    }

    /// Connects to the backend and loads the filler stream.
    pub async fn connect(&mut self) -> bool {
        if let Err(e) = self.control.connect().await {
            debug!("connect failed: {}", e);
            return false;
        }
        let filler = FillerStream::load(self.config.no_signal_path.as_deref()).await;
        self.live.set_filler(filler);
        true
    }

    /// Closes all streams and the control connection.
    pub async fn disconnect(&mut self) {
        futures::join!(self.live.close(), self.recording.close());
        self.unsubscribe().await;
        self.control.quit().await;
    }

    /// Whether the control connection is up.
    pub fn is_connected(&self) -> bool {
        self.control.is_connected()
    }

    /// Opens the `DataResponse` stream and forwards its notifications.
    pub async fn subscribe(&mut self, events: Arc<dyn BackendEvents>) -> bool {
        self.unsubscribe().await;
        if !self.control.check_connection().await {
            return false;
        }

        let mut channel = DataChannel::new(self.control.clone(), DataStreamId::DataResponse)
            .with_accept_timeout(self.config.accept_timeout);
        match channel.open().await {
            Ok(socket) => {
                let listener = NotificationListener::spawn(socket, events);
                self.notifications = Some((channel, listener));
                true
            }
            Err(e) => {
                warn!("cannot open notification stream: {}", e);
                false
            }
        }
    }

    /// Stops forwarding notifications.
    pub async fn unsubscribe(&mut self) {
        if let Some((mut channel, mut listener)) = self.notifications.take() {
            listener.stop().await;
            channel.close().await;
        }
    }

    /// Opens live TV on `channel`.
    pub async fn open_live(&mut self, channel: u32) -> bool {
        self.recording.close().await;
        if !self.control.check_connection().await {
            return false;
        }
        report("open live channel", self.live.open(channel).await).is_some()
    }

    /// Reads whole TS packets (or filler) into `buf`.
    pub async fn read_live(&mut self, buf: &mut [u8]) -> usize {
        self.live.read(buf).await
    }

    /// Switches live TV to `channel`.
    pub async fn switch_channel(&mut self, channel: u32) -> bool {
        if !self.control.check_connection().await {
            return false;
        }
        report("switch channel", self.live.switch_channel(channel).await).is_some()
    }

    /// Stops live TV.
    pub async fn close_live(&mut self) {
        self.live.close().await;
    }

    /// Channel currently shown, if any.
    pub fn current_channel(&self) -> Option<u32> {
        self.live.current_channel()
    }

    /// Live session, for state and statistics.
    pub fn live(&self) -> &LiveStreamSession {
        &self.live
    }

    /// Opens recording `index` for playback.
    pub async fn open_recording(&mut self, index: u32) -> bool {
        self.live.close().await;
        if !self.control.check_connection().await {
            return false;
        }
        report("open recording", self.recording.open(index).await).is_some()
    }

    /// Reads recording bytes; `-1` on error, `0` when nothing is available.
    pub async fn read_recording(&mut self, buf: &mut [u8]) -> isize {
        match report("read recording", self.recording.read(buf).await) {
            Some(n) => n as isize,
            None => -1,
        }
    }

    /// Seeks the open recording.
    ///
    /// [`Whence::End`] counts `offset` back from the known size, so
    /// `seek_recording(100, Whence::End)` lands 100 bytes before the end.
    /// Returns the new position, `0` when the target lies beyond the known
    /// size, `1` for [`Whence::Possible`] and `-1` on error.
    pub async fn seek_recording(&mut self, offset: i64, whence: Whence) -> i64 {
        let pos = match whence {
            Whence::Possible => return 1,
            Whence::Set if offset < 0 => return -1,
            Whence::Set => SeekFrom::Start(offset as u64),
            Whence::Cur => SeekFrom::Current(offset),
            Whence::End => match offset.checked_neg() {
                Some(back) => SeekFrom::End(back),
                None => return -1,
            },
        };
        match report("seek recording", self.recording.seek(pos).await) {
            Some(Some(position)) => position as i64,
            Some(None) => 0,
            None => -1,
        }
    }

    /// Known size of the open recording; 0 when none is open.
    pub fn length_recording(&self) -> i64 {
        self.recording.length() as i64
    }

    /// Asks the backend for the current size of a recording that is still
    /// growing; `-1` on error.
    pub async fn refresh_recording_length(&mut self) -> i64 {
        match report("refresh recording size", self.recording.refresh_size().await) {
            Some(total) => total as i64,
            None => -1,
        }
    }

    /// Current playback position of the open recording.
    pub fn position_recording(&self) -> i64 {
        self.recording.position() as i64
    }

    /// Stops recording playback.
    pub async fn close_recording(&mut self) {
        self.recording.close().await;
    }

    /// Backend name from `STAT name`.
    pub async fn backend_name(&self) -> Option<String> {
        report("query backend name", self.control.stat("name").await)
    }

    /// Backend version from `STAT version`.
    pub async fn backend_version(&self) -> Option<String> {
        report("query backend version", self.control.stat("version").await)
    }

    /// Recording disk usage from `STAT disk`.
    pub async fn drive_space(&self) -> Option<DriveSpace> {
        let text = report("query disk", self.control.stat("disk").await)?;
        let space = DriveSpace::parse(&text);
        if space.is_none() {
            warn!("unexpected STAT disk reply: {:?}", text);
        }
        space
    }

    /// Number of channels from `STAT channels`.
    pub async fn channel_count(&self) -> Option<u32> {
        let text = report("query channel count", self.control.stat("channels").await)?;
        text.trim().parse().ok()
    }

    /// Raw payload lines of a list command such as `LSTC` or `LSTR`.
    pub async fn list(&self, command: &str) -> Option<Vec<String>> {
        report(command, self.control.list(command).await)
    }
}

impl std::fmt::Debug for PvrClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PvrClient")
            .field("endpoint", &self.control.endpoint())
            .field("live", &self.live)
            .field("recording", &self.recording)
            .field("subscribed", &self.notifications.is_some())
            .finish()
    }
}

fn report<T>(what: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!("{} failed: {}", what, e);
            None
        }
    }
}
