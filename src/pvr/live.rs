use super::{ChannelAuthorizer, ProvisionAuthorizer};
use crate::config::ClientConfig;
use crate::format::ts::{FillerStream, TsReader, TsReaderOptions, TS_PACKET_SIZE};
use crate::format::vtp::{ControlChannel, DataChannel, DataStreamId, ProtocolError};
use crate::{Result, VtpError};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Where a live session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    /// Nothing opened yet
    Idle,
    /// Channel tuned and data socket open, nothing delivered yet
    Opened,
    /// Packets are flowing
    Reading,
    /// The data path died and is being rebuilt
    Reconnecting,
    /// Closed by the owner
    Closed,
}

/// Live TV for one channel at a time.
///
/// Reads never fail: a dead data socket triggers one recovery attempt, and
/// while that fails or the backend stays silent the filler stream is served
/// instead.
pub struct LiveStreamSession {
    control: Arc<ControlChannel>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    data: DataChannel,
    reader: Option<TsReader>,
    reader_options: TsReaderOptions,
    filler: FillerStream,
    priority: i32,
    channel: Option<u32>,
    state: LiveState,
    empty_polls: u32,
    empty_poll_limit: u32,
    recovery_interval: Duration,
    last_failed_recovery: Option<Instant>,
}

impl LiveStreamSession {
    /// Creates an idle session that authorizes channels with `PROV`.
    pub fn new(control: Arc<ControlChannel>, config: &ClientConfig, filler: FillerStream) -> Self {
        let data = DataChannel::new(control.clone(), DataStreamId::Live)
            .with_accept_timeout(config.accept_timeout);
        let reader_options = TsReaderOptions::default()
            .with_buffer_size(config.ts_buffer_size)
            .with_timeouts(config.poll_interval, config.poll_interval)
            .with_poll_interval(config.poll_interval);

        Self {
            authorizer: Arc::new(ProvisionAuthorizer::new(control.clone())),
            control,
            data,
            reader: None,
            reader_options,
            filler,
            priority: config.priority,
            channel: None,
            state: LiveState::Idle,
            empty_polls: 0,
            empty_poll_limit: config.empty_poll_limit.max(1),
            recovery_interval: config.recovery_interval,
            last_failed_recovery: None,
        }
    }

    /// Replaces the channel authorizer.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn ChannelAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Replaces the filler stream.
    pub fn set_filler(&mut self, filler: FillerStream) {
        self.filler = filler;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LiveState {
        self.state
    }

    /// Channel currently selected, if any.
    pub fn current_channel(&self) -> Option<u32> {
        self.channel
    }

    /// The active reader, for statistics.
    pub fn reader(&self) -> Option<&TsReader> {
        self.reader.as_ref()
    }

    /// Opens `channel`.
    ///
    /// A channel the backend will not provide fails with
    /// [`VtpError::StreamUnavailable`] and leaves the session untouched.
    pub async fn open(&mut self, channel: u32) -> Result<()> {
        self.authorize(channel).await?;
        self.stop_stream().await;

        if let Err(e) = self.start_stream(channel).await {
            self.stop_stream().await;
            self.channel = None;
            self.state = LiveState::Idle;
            return Err(e);
        }

        info!("live stream open on channel {}", channel);
        self.channel = Some(channel);
        self.state = LiveState::Opened;
        self.empty_polls = 0;
        self.last_failed_recovery = None;
        self.filler.rewind();
        Ok(())
    }

    /// Moves to another channel without touching the control connection.
    pub async fn switch_channel(&mut self, channel: u32) -> Result<()> {
        debug!("switching live stream to channel {}", channel);
        self.open(channel).await
    }

    /// Fills `buf` with whole TS packets and returns the byte count.
    ///
    /// Returns 0 only when no channel is open or when the stream is alive
    /// and merely had nothing ready during this poll.
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        let Some(channel) = self.channel else {
            return 0;
        };
        if buf.len() < TS_PACKET_SIZE {
            return 0;
        }

        let mut recovered = false;
        if !self.stream_usable() {
            if !self.recovery_due() {
                return self.filler.read(buf);
            }

            self.state = LiveState::Reconnecting;
            match self.recover(channel).await {
                Ok(()) => {
                    info!("live stream on channel {} recovered", channel);
                    self.last_failed_recovery = None;
                    self.state = LiveState::Opened;
                    recovered = true;
                }
                Err(e) => {
                    warn!("live stream recovery for channel {} failed: {}", channel, e);
                    self.last_failed_recovery = Some(Instant::now());
                    return self.filler.read(buf);
                }
            }
        }

        let (filled, alive) = match self.reader.as_ref() {
            Some(reader) => (reader.read_packets(buf).await, reader.is_alive()),
            None => (0, false),
        };

        if filled > 0 {
            if self.empty_polls >= self.empty_poll_limit {
                info!("live data on channel {} is back", channel);
            }
            self.empty_polls = 0;
            self.state = LiveState::Reading;
            return filled;
        }

        self.empty_polls = self.empty_polls.saturating_add(1);
        if self.empty_polls == self.empty_poll_limit {
            warn!(
                "no live data on channel {} for {} polls, serving filler",
                channel, self.empty_polls
            );
        }
        if recovered || !alive || self.empty_polls >= self.empty_poll_limit {
            return self.filler.read(buf);
        }
        0
    }

    /// Stops the stream and forgets the channel.
    pub async fn close(&mut self) {
        self.stop_stream().await;
        if let Some(channel) = self.channel.take() {
            info!("live stream on channel {} closed", channel);
        }
        self.state = LiveState::Closed;
    }

    async fn authorize(&self, channel: u32) -> Result<()> {
        if self.authorizer.can_stream(channel, self.priority).await? {
            Ok(())
        } else {
            Err(VtpError::StreamUnavailable(format!(
                "channel {} cannot be streamed at priority {}",
                channel, self.priority
            )))
        }
    }

    async fn start_stream(&mut self, channel: u32) -> Result<()> {
        self.control
            .send_command(&format!("TUNE {}", channel))
            .await?;
        let socket = self.data.open().await?;
        self.reader = Some(TsReader::spawn(socket, self.reader_options.clone())?);
        Ok(())
    }

    async fn stop_stream(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.stop().await;
        }
        self.data.close().await;
    }

    async fn recover(&mut self, channel: u32) -> Result<()> {
        self.stop_stream().await;
        if !self.control.check_connection().await {
            return Err(ProtocolError::Closed.into());
        }
        self.authorize(channel).await?;
        self.start_stream(channel).await
    }

    /// A dead reader still counts while it holds a whole packet.
    fn stream_usable(&self) -> bool {
        match self.reader.as_ref() {
            Some(reader) => {
                reader.is_alive() || reader.buffer().available() >= TS_PACKET_SIZE
            }
            None => false,
        }
    }

    fn recovery_due(&self) -> bool {
        match self.last_failed_recovery {
            Some(at) => at.elapsed() >= self.recovery_interval,
            None => true,
        }
    }
}

impl std::fmt::Debug for LiveStreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStreamSession")
            .field("channel", &self.channel)
            .field("state", &self.state)
            .field("empty_polls", &self.empty_polls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Deny;

    #[async_trait]
    impl ChannelAuthorizer for Deny {
        async fn can_stream(&self, _channel: u32, _priority: i32) -> Result<bool> {
            Ok(false)
        }
    }

    fn session() -> LiveStreamSession {
        LiveStreamSession::new(
            Arc::new(ControlChannel::default()),
            &ClientConfig::default(),
            FillerStream::builtin(),
        )
    }

    #[tokio::test]
    async fn test_denied_channel_has_no_side_effects() {
        let mut live = session().with_authorizer(Arc::new(Deny));
        let err = live.open(7).await.unwrap_err();
        assert!(matches!(err, VtpError::StreamUnavailable(_)));
        assert_eq!(live.state(), LiveState::Idle);
        assert_eq!(live.current_channel(), None);
        assert!(live.reader().is_none());
    }

    #[tokio::test]
    async fn test_read_without_channel_returns_nothing() {
        let mut live = session();
        let mut buf = vec![0u8; 10 * TS_PACKET_SIZE];
        assert_eq!(live.read(&mut buf).await, 0);
    }

    #[tokio::test]
    async fn test_open_without_backend_fails() {
        let mut live = session();
        assert!(live.open(1).await.is_err());
        assert_eq!(live.current_channel(), None);

        live.close().await;
        assert_eq!(live.state(), LiveState::Closed);
    }
}
