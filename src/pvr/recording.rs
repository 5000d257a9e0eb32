use crate::config::ClientConfig;
use crate::format::vtp::{ControlChannel, DataChannel, DataSocket, DataStreamId};
use crate::{Result, VtpError};
use log::{debug, info, warn};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::time::{timeout_at, Duration, Instant};

const FLUSH_CHUNK: usize = 64 * 1024;

/// Playback of one recording over the `Replay` data stream.
///
/// The backend pushes the file from the requested offset on; this side
/// counts every byte taken off the socket so that after a `SEEK` it can
/// discard exactly what was already in flight.
#[derive(Debug)]
pub struct RecordingStreamSession {
    control: Arc<ControlChannel>,
    data: DataChannel,
    recording: Option<u32>,
    total: u64,
    frames: Option<u64>,
    position: u64,
    bytes_read: u64,
    first_read: bool,
    poll_interval: Duration,
    flush_timeout: Duration,
}

impl RecordingStreamSession {
    /// Creates a closed session.
    pub fn new(control: Arc<ControlChannel>, config: &ClientConfig) -> Self {
        let data = DataChannel::new(control.clone(), DataStreamId::Replay)
            .with_accept_timeout(config.accept_timeout);
        Self {
            control,
            data,
            recording: None,
            total: 0,
            frames: None,
            position: 0,
            bytes_read: 0,
            first_read: false,
            poll_interval: config.poll_interval,
            flush_timeout: config.seek_flush_timeout,
        }
    }

    /// Whether a recording is open.
    pub fn is_open(&self) -> bool {
        self.recording.is_some() && self.data.is_open()
    }

    /// Index of the open recording.
    pub fn recording(&self) -> Option<u32> {
        self.recording
    }

    /// Known total size in bytes.
    pub fn length(&self) -> u64 {
        self.total
    }

    /// Frame count reported by `PLAY`, when the backend sent one.
    pub fn frames(&self) -> Option<u64> {
        self.frames
    }

    /// Logical read position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes taken off the data socket since `open`, discarded ones included.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Seeking needs a known size.
    pub fn can_seek(&self) -> bool {
        self.is_open() && self.total > 0
    }

    /// Selects recording `index` with `PLAY` and opens the replay socket.
    pub async fn open(&mut self, index: u32) -> Result<()> {
        self.close().await;

        let response = self.control.send_command(&format!("PLAY {}", index)).await?;
        let mut fields = response.message().split_whitespace();
        let total: u64 = fields.next().unwrap_or("0").parse()?;
        let frames = fields.next().and_then(|f| f.parse().ok());
        if total == 0 {
            return Err(VtpError::StreamUnavailable(format!(
                "recording {} is empty",
                index
            )));
        }

        self.data.open().await?;

        self.recording = Some(index);
        self.total = total;
        self.frames = frames;
        self.position = 0;
        self.bytes_read = 0;
        self.first_read = true;
        info!("recording {} open, {} bytes", index, total);
        Ok(())
    }

    /// Reads the next bytes of the recording into `buf`.
    ///
    /// Returns `Ok(0)` at the end of the recording or when nothing arrived
    /// within one poll interval. The first read after `open` or `seek`
    /// waits for data. A socket that closes early is an error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let socket = self.socket()?;
        if buf.is_empty() || self.position >= self.total {
            return Ok(0);
        }

        if !self.first_read && !socket.wait_readable(self.poll_interval).await {
            return Ok(0);
        }
        self.first_read = false;

        let n = socket
            .read(buf)
            .await
            .map_err(|e| VtpError::Socket(format!("recording read failed: {}", e)))?;
        if n == 0 {
            return Err(VtpError::Socket(format!(
                "replay connection closed at {} of {} bytes",
                self.position, self.total
            )));
        }

        self.bytes_read += n as u64;
        self.position += n as u64;
        Ok(n)
    }

    /// Moves the read position.
    ///
    /// `SeekFrom::End(delta)` is relative to the known size. A target beyond the
    /// size returns `Ok(None)` and leaves the position unchanged.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<Option<u64>> {
        let socket = self.socket()?;

        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            SeekFrom::End(delta) => {
                if self.total == 0 {
                    return Err(VtpError::InvalidData("recording size unknown".into()));
                }
                i128::from(self.total) + i128::from(delta)
            }
        };
        if target < 0 {
            return Err(VtpError::InvalidData(format!(
                "seek to negative offset {}",
                target
            )));
        }
        if target > i128::from(self.total) {
            debug!("seek to {} beyond {} bytes ignored", target, self.total);
            return Ok(None);
        }
        let target = target as u64;
        if target == self.position {
            return Ok(Some(target));
        }

        let response = self.control.send_command(&format!("SEEK {}", target)).await?;
        let transmitted = response.first_number()?;
        self.flush_until(&socket, transmitted).await?;

        debug!("recording position {} -> {}", self.position, target);
        self.position = target;
        self.first_read = true;
        Ok(Some(target))
    }

    /// Refreshes the total size with `SIZE`, for recordings still growing.
    pub async fn refresh_size(&mut self) -> Result<u64> {
        self.socket()?;
        let response = self.control.send_command("SIZE").await?;
        self.total = response.first_number()?;
        Ok(self.total)
    }

    /// Aborts the replay stream. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.data.close().await;
        if let Some(index) = self.recording.take() {
            info!("recording {} closed", index);
        }
        self.total = 0;
        self.frames = None;
        self.position = 0;
        self.bytes_read = 0;
    }

    fn socket(&self) -> Result<DataSocket> {
        match (self.recording, self.data.socket()) {
            (Some(_), Some(socket)) => Ok(socket.clone()),
            _ => Err(VtpError::Socket("no recording open".into())),
        }
    }

    /// Discards bytes until `bytes_read` reaches what the backend had sent
    /// before honouring the seek.
    async fn flush_until(&mut self, socket: &DataSocket, transmitted: u64) -> Result<()> {
        if transmitted < self.bytes_read {
            warn!(
                "backend reports {} bytes sent but {} were received",
                transmitted, self.bytes_read
            );
            return Ok(());
        }

        let deadline = Instant::now() + self.flush_timeout;
        let mut scratch = vec![0u8; FLUSH_CHUNK];
        let mut discarded = 0u64;
        while self.bytes_read < transmitted {
            let want = (transmitted - self.bytes_read).min(FLUSH_CHUNK as u64) as usize;
            let n = timeout_at(deadline, socket.read(&mut scratch[..want]))
                .await
                .map_err(|_| {
                    VtpError::Socket(format!(
                        "seek flush timed out with {} bytes outstanding",
                        transmitted - self.bytes_read
                    ))
                })?
                .map_err(|e| VtpError::Socket(format!("seek flush failed: {}", e)))?;
            if n == 0 {
                return Err(VtpError::Socket("replay connection closed during seek".into()));
            }
            self.bytes_read += n as u64;
            discarded += n as u64;
        }
        if discarded > 0 {
            debug!("discarded {} in-flight bytes after seek", discarded);
        }
        Ok(())
    }
}
