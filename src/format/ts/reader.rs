use super::types::{find_sync, TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::format::vtp::DataSocket;
use crate::utils::RingBuffer;
use crate::{Result, VtpError};
use log::{debug, info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default ring buffer size for a live stream.
pub const TS_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Default producer/consumer wait and socket poll interval.
pub const DEFAULT_TS_TIMEOUT: Duration = Duration::from_millis(100);

/// Tuning for a [`TsReader`].
#[derive(Debug, Clone)]
pub struct TsReaderOptions {
    /// Ring buffer size in bytes
    pub buffer_size: usize,
    /// How long the producer waits for room when the buffer is full
    pub put_timeout: Duration,
    /// How long `next_packet` waits for a ready block
    pub get_timeout: Duration,
    /// How long one readability poll of the socket lasts
    pub poll_interval: Duration,
}

impl Default for TsReaderOptions {
    fn default() -> Self {
        Self {
            buffer_size: TS_BUFFER_SIZE,
            put_timeout: DEFAULT_TS_TIMEOUT,
            get_timeout: DEFAULT_TS_TIMEOUT,
            poll_interval: DEFAULT_TS_TIMEOUT,
        }
    }
}

impl TsReaderOptions {
    /// Sets the ring buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the producer and consumer waits.
    pub fn with_timeouts(mut self, put_timeout: Duration, get_timeout: Duration) -> Self {
        self.put_timeout = put_timeout;
        self.get_timeout = get_timeout;
        self
    }

    /// Sets the socket poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

enum Block {
    Packet([u8; TS_PACKET_SIZE]),
    Skip(usize),
    Short,
}

/// Background reader turning a live data socket into aligned TS packets.
///
/// One task fills a [`RingBuffer`] (margin = one packet) from the socket;
/// the owner pulls packets with [`next_packet`](Self::next_packet), which
/// drops bytes up to the next sync byte whenever the stream is misaligned.
#[derive(Debug)]
pub struct TsReader {
    socket: DataSocket,
    buffer: Arc<RingBuffer>,
    alive: Arc<AtomicBool>,
    skipped: AtomicU64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TsReader {
    /// Allocates the buffer and starts the producer task.
    pub fn spawn(socket: DataSocket, options: TsReaderOptions) -> Result<Self> {
        let buffer = Arc::new(
            RingBuffer::new(
                options.buffer_size,
                TS_PACKET_SIZE,
                &format!("TS {}", socket.id()),
            )?
            .with_timeouts(options.put_timeout, options.get_timeout),
        );
        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(produce(
            socket.clone(),
            buffer.clone(),
            alive.clone(),
            cancel.clone(),
            options.poll_interval,
        ));

        Ok(Self {
            socket,
            buffer,
            alive,
            skipped: AtomicU64::new(0),
            cancel,
            task: Some(task),
        })
    }

    /// False once the socket reported end of stream or a fatal error.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Bytes discarded while resynchronizing.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// The underlying ring buffer, for statistics.
    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    /// Returns the next aligned packet, or `None` when no whole packet
    /// arrived within the get timeout.
    pub async fn next_packet(&self) -> Option<[u8; TS_PACKET_SIZE]> {
        loop {
            let block = self.buffer.get(classify).await?;
            match block {
                Block::Packet(packet) => {
                    self.buffer.del(TS_PACKET_SIZE);
                    return Some(packet);
                }
                Block::Skip(count) => {
                    self.buffer.del(count);
                    self.skipped.fetch_add(count as u64, Ordering::Relaxed);
                    warn!("{} stream: {}", self.socket.id(), VtpError::Desync(count));
                }
                Block::Short => return None,
            }
        }
    }

    /// Copies whole packets into `buf` until it is full or none is ready.
    pub async fn read_packets(&self, buf: &mut [u8]) -> usize {
        let mut filled = 0;
        while buf.len() - filled >= TS_PACKET_SIZE {
            match self.next_packet().await {
                Some(packet) => {
                    buf[filled..filled + TS_PACKET_SIZE].copy_from_slice(&packet);
                    filled += TS_PACKET_SIZE;
                }
                None => break,
            }
            if !self.buffer_has_packet() {
                break;
            }
        }
        filled
    }

    /// Stops the producer: cancel, shut the socket down, join.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.socket.shutdown();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("TS reader task ended abnormally: {}", e);
            }
        }
        self.buffer.clear();
    }

    fn buffer_has_packet(&self) -> bool {
        self.buffer.available() >= TS_PACKET_SIZE
    }
}

impl Drop for TsReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn classify(block: &[u8]) -> Block {
    if block[0] != TS_SYNC_BYTE {
        return match find_sync(&block[1..]) {
            Some(pos) => Block::Skip(pos + 1),
            None => Block::Skip(block.len()),
        };
    }
    if block.len() < TS_PACKET_SIZE {
        return Block::Short;
    }

    let mut packet = [0u8; TS_PACKET_SIZE];
    packet.copy_from_slice(&block[..TS_PACKET_SIZE]);
    Block::Packet(packet)
}

async fn produce(
    socket: DataSocket,
    buffer: Arc<RingBuffer>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    debug!("{} reader started", socket.id());
    loop {
        let readable = tokio::select! {
            _ = cancel.cancelled() => break,
            readable = socket.wait_readable(poll_interval) => readable,
        };
        if !readable {
            continue;
        }

        match buffer.read_from(&socket).await {
            Ok(0) => {
                info!("{} stream closed by backend", socket.id());
                break;
            }
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                warn!("{} stream read failed: {}", socket.id(), e);
                break;
            }
        }
    }
    alive.store(false, Ordering::Release);
    debug!("{} reader stopped", socket.id());
}
