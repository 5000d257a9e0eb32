//! # Linear Ring Buffer
//!
//! A bounded byte ring for one producer task and one consumer, modelled on
//! the classic "linear" ring buffer used by DVB software: the consumer is
//! always handed a single contiguous slice, never a pair of wrapped halves.
//!
//! ## Layout
//!
//! ```text
//!  0        margin                                   size
//!  ├─────────┼──────────────────────────────────────────┤
//!  │ reserve │            data region                   │
//!  └─────────┴──────────────────────────────────────────┘
//! ```
//!
//! Data normally lives in `[margin, size)`. The first `margin` bytes are a
//! reserve: when the unread region wraps and fewer than `margin` bytes are
//! left before the end of the arena, [`RingBufferLinear::get`] slides that
//! trailing remainder down into the reserve so it joins the bytes that
//! wrapped to `margin`. A longer remainder is handed out as it is; the bytes
//! at `margin` follow once it has been deleted. Either way a ready block is
//! one slice.
//!
//! Bytes slid into the reserve count against capacity like any others, so
//! `available()` never exceeds `size - margin - 1`.
//!
//! A block is *ready* when it holds at least `margin` bytes, so a consumer
//! that uses `margin == TS_PACKET_SIZE` never sees a partial packet.
//!
//! ## Example
//!
//! ```rust
//! use vtpio::utils::RingBufferLinear;
//!
//! # fn main() -> vtpio::Result<()> {
//! let mut ring = RingBufferLinear::new(1024, 4)?;
//! assert_eq!(ring.put(&[1u8; 600]), 600);
//! assert_eq!(ring.get().map(|b| b.len()), Some(600));
//! ring.del(600);
//!
//! // This put wraps around the end of the arena: the part before the end
//! // comes out first, the wrapped part after it.
//! assert_eq!(ring.put(&[2u8; 600]), 600);
//! assert_eq!(ring.get().map(|b| b.len()), Some(420));
//! ring.del(420);
//! assert_eq!(ring.get().map(|b| b.len()), Some(180));
//! # Ok(())
//! # }
//! ```

use super::throttle::LogThrottle;
use crate::error::{Result, VtpError};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Non-blocking byte source the producer side can drain into the arena.
///
/// The read happens while the arena lock is held, so implementations must
/// never block; report "nothing right now" as [`io::ErrorKind::WouldBlock`].
pub trait ReadSource {
    /// Reads available bytes into `buf`. `Ok(0)` means end of stream.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl ReadSource for tokio::net::TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::net::TcpStream::try_read(self, buf)
    }
}

impl<R: io::Read> ReadSource for Mutex<R> {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut *self.lock(), buf)
    }
}

/// Single-owner ring buffer arena. See the module docs for the layout.
pub struct RingBufferLinear {
    buffer: Box<[u8]>,
    margin: usize,
    head: usize,
    tail: usize,
    gotten: usize,
}

impl fmt::Debug for RingBufferLinear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBufferLinear")
            .field("size", &self.size())
            .field("margin", &self.margin)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("gotten", &self.gotten)
            .finish()
    }
}

impl RingBufferLinear {
    /// Creates an arena of `size` bytes with the given `margin`.
    ///
    /// `margin` may be at most `size / 2`, and at least two bytes must remain
    /// for data.
    pub fn new(size: usize, margin: usize) -> Result<Self> {
        if margin > size / 2 || size - margin < 2 {
            return Err(VtpError::Config(format!(
                "invalid ring buffer geometry: size {} margin {}",
                size, margin
            )));
        }

        Ok(Self {
            buffer: vec![0u8; size].into_boxed_slice(),
            margin,
            head: margin,
            tail: margin,
            gotten: 0,
        })
    }

    /// Total arena size in bytes.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Minimum size of a ready block.
    pub fn margin(&self) -> usize {
        self.margin
    }

    /// Bytes written but not yet deleted. Never exceeds `size - margin - 1`.
    pub fn available(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.size() - self.tail + self.head - self.margin
        }
    }

    /// Bytes a producer could still place, ignoring contiguity.
    ///
    /// This is also exactly what `put` accepts: with slid bytes in the
    /// reserve (`tail < margin`) it is smaller than the room left before the
    /// end of the arena, so a put never wraps onto them.
    pub fn free(&self) -> usize {
        (self.size() - self.margin - 1).saturating_sub(self.available())
    }

    /// Contiguous space before the wrap point, as used by `read_from`.
    pub fn read_space(&self) -> usize {
        self.free().min(self.size() - self.head)
    }

    /// Copies as much of `data` as currently fits and returns the count.
    ///
    /// A put may wrap once: the part that does not fit before the end of the
    /// arena continues at `margin`.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.free());
        if count == 0 {
            return 0;
        }

        let size = self.size();
        let rest = size - self.head;
        if count >= rest {
            let wrapped = count - rest;
            self.buffer[self.head..size].copy_from_slice(&data[..rest]);
            self.buffer[self.margin..self.margin + wrapped].copy_from_slice(&data[rest..count]);
            self.head = self.margin + wrapped;
        } else {
            self.buffer[self.head..self.head + count].copy_from_slice(&data[..count]);
            self.head += count;
        }
        count
    }

    /// Performs one `try_read` on `src` sized to the contiguous free space.
    ///
    /// Returns `Ok(0)` at end of stream. Source errors are forwarded as-is;
    /// when the arena is full no read is attempted and `WouldBlock` is
    /// returned.
    pub fn read_from<S: ReadSource + ?Sized>(&mut self, src: &S) -> io::Result<usize> {
        let space = self.read_space();
        if space == 0 {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "ring buffer full"));
        }

        let n = src.try_read(&mut self.buffer[self.head..self.head + space])?;
        if n > 0 {
            self.head += n;
            if self.head >= self.size() {
                self.head = self.margin;
            }
        }
        Ok(n)
    }

    /// Returns the next contiguous ready block, or `None` when fewer than
    /// `margin` (and at least one) bytes can be handed out in one piece.
    ///
    /// When the unread bytes wrap, the block ends at the end of the arena.
    pub fn get(&mut self) -> Option<&[u8]> {
        let size = self.size();
        if self.head < self.tail && size - self.tail < self.margin {
            // Slide the short trailing remainder into the reserve so it
            // directly precedes the bytes that wrapped to `margin`.
            let to = self.margin - (size - self.tail);
            self.buffer.copy_within(self.tail..size, to);
            self.tail = to;
        }

        let end = if self.head >= self.tail { self.head } else { size };
        let count = end - self.tail;
        if count == 0 || count < self.margin {
            self.gotten = 0;
            return None;
        }
        self.gotten = count;
        Some(&self.buffer[self.tail..end])
    }

    /// Marks `count` bytes of the last block returned by `get` as consumed.
    pub fn del(&mut self, count: usize) {
        let count = if count > self.gotten {
            error!(
                "ring buffer del({}) exceeds last get ({}), clamping",
                count, self.gotten
            );
            self.gotten
        } else {
            count
        };
        if count == 0 {
            return;
        }

        self.tail += count;
        self.gotten -= count;
        if self.tail >= self.size() {
            self.tail = self.margin;
        }
    }

    /// Drops all buffered bytes.
    pub fn clear(&mut self) {
        self.head = self.margin;
        self.tail = self.margin;
        self.gotten = 0;
    }
}

/// Producer/consumer ring buffer shared between a reader task and a caller.
///
/// Wraps a [`RingBufferLinear`] with bounded waits: a producer that finds no
/// room waits up to the put timeout, a consumer that finds no ready block
/// waits up to the get timeout. A zero timeout never waits.
#[derive(Debug)]
pub struct RingBuffer {
    description: String,
    arena: Mutex<RingBufferLinear>,
    ready_for_get: Notify,
    ready_for_put: Notify,
    put_timeout: Duration,
    get_timeout: Duration,
    overflow_total: AtomicU64,
    overflow_pending: AtomicU64,
    overflow_log: LogThrottle,
}

impl RingBuffer {
    /// Creates a shared ring buffer; `description` prefixes its log lines.
    pub fn new(size: usize, margin: usize, description: &str) -> Result<Self> {
        Ok(Self {
            description: description.to_string(),
            arena: Mutex::new(RingBufferLinear::new(size, margin)?),
            ready_for_get: Notify::new(),
            ready_for_put: Notify::new(),
            put_timeout: Duration::ZERO,
            get_timeout: Duration::ZERO,
            overflow_total: AtomicU64::new(0),
            overflow_pending: AtomicU64::new(0),
            overflow_log: LogThrottle::default(),
        })
    }

    /// Sets how long `put`/`read_from` and `get` may wait.
    pub fn with_timeouts(mut self, put_timeout: Duration, get_timeout: Duration) -> Self {
        self.put_timeout = put_timeout;
        self.get_timeout = get_timeout;
        self
    }

    /// Arena size in bytes.
    pub fn capacity(&self) -> usize {
        self.arena.lock().size()
    }

    /// Minimum ready block size.
    pub fn margin(&self) -> usize {
        self.arena.lock().margin()
    }

    /// Bytes buffered and not yet deleted.
    pub fn available(&self) -> usize {
        self.arena.lock().available()
    }

    /// Bytes that could still be buffered.
    pub fn free(&self) -> usize {
        self.arena.lock().free()
    }

    /// Fill level in percent of the usable data region.
    pub fn fill_percent(&self) -> u8 {
        let arena = self.arena.lock();
        let usable = arena.size() - arena.margin() - 1;
        ((arena.available() * 100) / usable.max(1)) as u8
    }

    /// Total bytes reported as dropped since creation.
    pub fn overflow_bytes(&self) -> u64 {
        self.overflow_total.load(Ordering::Relaxed)
    }

    /// Places as much of `data` as fits and returns the accepted count.
    ///
    /// When nothing fits the call waits up to the put timeout for the
    /// consumer to free space. Returns 0 only if none appeared in time.
    pub async fn put(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let deadline = Instant::now() + self.put_timeout;
        loop {
            let space = self.ready_for_put.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut arena = self.arena.lock();
                let count = arena.put(data);
                if count > 0 {
                    self.enable_get(&arena);
                    return count;
                }
            }
            if timeout_at(deadline, space).await.is_err() {
                return 0;
            }
        }
    }

    /// Places all of `data`, waiting for space as needed.
    ///
    /// Gives up once a wait ends without any progress; the unplaced remainder
    /// is counted as overflow and reported as [`VtpError::BufferOverflow`].
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let count = self.put(&data[offset..]).await;
            if count == 0 {
                let dropped = data.len() - offset;
                self.report_overflow(dropped);
                return Err(VtpError::BufferOverflow(dropped));
            }
            offset += count;
        }
        Ok(())
    }

    /// Reads once from `src` straight into the arena.
    ///
    /// Returns the byte count, `Ok(0)` at end of stream, or the source error.
    /// A full arena yields `WouldBlock` once the put timeout passes without
    /// the consumer freeing space.
    pub async fn read_from<S: ReadSource + ?Sized>(&self, src: &S) -> io::Result<usize> {
        let deadline = Instant::now() + self.put_timeout;
        loop {
            let space = self.ready_for_put.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut arena = self.arena.lock();
                if arena.read_space() > 0 {
                    let result = arena.read_from(src);
                    self.enable_get(&arena);
                    return result;
                }
            }
            if timeout_at(deadline, space).await.is_err() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "ring buffer full"));
            }
        }
    }

    /// Hands the current ready block to `f` and returns its result.
    ///
    /// When no block is ready this waits up to the get timeout; `None` means
    /// nothing became ready in that time. The block stays buffered until
    /// [`RingBuffer::del`] is called.
    pub async fn get<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let deadline = Instant::now() + self.get_timeout;
        loop {
            let ready = self.ready_for_get.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();
            {
                let mut arena = self.arena.lock();
                if let Some(block) = arena.get() {
                    return Some(f(block));
                }
            }
            if timeout_at(deadline, ready).await.is_err() {
                return None;
            }
        }
    }

    /// Consumes `count` bytes of the last block passed to `get`.
    pub fn del(&self, count: usize) {
        let mut arena = self.arena.lock();
        arena.del(count);
        self.enable_put(&arena);
    }

    /// Discards everything buffered. Nothing written before the call is
    /// delivered after it.
    pub fn clear(&self) {
        self.arena.lock().clear();
        debug!("{}: buffer cleared", self.description);
        self.ready_for_put.notify_waiters();
    }

    /// Records `bytes` as dropped and logs at most once per interval.
    pub fn report_overflow(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }

        let total = self.overflow_total.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        let pending = self.overflow_pending.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        if self.overflow_log.admit().is_some() {
            self.overflow_pending.store(0, Ordering::Relaxed);
            warn!(
                "{}: ring buffer overflow ({} bytes dropped, {} total)",
                self.description, pending, total
            );
        }
    }

    // Waiters enable their `Notified` before checking the arena, so
    // `notify_waiters` cannot be missed and leaves no stale permit behind.
    fn enable_get(&self, arena: &RingBufferLinear) {
        if arena.available() >= arena.margin().max(1) {
            self.ready_for_get.notify_waiters();
        }
    }

    fn enable_put(&self, arena: &RingBufferLinear) {
        if arena.free() > arena.size() / 10 {
            self.ready_for_put.notify_waiters();
        }
    }
}
