//! # Utility Types
//!
//! Building blocks shared by the protocol and stream layers:
//!
//! - [`RingBuffer`] / [`RingBufferLinear`]: bounded byte ring that always
//!   hands out contiguous blocks of at least `margin` bytes
//! - [`LogThrottle`]: one-line-per-interval limiter for noisy failures
//! - [`Crc32Mpeg2`]: CRC used to seal PSI sections
//!
//! ## Ring Buffer
//!
//! ```rust
//! use vtpio::utils::RingBufferLinear;
//!
//! # fn main() -> vtpio::Result<()> {
//! let mut ring = RingBufferLinear::new(64, 8)?;
//! ring.put(&[0x47; 8]);
//! let block = ring.get().map(|b| b.to_vec());
//! assert_eq!(block, Some(vec![0x47; 8]));
//! ring.del(8);
//! # Ok(())
//! # }
//! ```

/// CRC calculation for PSI sections
pub mod crc;

/// Linear ring buffer and its shared async wrapper
pub mod ringbuffer;

/// Rate limiting for repetitive log lines
pub mod throttle;

pub use crc::Crc32Mpeg2;
pub use ringbuffer::{ReadSource, RingBuffer, RingBufferLinear};
pub use throttle::{LogThrottle, DEFAULT_LOG_INTERVAL};
