//! # MPEG Transport Stream Handling
//!
//! What the client needs from MPEG-TS:
//!
//! - **Packet alignment**: [`TsReader`] fills a ring buffer from a live data
//!   socket in the background and hands out whole 188-byte packets, skipping
//!   bytes up to the next sync byte when the stream is misaligned
//! - **Filler**: [`FillerStream`] loops a small PAT/PMT/PES stream while the
//!   live source is silent
//! - **Headers and PSI**: [`TSHeader`], [`PAT`] and [`PMT`] writers used to
//!   build the filler
//!
//! ## Example
//!
//! ```rust
//! use vtpio::format::ts::{FillerStream, TS_PACKET_SIZE, TS_SYNC_BYTE};
//!
//! let mut filler = FillerStream::builtin();
//! let mut buf = vec![0u8; 8 * TS_PACKET_SIZE];
//! assert_eq!(filler.read(&mut buf), buf.len());
//! assert!(buf.chunks(TS_PACKET_SIZE).all(|p| p[0] == TS_SYNC_BYTE));
//! ```

/// No-signal filler stream
pub mod filler;

/// Background reader producing aligned TS packets
pub mod reader;

/// Core TS types and constants
pub mod types;

pub use filler::{wrap_payload, FillerStream};
pub use reader::{TsReader, TsReaderOptions, DEFAULT_TS_TIMEOUT, TS_BUFFER_SIZE};
pub use types::{
    find_sync, TSHeader, PAT, PID_PAT, PID_PMT, PID_VIDEO, PMT, TS_PACKET_SIZE, TS_SYNC_BYTE,
};
