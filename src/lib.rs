#![doc(html_root_url = "https://docs.rs/vtpio/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # vtpio - VTP streaming client
//!
//! `vtpio` talks to a VDR streamdev server over VTP: a line-oriented control
//! protocol plus data sockets the server connects back to. It delivers live
//! TV as aligned MPEG-TS packets and plays recordings with byte-accurate
//! seeking.
//!
//! ## Features
//!
//! - Control channel with greeting and `CAPS TS` negotiation, a single
//!   in-flight command, busy retries for list commands and reconnect on
//!   dead connections
//! - Push-style data channels (`PORT` / `ABRT`) for live, replay, filter
//!   and notification streams
//! - Linear ring buffer with a margin that only ever hands out contiguous
//!   blocks, and a background TS reader that resynchronizes on the sync byte
//! - Live sessions that recover from dropped sockets and fall back to a
//!   looping "no signal" stream
//! - Recording sessions that discard in-flight bytes after a seek
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vtpio::config::ClientConfig;
//! use vtpio::pvr::PvrClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig::from_url("vtp://192.168.1.10:2004").unwrap_or_default();
//!     let mut client = PvrClient::new(config);
//!     if !client.connect().await {
//!         return;
//!     }
//!
//!     if client.open_live(1).await {
//!         let mut buf = vec![0u8; 188 * 64];
//!         for _ in 0..100 {
//!             let n = client.read_live(&mut buf).await;
//!             println!("got {} bytes", n);
//!         }
//!         client.close_live().await;
//!     }
//!     client.disconnect().await;
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `format::vtp`: wire types, control channel, data channels, notification
//!   listener
//! - `format::ts`: TS header and PSI writers, TS reader, filler stream
//! - `pvr`: live and recording sessions and the `PvrClient` facade
//! - `utils`: ring buffer, log throttle, MPEG-2 CRC
//! - `config`: `ClientConfig` loading from environment and file
//! - `error`: `VtpError` and the crate `Result`

/// Error types and utilities
pub mod error;

/// Wire formats (VTP control protocol, MPEG-TS)
pub mod format;

/// Live and recording stream sessions
pub mod pvr;

/// Common utilities and helper functions
pub mod utils;

/// Configuration module
pub mod config;

pub use config::ClientConfig;
pub use error::{Result, VtpError};
pub use pvr::PvrClient;
