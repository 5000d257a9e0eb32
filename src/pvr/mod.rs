//! # PVR Stream Sessions
//!
//! Sessions combine the control channel, data channels and the TS reader
//! into what a media player consumes:
//!
//! - [`LiveStreamSession`]: live TV with transparent recovery and a filler
//!   stream while the backend is silent
//! - [`RecordingStreamSession`]: pull-style recording playback with seek
//! - [`PvrClient`]: facade that never returns errors, only byte counts,
//!   offsets and flags

mod client;
mod live;
mod recording;

pub use client::{DriveSpace, PvrClient, Whence};
pub use live::{LiveState, LiveStreamSession};
pub use recording::RecordingStreamSession;

use crate::format::vtp::{ControlChannel, ProtocolError};
use crate::{Result, VtpError};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

/// Decides whether the backend may stream a channel.
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    /// Returns `Ok(false)` for a definite "no"; errors mean the question
    /// could not be asked.
    async fn can_stream(&self, channel: u32, priority: i32) -> Result<bool>;
}

/// Asks the backend with `PROV <priority> <channel>`.
#[derive(Debug, Clone)]
pub struct ProvisionAuthorizer {
    control: Arc<ControlChannel>,
}

impl ProvisionAuthorizer {
    /// Creates an authorizer using `control`.
    pub fn new(control: Arc<ControlChannel>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl ChannelAuthorizer for ProvisionAuthorizer {
    async fn can_stream(&self, channel: u32, priority: i32) -> Result<bool> {
        let command = format!("PROV {} {}", priority, channel);
        match self.control.send_command(&command).await {
            Ok(_) => Ok(true),
            Err(VtpError::Protocol(ProtocolError::Status { code, message })) => {
                debug!("channel {} not provided: {} {}", channel, code, message);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
