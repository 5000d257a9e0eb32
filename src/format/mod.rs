//! Wire formats: the VTP control protocol and MPEG transport streams.

pub mod ts;
pub mod vtp;

pub use self::ts::{FillerStream, TsReader, TsReaderOptions};
pub use self::vtp::{ControlChannel, DataChannel, DataSocket, DataStreamId};
