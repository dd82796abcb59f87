//! # Stepwise Channel
//!
//! Control channel between the orchestrating host and the sandbox that runs
//! plans: the message set, per-task sequencing and NDJSON framing.
//!
//! Wire format, one envelope per line:
//! `{"seq": 3, "message": {"kind": "progress", ...}}`

pub mod codec;
pub mod message;
pub mod sequence;
pub mod transport;

pub use codec::{decode_frame, encode_frame, DropCounter, FrameReader, FrameWriter};
pub use message::{ControlMessage, Direction};
pub use sequence::{Admission, Envelope, OrderingGuard, Sequencer};
pub use transport::{duplex, stdio, Connection, DuplexConnection, StdioConnection};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("channel closed")]
    Closed,
}
