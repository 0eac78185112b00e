//! Stream multiplexer: many ordered byte-streams over one encrypted
//! channel, with smux-v2 style framing and credit-based flow control.
//!
//! A session runs two tasks over the Noise channel: a read loop that
//! decodes frames and routes data to per-stream channels, and a write
//! loop that drains outgoing frames and emits keep-alives. Streams hand
//! out receive credit as the application consumes, so a slow reader
//! stalls only its own stream.

mod frame;
mod session;
mod stream;

pub use frame::{Command, Frame, MAX_FRAME_PAYLOAD};
pub use session::{MuxConfig, Session};
pub use stream::Stream;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unsupported protocol version {0}")]
    Version(u8),
}
