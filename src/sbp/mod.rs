//! SBP wire protocol: framing and typed messages.
//!
//! The frame layout (preamble, type, sender, length, payload, CRC) is the
//! receiver vendor's contract; everything above it works on [Message].

pub mod frame;
pub mod message;

pub use frame::{Frame, Framer, FramingError};
pub use message::Message;

/// Sender id this program stamps on outbound frames.
pub const HOST_SENDER_ID: u16 = 0x42;
