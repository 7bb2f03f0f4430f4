//! GDB Remote Serial Protocol wire format.

pub mod hex;
pub mod packet;

pub use packet::{Frame, FrameDecoder};
