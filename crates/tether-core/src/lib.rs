//! Wire protocol shared by the tether daemon and attach client.
//!
//! A session daemon and whatever client is attached to it exchange exactly
//! one kind of message: a fixed-size [`frame::Packet`]. Keeping the frame a
//! single fixed shape means the readers on both sides never parse a length
//! prefix or reassemble short reads; a read either yields a whole frame or
//! the connection is treated as gone.
//!
//! # Modules
//!
//! - [`frame`]: the packet layout and its (de)serialization
//! - [`error`]: typed decode failures

pub mod error;
pub mod frame;

pub use error::FrameError;
pub use frame::{Packet, PacketKind, WindowSize, FRAME_LEN, PAYLOAD_MAX};
