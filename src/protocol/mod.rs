//! SPP wire protocol: framing, checksums and device families.
//!
//! Everything in this module is pure; no I/O happens here.

pub mod codec;
pub mod crc;
pub mod family;
pub mod message;

pub use codec::{FrameError, decode};
pub use family::{DeviceFamily, WireVariant};
pub use message::{Message, MessageKind, Payload};
