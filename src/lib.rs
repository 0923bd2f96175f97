//! Point-to-point serial-over-Bluetooth engine.
//!
//! Frames application messages for the serial port profile, keeps a single
//! session to a peripheral alive, and reports traffic and link changes
//! through an [`event::EventBus`].

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;
pub mod protocol;

pub use bluetooth::{
   manager::{ConnectOptions, ConnectionManager, ConnectionState},
   transport::{Transport, TransportError},
};
pub use config::Config;
pub use error::{Result, SppError};
pub use event::{ChannelEventBus, EventBus, EventSender, SppEvent};
pub use protocol::{DeviceFamily, Message, MessageKind, WireVariant};
