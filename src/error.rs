//! Error types for the SPP engine.
//!
//! Framing errors live next to the codec (`protocol::FrameError`) and never
//! reach callers; the pump reports them as events. Provider errors live next
//! to the transport trait (`bluetooth::transport::TransportError`). This
//! module gathers everything a caller of the connection manager can observe.

use thiserror::Error;

use crate::bluetooth::transport::TransportError;

/// Main error type for the SPP engine.
#[derive(Error, Debug)]
pub enum SppError {
   #[error("No Bluetooth adapter available")]
   NoAdapterAvailable,

   #[error("Device not found: {0}")]
   DeviceNotFound(String),

   #[error("Connection timed out: {0}")]
   ConnectTimeout(&'static str),

   #[error("Connection failed: {0}")]
   ConnectFailed(String),

   #[error("Device does not support the serial port service")]
   ServiceUnsupported,

   #[error("Invalid profile configuration: {0}")]
   ConfigurationInvalid(String),

   #[error("Transport I/O error: {0}")]
   TransportIo(#[from] std::io::Error),

   #[error("Transport error: {0}")]
   Transport(#[from] TransportError),

   #[error("Device not connected")]
   NotConnected,

   #[error("Payload of {len} bytes exceeds the maximum of {max}")]
   PayloadTooLarge { len: usize, max: usize },

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `SppError`.
pub type Result<T> = std::result::Result<T, SppError>;
