//! Bluetooth session layer.
//!
//! This module provides the transport abstraction, the duplex pump moving
//! frames over a connected stream, link supervision, and the connection
//! manager tying them together.

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod manager;
pub mod pump;
pub mod transport;
pub mod watchdog;
