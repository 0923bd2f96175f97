//! Capability interface to the platform Bluetooth stack.
//!
//! The connection manager is generic over [`Transport`]; the BlueZ backend
//! lives in `bluetooth::bluez` and tests provide scripted implementations.

use std::future::Future;

use futures::{future::BoxFuture, stream::BoxStream};
use smol_str::SmolStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Normalised errors reported by a transport provider.
#[derive(Error, Debug)]
pub enum TransportError {
   #[error("Operation already in progress")]
   InProgress,

   #[error("Already connected")]
   AlreadyConnected,

   #[error("Already exists")]
   AlreadyExists,

   #[error("Invalid arguments")]
   InvalidArguments,

   #[error("Connect failed: {0}")]
   ConnectFailed(String),

   #[error("Does not exist")]
   DoesNotExist,

   #[error("Not found")]
   NotFound,

   #[error("No adapter available")]
   NoAdapter,

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("{0}")]
   Other(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Role announced when registering a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ProfileRole {
   Client,
   Server,
}

/// Parameters of a profile registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSpec {
   pub uuid: Uuid,
   pub role: ProfileRole,
   pub name: SmolStr,
}

/// Stream of link-state changes; `true` means connected.
pub type LinkStateStream = BoxStream<'static, bool>;

/// Stream handed over for a connected profile.
pub struct ProfileConnection<S> {
   pub stream: S,
   /// Resolves when the peer's stack asks for the profile to be disconnected.
   pub closed: BoxFuture<'static, ()>,
}

/// Duplex byte stream obtained for a connected profile.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Platform Bluetooth operations consumed by the connection manager.
pub trait Transport: Send + Sync + 'static {
   type Adapter: Send + Sync + 'static;
   type Device: Clone + Send + Sync + 'static;
   type Stream: DuplexStream;

   /// Resolves a named adapter, or the default one when `name` is `None`.
   fn resolve_adapter(
      &self,
      name: Option<&str>,
   ) -> impl Future<Output = TransportResult<Self::Adapter>> + Send;

   /// Human readable name of an adapter, for logging.
   fn adapter_name(&self, adapter: &Self::Adapter) -> SmolStr;

   fn resolve_device(
      &self,
      adapter: &Self::Adapter,
      id: &str,
   ) -> impl Future<Output = TransportResult<Self::Device>> + Send;

   /// Connects the baseband link to the device.
   fn connect_device(
      &self,
      device: &Self::Device,
   ) -> impl Future<Output = TransportResult<()>> + Send;

   /// Resolves once the device reports itself as connected.
   fn wait_connected(
      &self,
      device: &Self::Device,
   ) -> impl Future<Output = TransportResult<()>> + Send;

   fn register_profile(
      &self,
      profile: &ProfileSpec,
   ) -> impl Future<Output = TransportResult<()>> + Send;

   fn connect_profile(
      &self,
      device: &Self::Device,
      service: Uuid,
   ) -> impl Future<Output = TransportResult<()>> + Send;

   /// Waits for the registered profile to hand over the stream for `device`.
   ///
   /// Providers must accept incoming profile connections independently of
   /// this call: `connect_profile` may not complete until they are accepted.
   fn open_stream(
      &self,
      device: &Self::Device,
      service: Uuid,
   ) -> impl Future<Output = TransportResult<ProfileConnection<Self::Stream>>> + Send;

   fn watch_link_state(
      &self,
      device: &Self::Device,
   ) -> impl Future<Output = TransportResult<LinkStateStream>> + Send;

   fn disconnect_profile(
      &self,
      device: &Self::Device,
      service: Uuid,
   ) -> impl Future<Output = TransportResult<()>> + Send;

   fn unregister_profile(&self, service: Uuid) -> impl Future<Output = TransportResult<()>> + Send;
}
