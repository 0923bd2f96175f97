//! BlueZ transport built on `bluer`.
//!
//! Maps the D-Bus error vocabulary onto [`TransportError`] and hands out
//! RFCOMM streams from a registered profile.
//!
//! BlueZ only answers `ConnectProfile` once our `NewConnection` handler has
//! returned, which in turn waits for the connect request to be accepted. Each
//! registered profile therefore runs its own acceptor task; `open_stream`
//! merely collects what the acceptor already took.

use std::{collections::HashMap, sync::Arc};

use bluer::{
   Adapter, Address, Device, DeviceEvent, DeviceProperty, ErrorKind, Session,
   rfcomm::{Profile, ProfileHandle, Role, Stream},
};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::bluetooth::transport::{
   LinkStateStream, ProfileConnection, ProfileRole, ProfileSpec, Transport, TransportError,
   TransportResult,
};

impl From<bluer::Error> for TransportError {
   fn from(err: bluer::Error) -> Self {
      match err.kind {
         ErrorKind::InProgress => Self::InProgress,
         ErrorKind::AlreadyConnected => Self::AlreadyConnected,
         ErrorKind::AlreadyExists => Self::AlreadyExists,
         ErrorKind::InvalidArguments => Self::InvalidArguments,
         ErrorKind::ConnectionAttemptFailed | ErrorKind::Failed => Self::ConnectFailed(err.message),
         ErrorKind::DoesNotExist => Self::DoesNotExist,
         ErrorKind::NotFound => Self::NotFound,
         _ => Self::Other(err.to_string()),
      }
   }
}

/// Connection accepted by a profile's acceptor task.
struct Accepted {
   device: Address,
   stream: Stream,
   closed: BoxFuture<'static, ()>,
}

type AcceptedRx = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Accepted>>>;

struct ProfileSlot {
   accepted: AcceptedRx,
   acceptor: JoinHandle<()>,
}

impl Drop for ProfileSlot {
   fn drop(&mut self) {
      // The acceptor owns the profile handle; dropping it unregisters.
      self.acceptor.abort();
   }
}

async fn accept_connections(mut handle: ProfileHandle, tx: mpsc::UnboundedSender<Accepted>) {
   while let Some(request) = handle.next().await {
      let device = request.device();
      let closed = request.closed().boxed();
      match request.accept() {
         Ok(stream) => {
            debug!("Accepted profile connection from {device}");
            if tx.send(Accepted { device, stream, closed }).is_err() {
               break;
            }
         },
         Err(e) => warn!("Failed to accept profile connection from {device}: {e}"),
      }
   }
   debug!("Profile acceptor stopped");
}

pub struct BluezTransport {
   session: Session,
   profiles: Mutex<HashMap<Uuid, ProfileSlot>>,
}

impl BluezTransport {
   pub async fn new() -> TransportResult<Self> {
      let session = Session::new().await?;
      Ok(Self {
         session,
         profiles: Mutex::new(HashMap::new()),
      })
   }
}

impl Transport for BluezTransport {
   type Adapter = Adapter;
   type Device = Device;
   type Stream = Stream;

   async fn resolve_adapter(&self, name: Option<&str>) -> TransportResult<Adapter> {
      let adapter = match name {
         Some(name) => self.session.adapter(name)?,
         None => {
            let names = self.session.adapter_names().await?;
            let Some(first) = names.first() else {
               return Err(TransportError::NoAdapter);
            };
            self.session.adapter(first)?
         },
      };

      if !adapter.is_powered().await? {
         info!("Powering on adapter {}", adapter.name());
         adapter.set_powered(true).await?;
      }
      Ok(adapter)
   }

   fn adapter_name(&self, adapter: &Adapter) -> SmolStr {
      adapter.name().into()
   }

   async fn resolve_device(&self, adapter: &Adapter, id: &str) -> TransportResult<Device> {
      let address: Address = id.parse().map_err(|_| TransportError::InvalidArguments)?;
      let known = adapter.device_addresses().await?;
      if !known.contains(&address) {
         return Err(TransportError::NotFound);
      }
      Ok(adapter.device(address)?)
   }

   async fn connect_device(&self, device: &Device) -> TransportResult<()> {
      device.connect().await?;
      Ok(())
   }

   async fn wait_connected(&self, device: &Device) -> TransportResult<()> {
      let mut events = device.events().await?;
      if device.is_connected().await? {
         return Ok(());
      }
      while let Some(event) = events.next().await {
         if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)) = event {
            return Ok(());
         }
      }
      Err(TransportError::Other("device event stream ended".into()))
   }

   async fn register_profile(&self, profile: &ProfileSpec) -> TransportResult<()> {
      if self.profiles.lock().contains_key(&profile.uuid) {
         return Err(TransportError::AlreadyExists);
      }

      let role = match profile.role {
         ProfileRole::Client => Role::Client,
         ProfileRole::Server => Role::Server,
      };
      let handle = self
         .session
         .register_profile(Profile {
            uuid: profile.uuid,
            name: Some(profile.name.to_string()),
            role: Some(role),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
         })
         .await?;

      let (tx, rx) = mpsc::unbounded_channel();
      let slot = ProfileSlot {
         accepted: Arc::new(tokio::sync::Mutex::new(rx)),
         acceptor: tokio::spawn(accept_connections(handle, tx)),
      };
      self.profiles.lock().insert(profile.uuid, slot);
      Ok(())
   }

   async fn connect_profile(&self, device: &Device, service: Uuid) -> TransportResult<()> {
      device.connect_profile(&service).await?;
      Ok(())
   }

   async fn open_stream(
      &self,
      device: &Device,
      service: Uuid,
   ) -> TransportResult<ProfileConnection<Stream>> {
      let accepted = self
         .profiles
         .lock()
         .get(&service)
         .map(|slot| slot.accepted.clone());
      let Some(accepted) = accepted else {
         return Err(TransportError::DoesNotExist);
      };

      let mut accepted = accepted.lock().await;
      while let Some(conn) = accepted.recv().await {
         if conn.device != device.address() {
            // Dropping the stream closes it.
            warn!("Dropping profile connection from {}", conn.device);
            continue;
         }
         return Ok(ProfileConnection {
            stream: conn.stream,
            closed: conn.closed,
         });
      }
      Err(TransportError::Other("profile acceptor stopped".into()))
   }

   async fn watch_link_state(&self, device: &Device) -> TransportResult<LinkStateStream> {
      let events = device.events().await?;
      Ok(events
         .filter_map(|event| async move {
            match event {
               DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) => Some(connected),
               _ => None,
            }
         })
         .boxed())
   }

   async fn disconnect_profile(&self, device: &Device, service: Uuid) -> TransportResult<()> {
      device.disconnect_profile(&service).await?;
      Ok(())
   }

   async fn unregister_profile(&self, service: Uuid) -> TransportResult<()> {
      match self.profiles.lock().remove(&service) {
         Some(_) => Ok(()),
         None => Err(TransportError::NotFound),
      }
   }
}
