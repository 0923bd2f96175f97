//! Connection manager for the SPP session.
//!
//! This module owns the connection lifecycle: adapter selection, link
//! establishment with bounded retry, profile registration, stream
//! acquisition, and teardown. Session state lives in a single actor task;
//! [`ConnectionManager`] is the cheaply cloneable handle talking to it.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};
use uuid::Uuid;

use crate::{
   bluetooth::{
      pump::{OutboundQueue, PumpConfig, PumpHandle},
      transport::{ProfileConnection, ProfileRole, ProfileSpec, Transport, TransportError},
      watchdog::Watchdog,
   },
   config::Config,
   error::{Result, SppError},
   event::{DisconnectFilter, EventSender, PEER_DISCONNECT_REASON, SppEvent},
   protocol::{DeviceFamily, Message},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
   Idle,
   AdapterSelected,
   DeviceResolved,
   ProfileRegistered,
   StreamAcquired,
   Connected,
   Disconnected,
   Failed,
}

/// Per-call connect settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
   /// Family to speak; the configured one when unset.
   pub family: Option<DeviceFamily>,
   /// Make a single link attempt instead of retrying while one is in
   /// progress.
   pub no_retry: bool,
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // User commands
   SelectAdapter(Option<SmolStr>, oneshot::Sender<Result<()>>),
   Connect(SmolStr, ConnectOptions, oneshot::Sender<Result<()>>),
   Disconnect(oneshot::Sender<Result<()>>),
   GetState(oneshot::Sender<ConnectionState>),

   // Session events
   LinkStateChanged(SmolStr, bool),
   PumpStopped(u64),
   PeerDisconnected(u64),
}

/// State shared between handles and the actor without a round trip.
struct Shared {
   queue: Arc<OutboundQueue>,
   connected: AtomicBool,
   family: AtomicCell<DeviceFamily>,
   events: Arc<DisconnectFilter>,
}

// === Handle ===

/// Handle to the connection manager.
///
/// Dropping the last handle shuts the manager down and disconnects.
#[derive(Clone)]
pub struct ConnectionManager {
   inbox: mpsc::Sender<ManagerCommand>,
   shared: Arc<Shared>,
}

impl ConnectionManager {
   /// Spawns the manager actor on the current tokio runtime.
   pub fn new<T: Transport>(transport: T, event_tx: EventSender, config: Config) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let events = DisconnectFilter::new(event_tx);
      let shared = Arc::new(Shared {
         queue: Arc::new(OutboundQueue::new()),
         connected: AtomicBool::new(false),
         family: AtomicCell::new(config.device_family),
         events: events.clone(),
      });
      tokio::spawn(ManagerActor::new(transport, config, events, command_rx, shared.clone()).run());
      Self {
         inbox: command_tx,
         shared,
      }
   }

   async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> ManagerCommand) -> Result<R> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| SppError::ManagerShutdown)?;
      rx.await.map_err(|_| SppError::ManagerShutdown)
   }

   /// Selects the adapter used for subsequent connects, falling back to the
   /// default adapter when `preferred` is unavailable.
   pub async fn select_adapter(&self, preferred: Option<&str>) -> Result<()> {
      let preferred = preferred.map(SmolStr::from);
      self
         .request(|tx| ManagerCommand::SelectAdapter(preferred, tx))
         .await?
   }

   /// Connects to `device_id` using the configured device family.
   pub async fn connect(&self, device_id: &str) -> Result<()> {
      self.connect_with(device_id, ConnectOptions::default()).await
   }

   /// Connects to `device_id`, speaking the protocol of `family`.
   pub async fn connect_as(&self, device_id: &str, family: DeviceFamily) -> Result<()> {
      let options = ConnectOptions {
         family: Some(family),
         ..ConnectOptions::default()
      };
      self.connect_with(device_id, options).await
   }

   pub async fn connect_with(&self, device_id: &str, options: ConnectOptions) -> Result<()> {
      let device_id = SmolStr::from(device_id);
      self
         .request(|tx| ManagerCommand::Connect(device_id, options, tx))
         .await?
   }

   /// Tears the session down. Succeeds even when there is nothing to clean up.
   pub async fn disconnect(&self) -> Result<()> {
      self.request(ManagerCommand::Disconnect).await?
   }

   pub async fn state(&self) -> Result<ConnectionState> {
      self.request(ManagerCommand::GetState).await
   }

   pub fn is_connected(&self) -> bool {
      self.shared.connected.load(Ordering::Acquire)
   }

   /// While set, `ConnectionLost` and `ConnectionFailed` are not emitted.
   /// Teardown still happens.
   pub fn set_suppress_disconnection_events(&self, suppress: bool) {
      self.shared.events.set_suppressed(suppress);
   }

   pub fn disconnection_events_suppressed(&self) -> bool {
      self.shared.events.is_suppressed()
   }

   /// Family of the current (or most recent) session.
   pub fn device_family(&self) -> DeviceFamily {
      self.shared.family.load()
   }

   /// Queues a message for transmission.
   pub fn send(&self, msg: Message) -> Result<()> {
      if !self.is_connected() {
         return Err(SppError::NotConnected);
      }
      let max = self.device_family().wire_variant().max_payload_len();
      if msg.payload().len() > max {
         return Err(SppError::PayloadTooLarge {
            len: msg.payload().len(),
            max,
         });
      }
      debug!("Queueing {msg}");
      self.shared.queue.push(msg);
      Ok(())
   }

   pub fn send_request(&self, id: u8, payload: &[u8]) -> Result<()> {
      self.send(Message::request(id, payload))
   }
}

// === Manager Actor ===

struct Session<T: Transport> {
   device: T::Device,
   device_id: SmolStr,
   pump: PumpHandle,
   /// Waits for the peer to request disconnection.
   closer: JoinHandle<()>,
   generation: u64,
}

struct ManagerActor<T: Transport> {
   transport: T,
   config: Config,
   event_tx: EventSender,
   shared: Arc<Shared>,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,

   // State
   adapter: Option<T::Adapter>,
   state: ConnectionState,
   session: Option<Session<T>>,
   watchdog: Watchdog,
   generation: u64,
   registered: Option<Uuid>,
   /// Profile connected on a device; outlives sessions that failed to open.
   profile_link: Option<(T::Device, Uuid)>,
   last_target: Option<(SmolStr, DeviceFamily)>,
}

impl<T: Transport> ManagerActor<T> {
   fn new(
      transport: T,
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
      shared: Arc<Shared>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         transport,
         config,
         event_tx,
         shared,
         command_rx,
         loopback_rx,
         loopback_tx,
         adapter: None,
         state: ConnectionState::Idle,
         session: None,
         watchdog: Watchdog::new(),
         generation: 0,
         registered: None,
         profile_link: None,
         last_target: None,
      }
   }

   async fn run(mut self) {
      info!("Connection manager starting up");

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Connection manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::SelectAdapter(preferred, reply) => {
            let result = self.select_adapter(preferred.as_deref()).await;
            let _ = reply.send(result);
         },
         ManagerCommand::Connect(device_id, options, reply) => {
            let family = options.family.unwrap_or(self.config.device_family);
            let result = self
               .establish_session(device_id, family, options.no_retry)
               .await;
            let _ = reply.send(result);
         },
         ManagerCommand::Disconnect(reply) => {
            let result = self.disconnect().await;
            let _ = reply.send(result);
         },
         ManagerCommand::GetState(reply) => {
            let _ = reply.send(self.state);
         },
         ManagerCommand::LinkStateChanged(device_id, connected) => {
            self.handle_link_state(device_id, connected).await;
         },
         ManagerCommand::PumpStopped(generation) => {
            self.handle_pump_stopped(generation).await;
         },
         ManagerCommand::PeerDisconnected(generation) => {
            self.handle_peer_disconnect(generation).await;
         },
      }
   }

   /// Takes effect for the next connect; a live session keeps its state.
   async fn select_adapter(&mut self, preferred: Option<&str>) -> Result<()> {
      let mut adapter = None;
      if let Some(name) = preferred {
         match self.transport.resolve_adapter(Some(name)).await {
            Ok(found) => adapter = Some(found),
            Err(e) => warn!("Preferred adapter {name} not available: {e}"),
         }
      }

      let adapter = match adapter {
         Some(adapter) => adapter,
         None => match self.transport.resolve_adapter(None).await {
            Ok(adapter) => adapter,
            Err(TransportError::NoAdapter | TransportError::NotFound) => {
               error!("No Bluetooth adapters found");
               self.set_idle_state(ConnectionState::Failed);
               return Err(SppError::NoAdapterAvailable);
            },
            Err(e) => {
               self.set_idle_state(ConnectionState::Failed);
               return Err(e.into());
            },
         },
      };

      info!("Using Bluetooth adapter {}", self.transport.adapter_name(&adapter));
      self.adapter = Some(adapter);
      self.set_idle_state(ConnectionState::AdapterSelected);
      Ok(())
   }

   /// Updates the state unless a session is live.
   fn set_idle_state(&mut self, state: ConnectionState) {
      if self.session.is_none() {
         self.state = state;
      }
   }

   async fn establish_session(
      &mut self,
      device_id: SmolStr,
      family: DeviceFamily,
      no_retry: bool,
   ) -> Result<()> {
      if self.session.is_some() || self.profile_link.is_some() {
         info!("Replacing previous session");
         self.teardown_session().await;
      }

      self.generation += 1;
      self.last_target = Some((device_id.clone(), family));
      self.shared.family.store(family);
      self.event_tx.emit(SppEvent::Connecting);
      info!("Connecting to {device_id} as {family}");

      let session = match self.open_session(&device_id, family, no_retry).await {
         Ok(session) => session,
         Err(e) => {
            error!("Connection to {device_id} failed: {e}");
            self.state = ConnectionState::Failed;
            return Err(e);
         },
      };

      match self.transport.watch_link_state(&session.device).await {
         Ok(states) => {
            let loopback = self.loopback_tx.clone();
            let device_id = session.device_id.clone();
            self.watchdog.arm(states, self.event_tx.clone(), move |connected| {
               let cmd = ManagerCommand::LinkStateChanged(device_id.clone(), connected);
               if let Err(e) = loopback.try_send(cmd) {
                  warn!("Channel overflow sending link state: {e}");
               }
            });
         },
         Err(e) => warn!("Link state notifications unavailable: {e}"),
      }

      info!("Session with {} established", session.device_id);
      self.session = Some(session);
      self.state = ConnectionState::Connected;
      self.shared.connected.store(true, Ordering::Release);
      self.event_tx.emit(SppEvent::Connected);
      Ok(())
   }

   async fn open_session(
      &mut self,
      device_id: &SmolStr,
      family: DeviceFamily,
      no_retry: bool,
   ) -> Result<Session<T>> {
      if self.adapter.is_none() {
         warn!("No adapter preselected");
         let preferred = self.config.adapter.clone();
         self.select_adapter(preferred.as_deref()).await?;
      }
      let Some(adapter) = self.adapter.as_ref() else {
         return Err(SppError::NoAdapterAvailable);
      };

      let device = match self.transport.resolve_device(adapter, device_id).await {
         Ok(device) => device,
         Err(TransportError::NotFound | TransportError::DoesNotExist | TransportError::InvalidArguments) => {
            warn!("Peripheral {device_id} not found; scan and pair it first");
            return Err(SppError::DeviceNotFound(device_id.to_string()));
         },
         Err(e) => return Err(e.into()),
      };
      self.state = ConnectionState::DeviceResolved;

      let max_attempts = if no_retry {
         1
      } else {
         self.config.connect_attempts.max(1)
      };
      let attempts = self.connect_link(&device, max_attempts).await?;
      debug!("Link up after {attempts} attempt(s)");

      time::timeout(
         self.config.link_confirm_timeout(),
         self.transport.wait_connected(&device),
      )
      .await
      .map_err(|_| SppError::ConnectTimeout("device never reported connected"))?
      .map_err(|e| SppError::ConnectFailed(e.to_string()))?;
      info!("Connected.");

      let uuid = family.service_uuid();
      self.register_profile(uuid).await?;
      self.connect_profile(&device, uuid).await?;
      self.profile_link = Some((device.clone(), uuid));

      let ProfileConnection { stream, closed } = match time::timeout(
         self.config.stream_accept_timeout(),
         self.transport.open_stream(&device, uuid),
      )
      .await
      {
         Ok(Ok(conn)) => conn,
         Ok(Err(TransportError::Io(e))) => return Err(SppError::TransportIo(e)),
         Ok(Err(e)) => return Err(SppError::ConnectFailed(e.to_string())),
         Err(_) => return Err(SppError::ConnectTimeout("profile stream never arrived")),
      };
      self.state = ConnectionState::StreamAcquired;

      let dropped = self.shared.queue.clear();
      if dropped > 0 {
         debug!("Dropped {dropped} stale outbound message(s)");
      }

      let generation = self.generation;
      let loopback = self.loopback_tx.clone();
      let pump = PumpHandle::spawn(
         stream,
         PumpConfig {
            variant: family.wire_variant(),
            pacing: self.config.send_pacing(),
         },
         self.shared.queue.clone(),
         self.event_tx.clone(),
         move |exit| {
            if !exit.is_cancelled()
               && let Err(e) = loopback.try_send(ManagerCommand::PumpStopped(generation))
            {
               warn!("Channel overflow sending pump exit: {e}");
            }
         },
      );

      let loopback = self.loopback_tx.clone();
      let closer = tokio::spawn(async move {
         closed.await;
         let _ = loopback.send(ManagerCommand::PeerDisconnected(generation)).await;
      });

      Ok(Session {
         device,
         device_id: device_id.clone(),
         pump,
         closer,
         generation,
      })
   }

   /// Connects the link, retrying while the stack reports a connect in
   /// progress. Returns the number of attempts used.
   async fn connect_link(&self, device: &T::Device, max_attempts: u32) -> Result<u32> {
      let interval = self.config.connect_retry_interval();

      let mut attempt = 0;
      loop {
         attempt += 1;
         debug!("Connecting link (attempt {attempt}/{max_attempts})");
         match self.transport.connect_device(device).await {
            Ok(()) => return Ok(attempt),
            Err(TransportError::AlreadyConnected) => {
               info!("Already connected.");
               return Ok(attempt);
            },
            Err(TransportError::InProgress) if attempt >= max_attempts => {
               warn!("Gave up after {attempt} attempts");
               return Err(SppError::ConnectTimeout("connection still in progress"));
            },
            Err(TransportError::InProgress) => {
               debug!("Already connecting, retrying in {interval:?}");
               time::sleep(interval).await;
            },
            Err(e) => {
               warn!("Connect call failed: {e}");
               return Err(SppError::ConnectFailed(e.to_string()));
            },
         }
      }
   }

   async fn register_profile(&mut self, uuid: Uuid) -> Result<()> {
      if let Some(previous) = self.registered
         && previous != uuid
      {
         self.unregister_profile(previous).await;
      }

      let profile = ProfileSpec {
         uuid,
         role: ProfileRole::Client,
         name: self.config.profile_name.as_str().into(),
      };
      match self.transport.register_profile(&profile).await {
         Ok(()) => info!("Registered profile {uuid}"),
         Err(TransportError::AlreadyExists) => info!("Profile {uuid} already registered"),
         Err(TransportError::InvalidArguments) => {
            error!("Profile registration rejected: invalid arguments");
            return Err(SppError::ConfigurationInvalid(format!(
               "profile {uuid} ({}) rejected by transport",
               profile.name
            )));
         },
         Err(e) => return Err(e.into()),
      }

      self.registered = Some(uuid);
      self.state = ConnectionState::ProfileRegistered;
      Ok(())
   }

   async fn connect_profile(&self, device: &T::Device, uuid: Uuid) -> Result<()> {
      info!("Connecting to profile...");
      match self.transport.connect_profile(device, uuid).await {
         Ok(()) => Ok(()),
         Err(TransportError::AlreadyConnected) => {
            info!("Profile already connected.");
            Ok(())
         },
         Err(TransportError::ConnectFailed(reason)) => Err(SppError::ConnectFailed(reason)),
         Err(TransportError::DoesNotExist) => {
            error!("Profile {uuid} does not exist on the device");
            Err(SppError::ServiceUnsupported)
         },
         Err(e) => Err(e.into()),
      }
   }

   async fn unregister_profile(&mut self, uuid: Uuid) {
      self.registered = None;
      match self.transport.unregister_profile(uuid).await {
         Ok(()) => info!("Profile unregistered."),
         Err(e) => debug!("Discarding profile unregistration error: {e}"),
      }
   }

   /// Stops the pump, waits for it to release the stream, then disconnects
   /// the profile. Registration is kept.
   async fn teardown_session(&mut self) {
      self.shared.connected.store(false, Ordering::Release);
      match self.session.take() {
         Some(session) => {
            info!("Stopping pump for {}", session.device_id);
            session.closer.abort();
            if let Some(exit) = session.pump.stop().await {
               debug!("Pump exited: {exit:?}");
            }
         },
         None => debug!("Pump not running, no need to cancel"),
      }

      if let Some((device, uuid)) = self.profile_link.take() {
         match self.transport.disconnect_profile(&device, uuid).await {
            Ok(()) => info!("Profile disconnected."),
            Err(e) => debug!("Discarding profile disconnect error: {e}"),
         }
      }
   }

   async fn disconnect(&mut self) -> Result<()> {
      // Invalidates pump notifications still in flight.
      self.generation += 1;
      self.watchdog.release();
      self.last_target = None;

      self.teardown_session().await;
      if let Some(uuid) = self.registered {
         self.unregister_profile(uuid).await;
      }

      self.state = ConnectionState::Disconnected;
      Ok(())
   }

   async fn handle_pump_stopped(&mut self, generation: u64) {
      if !self.session.as_ref().is_some_and(|s| s.generation == generation) {
         return;
      }
      warn!("Session lost: pump terminated");
      self.teardown_session().await;
      self.state = ConnectionState::Disconnected;
   }

   async fn handle_peer_disconnect(&mut self, generation: u64) {
      if !self.session.as_ref().is_some_and(|s| s.generation == generation) {
         return;
      }
      info!("Peer requested disconnection");
      self
         .event_tx
         .emit(SppEvent::ConnectionLost(PEER_DISCONNECT_REASON.into()));
      self.teardown_session().await;
      self.state = ConnectionState::Disconnected;
   }

   /// Link notifications outlive failed reconnects, so they are matched by
   /// target rather than by session.
   async fn handle_link_state(&mut self, device_id: SmolStr, connected: bool) {
      if self.last_target.as_ref().is_none_or(|(target, _)| *target != device_id) {
         return;
      }

      if !connected {
         if self.session.is_some() {
            self.teardown_session().await;
            self.state = ConnectionState::Disconnected;
         }
         return;
      }

      if !self.config.auto_reconnect || self.session.is_some() {
         return;
      }
      let Some((device_id, family)) = self.last_target.clone() else {
         return;
      };

      info!("Attempting to auto-connect to {device_id}...");
      if let Err(e) = self.establish_session(device_id, family, false).await {
         self
            .event_tx
            .emit(SppEvent::ConnectionFailed(e.to_string().into()));
      }
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up connection manager");
      if self.session.is_some() || self.registered.is_some() || self.profile_link.is_some() {
         let _ = self.disconnect().await;
      }
   }
}
