//! Scripted in-memory transport for driving the connection manager.
#![allow(dead_code)]

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::{FutureExt, StreamExt, stream};
use parking_lot::Mutex;
use smol_str::SmolStr;
use sppwire::{
   SppEvent,
   bluetooth::transport::{
      LinkStateStream, ProfileConnection, ProfileSpec, Transport, TransportError, TransportResult,
   },
};
use tokio::{
   io::DuplexStream,
   sync::{mpsc, oneshot},
   time::{self, Instant},
};
use uuid::Uuid;

pub const DEVICE: &str = "AA:BB:CC:11:22:33";
const PIPE_CAPACITY: usize = 8192;

#[derive(Default)]
pub struct MockState {
   pub adapters: Mutex<Vec<SmolStr>>,
   pub devices: Mutex<Vec<SmolStr>>,
   /// Results handed out by `connect_device`, in order; `Ok` once drained.
   pub connect_results: Mutex<VecDeque<TransportError>>,
   pub connect_times: Mutex<Vec<Instant>>,
   /// When set, `wait_connected` never resolves.
   pub link_silent: Mutex<bool>,
   pub register_results: Mutex<VecDeque<TransportError>>,
   pub connect_profile_results: Mutex<VecDeque<TransportError>>,
   pub disconnect_profile_results: Mutex<VecDeque<TransportError>>,
   pub registered: Mutex<Vec<ProfileSpec>>,
   pub calls: Mutex<Vec<&'static str>>,
   pub peers: Mutex<VecDeque<DuplexStream>>,
   /// When set, `open_stream` never resolves.
   pub stream_pending: Mutex<bool>,
   /// Fires the disconnect request of the most recently opened stream.
   pub peer_close: Mutex<Option<oneshot::Sender<()>>>,
   pub link_tx: Mutex<Option<mpsc::UnboundedSender<bool>>>,
}

#[derive(Clone)]
pub struct MockTransport {
   pub state: Arc<MockState>,
}

impl MockTransport {
   pub fn new() -> Self {
      let state = MockState::default();
      state.adapters.lock().push("hci0".into());
      state.devices.lock().push(DEVICE.into());
      Self {
         state: Arc::new(state),
      }
   }

   pub fn script_connect(&self, results: impl IntoIterator<Item = TransportError>) {
      self.state.connect_results.lock().extend(results);
   }

   pub fn connect_attempts(&self) -> usize {
      self.state.connect_times.lock().len()
   }

   pub fn called(&self, name: &str) -> usize {
      self.state.calls.lock().iter().filter(|c| **c == name).count()
   }

   /// Remote end of the most recently opened stream.
   pub fn take_peer(&self) -> DuplexStream {
      self
         .state
         .peers
         .lock()
         .pop_back()
         .expect("no stream has been opened")
   }

   /// Asks for the profile to be disconnected, as the remote stack would.
   pub fn request_peer_disconnect(&self) {
      let tx = self.state.peer_close.lock().take();
      tx.expect("no stream has been opened")
         .send(())
         .expect("disconnect request receiver dropped");
   }

   pub fn set_link(&self, connected: bool) {
      let tx = self.state.link_tx.lock().clone();
      tx.expect("link state is not being watched")
         .send(connected)
         .expect("link state receiver dropped");
   }

   fn record(&self, call: &'static str) {
      self.state.calls.lock().push(call);
   }
}

fn scripted(queue: &Mutex<VecDeque<TransportError>>) -> TransportResult<()> {
   match queue.lock().pop_front() {
      Some(err) => Err(err),
      None => Ok(()),
   }
}

impl Transport for MockTransport {
   type Adapter = SmolStr;
   type Device = SmolStr;
   type Stream = DuplexStream;

   async fn resolve_adapter(&self, name: Option<&str>) -> TransportResult<SmolStr> {
      let adapters = self.state.adapters.lock().clone();
      match name {
         Some(name) => adapters
            .into_iter()
            .find(|a| a == name)
            .ok_or(TransportError::NotFound),
         None => adapters.into_iter().next().ok_or(TransportError::NoAdapter),
      }
   }

   fn adapter_name(&self, adapter: &SmolStr) -> SmolStr {
      adapter.clone()
   }

   async fn resolve_device(&self, _adapter: &SmolStr, id: &str) -> TransportResult<SmolStr> {
      let known = self.state.devices.lock().iter().any(|d| d == id);
      if known { Ok(id.into()) } else { Err(TransportError::NotFound) }
   }

   async fn connect_device(&self, _device: &SmolStr) -> TransportResult<()> {
      self.record("connect_device");
      self.state.connect_times.lock().push(Instant::now());
      scripted(&self.state.connect_results)
   }

   async fn wait_connected(&self, _device: &SmolStr) -> TransportResult<()> {
      let silent = *self.state.link_silent.lock();
      if silent {
         std::future::pending::<()>().await;
      }
      Ok(())
   }

   async fn register_profile(&self, profile: &ProfileSpec) -> TransportResult<()> {
      self.record("register_profile");
      self.state.registered.lock().push(profile.clone());
      scripted(&self.state.register_results)
   }

   async fn connect_profile(&self, _device: &SmolStr, _service: Uuid) -> TransportResult<()> {
      self.record("connect_profile");
      scripted(&self.state.connect_profile_results)
   }

   async fn open_stream(
      &self,
      _device: &SmolStr,
      _service: Uuid,
   ) -> TransportResult<ProfileConnection<DuplexStream>> {
      self.record("open_stream");
      let pending = *self.state.stream_pending.lock();
      if pending {
         std::future::pending::<()>().await;
      }

      let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
      self.state.peers.lock().push_back(remote);
      let (close_tx, close_rx) = oneshot::channel();
      *self.state.peer_close.lock() = Some(close_tx);
      Ok(ProfileConnection {
         stream: local,
         closed: async move {
            // A replaced sender never fires.
            if close_rx.await.is_err() {
               std::future::pending::<()>().await;
            }
         }
         .boxed(),
      })
   }

   async fn watch_link_state(&self, _device: &SmolStr) -> TransportResult<LinkStateStream> {
      let (tx, mut rx) = mpsc::unbounded_channel();
      *self.state.link_tx.lock() = Some(tx);
      Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
   }

   async fn disconnect_profile(&self, _device: &SmolStr, _service: Uuid) -> TransportResult<()> {
      self.record("disconnect_profile");
      scripted(&self.state.disconnect_profile_results)
   }

   async fn unregister_profile(&self, _service: Uuid) -> TransportResult<()> {
      self.record("unregister_profile");
      Ok(())
   }
}

/// Waits for the next event, failing the test if none arrives.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SppEvent>) -> SppEvent {
   time::timeout(Duration::from_secs(30), events.recv())
      .await
      .expect("timed out waiting for event")
      .expect("event bus closed")
}

/// Waits until `events` yields an event matching `pred`, skipping others.
pub async fn wait_for(
   events: &mut mpsc::UnboundedReceiver<SppEvent>,
   pred: impl Fn(&SppEvent) -> bool,
) -> SppEvent {
   loop {
      let event = next_event(events).await;
      if pred(&event) {
         return event;
      }
   }
}
