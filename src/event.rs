//! Event handling for connection and traffic notifications.
//!
//! The engine never calls back into application code directly; everything it
//! has to report goes through an [`EventBus`].

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use log::debug;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::protocol::{FrameError, Message};

/// Reason attached to a connection loss reported by the link watchdog.
pub const LINK_DOWN_REASON: &str = "reported disconnected by transport";
/// Reason attached to a connection loss requested by the peer's stack.
pub const PEER_DISCONNECT_REASON: &str = "disconnection requested by peer";

/// Events that can be emitted by the engine.
#[derive(Debug, Clone)]
pub enum SppEvent {
   /// A connect attempt has started.
   Connecting,
   /// The stream is up and the pump is running.
   Connected,
   /// The link came back; callers wanting auto-reconnect may act on it.
   ReadyForReconnection,
   /// The session was lost.
   ConnectionLost(SmolStr),
   /// A background (re)connect attempt failed.
   ConnectionFailed(SmolStr),
   /// Raw bytes as read from the stream, before reassembly.
   DataReceived(Bytes),
   MessageReceived(Message),
   /// A frame could not be decoded; the receive buffer was discarded.
   MalformedData(FrameError),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: SppEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Event bus delivering into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventBus {
   tx: mpsc::UnboundedSender<SppEvent>,
}

impl ChannelEventBus {
   /// Creates the bus together with the receiving end.
   pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SppEvent>) {
      let (tx, rx) = mpsc::unbounded_channel();
      (Arc::new(Self { tx }), rx)
   }
}

impl EventBus for ChannelEventBus {
   fn emit(&self, event: SppEvent) {
      // A dropped receiver only means nobody is listening anymore.
      let _ = self.tx.send(event);
   }
}

/// Forwards events, dropping disconnection reports while suppressed.
pub struct DisconnectFilter {
   inner: EventSender,
   suppressed: AtomicBool,
}

impl DisconnectFilter {
   pub fn new(inner: EventSender) -> Arc<Self> {
      Arc::new(Self {
         inner,
         suppressed: AtomicBool::new(false),
      })
   }

   pub fn set_suppressed(&self, suppressed: bool) {
      self.suppressed.store(suppressed, Ordering::Release);
   }

   pub fn is_suppressed(&self) -> bool {
      self.suppressed.load(Ordering::Acquire)
   }
}

impl EventBus for DisconnectFilter {
   fn emit(&self, event: SppEvent) {
      if self.is_suppressed()
         && matches!(event, SppEvent::ConnectionLost(_) | SppEvent::ConnectionFailed(_))
      {
         debug!("Suppressed {event:?}");
         return;
      }
      self.inner.emit(event);
   }
}
