//! Link liveness watchdog.
//!
//! Holds at most one link-state subscription. Arming it again releases the
//! previous subscription first.

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::{
   bluetooth::transport::LinkStateStream,
   event::{EventSender, LINK_DOWN_REASON, SppEvent},
};

#[derive(Debug, Default)]
pub struct Watchdog {
   subscription: Option<JoinHandle<()>>,
}

impl Watchdog {
   pub const fn new() -> Self {
      Self { subscription: None }
   }

   pub fn is_armed(&self) -> bool {
      self
         .subscription
         .as_ref()
         .is_some_and(|handle| !handle.is_finished())
   }

   /// Starts watching `states`, replacing any previous subscription.
   ///
   /// Every transition is reported on the event bus and then handed to
   /// `on_change`.
   pub fn arm<F>(&mut self, mut states: LinkStateStream, event_tx: EventSender, mut on_change: F)
   where
      F: FnMut(bool) + Send + 'static,
   {
      self.release();
      self.subscription = Some(tokio::spawn(async move {
         while let Some(connected) = states.next().await {
            if connected {
               info!("Link reported connected, ready for reconnection");
               event_tx.emit(SppEvent::ReadyForReconnection);
            } else {
               warn!("Link {LINK_DOWN_REASON}");
               event_tx.emit(SppEvent::ConnectionLost(LINK_DOWN_REASON.into()));
            }
            on_change(connected);
         }
         debug!("Link state stream ended");
      }));
   }

   pub fn release(&mut self) {
      if let Some(handle) = self.subscription.take() {
         handle.abort();
      }
   }
}

impl Drop for Watchdog {
   fn drop(&mut self) {
      self.release();
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::Arc, time::Duration};

   use futures::stream;
   use parking_lot::Mutex;
   use tokio::{sync::mpsc, time};

   use super::*;
   use crate::event::ChannelEventBus;

   #[tokio::test]
   async fn test_reports_transitions() {
      let (bus, mut events) = ChannelEventBus::new();
      let seen = Arc::new(Mutex::new(Vec::new()));
      let mut watchdog = Watchdog::new();

      watchdog.arm(stream::iter([false, true]).boxed(), bus, {
         let seen = seen.clone();
         move |state| seen.lock().push(state)
      });

      assert!(matches!(
         events.recv().await,
         Some(SppEvent::ConnectionLost(reason)) if reason == LINK_DOWN_REASON
      ));
      assert!(matches!(
         events.recv().await,
         Some(SppEvent::ReadyForReconnection)
      ));
      time::sleep(Duration::from_millis(10)).await;
      assert_eq!(*seen.lock(), vec![false, true]);
   }

   #[tokio::test]
   async fn test_rearm_releases_previous_subscription() {
      let (bus, mut events) = ChannelEventBus::new();
      let (old_tx, old_rx) = mpsc::unbounded_channel::<bool>();
      let (new_tx, new_rx) = mpsc::unbounded_channel::<bool>();
      let mut watchdog = Watchdog::new();

      let to_stream = |mut rx: mpsc::UnboundedReceiver<bool>| {
         stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
      };

      watchdog.arm(to_stream(old_rx), bus.clone(), |_| {});
      assert!(watchdog.is_armed());
      watchdog.arm(to_stream(new_rx), bus, |_| {});
      tokio::task::yield_now().await;

      let _ = old_tx.send(false);
      new_tx.send(true).unwrap();

      assert!(matches!(
         events.recv().await,
         Some(SppEvent::ReadyForReconnection)
      ));
      time::sleep(Duration::from_millis(10)).await;
      assert!(events.try_recv().is_err());

      watchdog.release();
      assert!(!watchdog.is_armed());
   }
}
