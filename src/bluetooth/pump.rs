//! Duplex pump moving frames between a session's stream and the application.
//!
//! The pump owns the stream for the whole lifetime of a session. Inbound
//! bytes are reassembled into frames and reported as events; outbound
//! messages are taken from a shared queue, one per iteration, and written
//! with a settling delay in between.

use std::{io, sync::Arc, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt},
   select,
   sync::Notify,
   task::JoinHandle,
   time,
};
use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::transport::DuplexStream,
   error::SppError,
   event::{EventSender, SppEvent},
   protocol::{FrameError, Message, WireVariant, codec},
};

/// Size of a single read from the stream.
pub const READ_CHUNK_SIZE: usize = 2048;
/// Maximum time to wait for a cancelled pump to wind down.
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// === Outbound queue ===

/// Unbounded FIFO shared between senders and the pump.
#[derive(Debug, Default)]
pub struct OutboundQueue {
   queue: SegQueue<Message>,
   notifier: Notify,
}

impl OutboundQueue {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn push(&self, msg: Message) {
      self.queue.push(msg);
      self.notifier.notify_one();
   }

   pub fn pop(&self) -> Option<Message> {
      self.queue.pop()
   }

   /// Waits for the next message. Cancel safe: a message is only removed
   /// from the queue when it is returned.
   pub async fn recv(&self) -> Message {
      loop {
         if let Some(msg) = self.queue.pop() {
            return msg;
         }
         self.notifier.notified().await;
      }
   }

   pub fn clear(&self) -> usize {
      let mut dropped = 0;
      while self.queue.pop().is_some() {
         dropped += 1;
      }
      dropped
   }

   pub fn len(&self) -> usize {
      self.queue.len()
   }

   pub fn is_empty(&self) -> bool {
      self.queue.is_empty()
   }
}

// === Reassembly ===

/// Receive buffer; consumed bytes are split off the front.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
   buf: BytesMut,
}

impl FrameAccumulator {
   pub fn with_capacity(capacity: usize) -> Self {
      Self {
         buf: BytesMut::with_capacity(capacity),
      }
   }

   pub fn extend(&mut self, data: &[u8]) {
      self.buf.extend_from_slice(data);
   }

   /// Unconsumed bytes.
   pub fn remaining(&self) -> &[u8] {
      &self.buf
   }

   pub fn len(&self) -> usize {
      self.buf.len()
   }

   pub fn is_empty(&self) -> bool {
      self.buf.is_empty()
   }

   /// Consumes `n` bytes, clamped to what is available.
   pub fn advance(&mut self, n: usize) {
      let n = n.min(self.buf.len());
      self.buf.advance(n);
   }

   pub fn clear(&mut self) {
      self.buf.clear();
   }

   /// Zero padding delivered by some platforms after the last frame.
   pub fn is_zero_tail(&self) -> bool {
      self.buf.iter().all(|&b| b == 0)
   }
}

/// Result of feeding bytes to a [`FrameAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
   Message(Message),
   Malformed(FrameError),
}

/// Splits an unbounded byte stream into frames.
///
/// A framing error discards everything buffered so far; no byte-wise
/// resynchronisation is attempted. A truncated frame is kept until the rest
/// of it arrives.
#[derive(Debug)]
pub struct FrameAssembler {
   acc: FrameAccumulator,
   variant: WireVariant,
}

impl FrameAssembler {
   pub fn new(variant: WireVariant) -> Self {
      Self {
         acc: FrameAccumulator::with_capacity(READ_CHUNK_SIZE),
         variant,
      }
   }

   pub fn buffered(&self) -> usize {
      self.acc.len()
   }

   pub fn push(&mut self, data: &[u8]) -> Vec<Inbound> {
      self.acc.extend(data);

      let mut out = Vec::new();
      while !self.acc.is_empty() {
         if self.acc.is_zero_tail() {
            self.acc.clear();
            break;
         }

         match codec::decode(self.acc.remaining(), self.variant) {
            Ok((msg, len)) => {
               let exhausted = len >= self.acc.len();
               out.push(Inbound::Message(msg));
               if exhausted {
                  self.acc.clear();
                  break;
               }
               self.acc.advance(len);
            },
            Err(e) if e.is_truncated() && self.acc.remaining()[0] == self.variant.start_marker() => {
               debug!("Waiting for the rest of a frame ({e})");
               break;
            },
            Err(e) => {
               out.push(Inbound::Malformed(e));
               self.acc.clear();
               break;
            },
         }
      }
      out
   }
}

// === Pump ===

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
   Cancelled,
   Lost(SppError),
}

impl PumpExit {
   pub const fn is_cancelled(&self) -> bool {
      matches!(self, Self::Cancelled)
   }
}

enum Step {
   Cancelled,
   Read(io::Result<usize>),
   Outbound(Message),
}

/// Settings fixed for the lifetime of one pump.
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
   pub variant: WireVariant,
   /// Delay after each transmitted frame.
   pub pacing: Duration,
}

pub struct Pump<S> {
   stream: S,
   assembler: FrameAssembler,
   queue: Arc<OutboundQueue>,
   event_tx: EventSender,
   cancel: CancellationToken,
   config: PumpConfig,
}

impl<S: DuplexStream> Pump<S> {
   pub fn new(
      stream: S,
      config: PumpConfig,
      queue: Arc<OutboundQueue>,
      event_tx: EventSender,
      cancel: CancellationToken,
   ) -> Self {
      Self {
         stream,
         assembler: FrameAssembler::new(config.variant),
         queue,
         event_tx,
         cancel,
         config,
      }
   }

   pub async fn run(mut self) -> PumpExit {
      info!("Pump started ({} frames)", self.config.variant);
      let mut chunk = [0u8; READ_CHUNK_SIZE];

      loop {
         if self.cancel.is_cancelled() {
            return self.cancelled();
         }

         let step = select! {
            biased;
            () = self.cancel.cancelled() => Step::Cancelled,
            res = self.stream.read(&mut chunk) => Step::Read(res),
            msg = self.queue.recv() => Step::Outbound(msg),
         };

         let outbound = match step {
            Step::Cancelled => return self.cancelled(),
            Step::Read(Ok(0)) => {
               return self.fail(io::Error::new(
                  io::ErrorKind::UnexpectedEof,
                  "stream closed by peer",
               ));
            },
            Step::Read(Ok(n)) => {
               self.dispatch(&chunk[..n]);
               self.queue.pop()
            },
            Step::Read(Err(e)) => return self.fail(e),
            Step::Outbound(msg) => Some(msg),
         };

         let Some(msg) = outbound else {
            continue;
         };
         if let Err(e) = self.transmit(&msg).await {
            return self.fail(e);
         }
         if !self.config.pacing.is_zero() {
            select! {
               biased;
               () = self.cancel.cancelled() => return self.cancelled(),
               () = time::sleep(self.config.pacing) => {},
            }
         }
      }
   }

   fn dispatch(&mut self, data: &[u8]) {
      debug!("← {}", hex::encode(data));
      self
         .event_tx
         .emit(SppEvent::DataReceived(Bytes::copy_from_slice(data)));
      for inbound in self.assembler.push(data) {
         match inbound {
            Inbound::Message(msg) => {
               debug!("<< Incoming: {msg}");
               self.event_tx.emit(SppEvent::MessageReceived(msg));
            },
            Inbound::Malformed(e) => {
               warn!("Invalid data received, dropping buffer: {e}");
               self.event_tx.emit(SppEvent::MalformedData(e));
            },
         }
      }
   }

   async fn transmit(&mut self, msg: &Message) -> io::Result<()> {
      let frame = msg.encode(self.config.variant);
      debug!(">> Outgoing: {msg}");
      debug!("→ {}", hex::encode(&frame));
      self.stream.write_all(&frame).await?;
      self.stream.flush().await
   }

   fn cancelled(&self) -> PumpExit {
      info!("Pump cancelled");
      PumpExit::Cancelled
   }

   fn fail(&self, e: io::Error) -> PumpExit {
      error!("Stream failed, shutting pump down: {e}");
      self.event_tx.emit(SppEvent::ConnectionLost(e.to_string().into()));
      PumpExit::Lost(SppError::TransportIo(e))
   }
}

/// Running pump task together with its cancellation signal.
#[derive(Debug)]
pub struct PumpHandle {
   cancel: CancellationToken,
   handle: JoinHandle<PumpExit>,
}

impl PumpHandle {
   /// Spawns the pump; `on_exit` runs on the pump task once it stops.
   pub fn spawn<S, F>(
      stream: S,
      config: PumpConfig,
      queue: Arc<OutboundQueue>,
      event_tx: EventSender,
      on_exit: F,
   ) -> Self
   where
      S: DuplexStream,
      F: FnOnce(&PumpExit) + Send + 'static,
   {
      let cancel = CancellationToken::new();
      let pump = Pump::new(stream, config, queue, event_tx, cancel.clone());
      let handle = tokio::spawn(async move {
         let exit = pump.run().await;
         on_exit(&exit);
         exit
      });
      Self { cancel, handle }
   }

   pub fn is_finished(&self) -> bool {
      self.handle.is_finished()
   }

   /// Cancels the pump and waits for it to release the stream.
   pub async fn stop(mut self) -> Option<PumpExit> {
      self.cancel.cancel();
      match time::timeout(PUMP_JOIN_TIMEOUT, &mut self.handle).await {
         Ok(Ok(exit)) => Some(exit),
         Ok(Err(e)) => {
            error!("Pump task panicked: {e}");
            None
         },
         Err(_) => {
            warn!("Pump did not stop within {PUMP_JOIN_TIMEOUT:?}, aborting");
            self.handle.abort();
            None
         },
      }
   }
}
