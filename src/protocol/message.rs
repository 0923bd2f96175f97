//! Application messages and their wire encoding.

use std::fmt;

use serde_json::json;
use smallvec::SmallVec;

use crate::protocol::{
   crc,
   family::WireVariant,
};

pub type Payload = SmallVec<[u8; 32]>;

/// Bytes occupied by the id and the two CRC bytes.
pub const SIZE_OVERHEAD: usize = 3;
/// Start marker, two header bytes and the end marker.
pub const FRAMING_OVERHEAD: usize = 4;
/// Offset of the id byte inside a frame.
pub const ID_OFFSET: usize = 3;
/// Offset of the first payload byte inside a frame.
pub const PAYLOAD_OFFSET: usize = 4;

/// Bit in the second Extended header byte that marks a response.
pub(crate) const EXTENDED_RESPONSE_BIT: u8 = 0x10;
/// Bits in the second Extended header byte carrying size bits 8 and 9.
pub(crate) const EXTENDED_SIZE_HIGH_MASK: u8 = 0x03;

/// Direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum MessageKind {
   Request,
   Response,
}

impl MessageKind {
   /// Legacy header byte.
   pub const fn legacy_byte(self) -> u8 {
      match self {
         Self::Request => 0x00,
         Self::Response => 0x01,
      }
   }

   pub const fn from_legacy_byte(byte: u8) -> Self {
      if byte == 0 { Self::Request } else { Self::Response }
   }
}

/// A single unit of application data.
///
/// Outbound messages carry a checksum of zero. Decoded messages carry the CRC
/// recomputed over the received bytes, which is zero for an intact frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
   id: u8,
   kind: MessageKind,
   payload: Payload,
   checksum: u16,
}

impl Message {
   pub fn new(id: u8, kind: MessageKind, payload: &[u8]) -> Self {
      Self {
         id,
         kind,
         payload: Payload::from_slice(payload),
         checksum: 0,
      }
   }

   pub fn request(id: u8, payload: &[u8]) -> Self {
      Self::new(id, MessageKind::Request, payload)
   }

   pub fn response(id: u8, payload: &[u8]) -> Self {
      Self::new(id, MessageKind::Response, payload)
   }

   pub(crate) const fn decoded(id: u8, kind: MessageKind, payload: Payload, checksum: u16) -> Self {
      Self {
         id,
         kind,
         payload,
         checksum,
      }
   }

   pub const fn id(&self) -> u8 {
      self.id
   }

   pub const fn kind(&self) -> MessageKind {
      self.kind
   }

   pub fn payload(&self) -> &[u8] {
      &self.payload
   }

   pub const fn checksum(&self) -> u16 {
      self.checksum
   }

   /// Whether the recomputed checksum matched.
   pub const fn is_intact(&self) -> bool {
      self.checksum == 0
   }

   /// Id, payload and CRC.
   pub fn size(&self) -> usize {
      self.payload.len() + SIZE_OVERHEAD
   }

   pub fn total_frame_size(&self) -> usize {
      self.size() + FRAMING_OVERHEAD
   }

   /// Encodes the message into a complete frame.
   ///
   /// The payload must fit `variant.max_payload_len()`.
   pub fn encode(&self, variant: WireVariant) -> Vec<u8> {
      debug_assert!(
         self.payload.len() <= variant.max_payload_len(),
         "payload of {} bytes exceeds the {variant} limit",
         self.payload.len()
      );

      let size = self.size();
      let mut frame = vec![0u8; self.total_frame_size()];
      frame[0] = variant.start_marker();
      match variant {
         WireVariant::Legacy => {
            frame[1] = self.kind.legacy_byte();
            frame[2] = size as u8;
         },
         WireVariant::Extended => {
            frame[1] = (size & 0xFF) as u8;
            frame[2] = ((size >> 8) as u8 & EXTENDED_SIZE_HIGH_MASK)
               | match self.kind {
                  MessageKind::Request => 0,
                  MessageKind::Response => EXTENDED_RESPONSE_BIT,
               };
         },
      }
      frame[ID_OFFSET] = self.id;

      let crc_offset = PAYLOAD_OFFSET + self.payload.len();
      frame[PAYLOAD_OFFSET..crc_offset].copy_from_slice(&self.payload);

      let checksum = crc::crc16_ccitt(&frame[ID_OFFSET..crc_offset]);
      frame[crc_offset..crc_offset + 2].copy_from_slice(&checksum.to_le_bytes());
      frame[crc_offset + 2] = variant.end_marker();
      frame
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "id": self.id,
          "kind": <&'static str>::from(self.kind),
          "size": self.size(),
          "intact": self.is_intact(),
          "payload": hex::encode(&self.payload),
      })
   }
}

impl fmt::Display for Message {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "Message[id=0x{:02x}, kind={}, size={}, crc=0x{:04x}, payload={{{}}}]",
         self.id,
         self.kind,
         self.size(),
         self.checksum,
         hex::encode(&self.payload)
      )
   }
}
