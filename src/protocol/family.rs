//! Device families and the wire variant each of them speaks.
//!
//! The family is the only thing callers configure: the service UUID used for
//! profile registration and the header layout of every frame follow from it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Service UUID advertised by first generation devices.
pub const LEGACY_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001102_0000_1000_8000_00805f9b34fd);
/// Standard Serial Port Profile UUID.
pub const SPP_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/// Header byte layout of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum WireVariant {
   /// `[SOM][kind][size][id]...`
   Legacy,
   /// `[SOM][size lo][kind bit | size hi][id]...`
   Extended,
}

impl WireVariant {
   pub const fn start_marker(self) -> u8 {
      match self {
         Self::Legacy => 0xFE,
         Self::Extended => 0xFD,
      }
   }

   pub const fn end_marker(self) -> u8 {
      match self {
         Self::Legacy => 0xEE,
         Self::Extended => 0xDD,
      }
   }

   /// Largest value the header can carry in its size field.
   pub const fn max_size(self) -> usize {
      match self {
         Self::Legacy => 0xFF,
         Self::Extended => 0x3FF,
      }
   }

   /// Largest payload that still fits in the size field (id and CRC excluded).
   pub const fn max_payload_len(self) -> usize {
      self.max_size() - 3
   }
}

/// Supported device families.
#[derive(
   Debug,
   Clone,
   Copy,
   Default,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum DeviceFamily {
   #[strum(serialize = "buds")]
   Buds,
   #[default]
   #[strum(serialize = "buds_plus", serialize = "buds+")]
   BudsPlus,
   #[strum(serialize = "buds_live")]
   BudsLive,
   #[strum(serialize = "buds_pro")]
   BudsPro,
   #[strum(serialize = "buds2")]
   Buds2,
}

impl DeviceFamily {
   pub const fn wire_variant(self) -> WireVariant {
      match self {
         Self::Buds => WireVariant::Legacy,
         Self::BudsPlus | Self::BudsLive | Self::BudsPro | Self::Buds2 => WireVariant::Extended,
      }
   }

   pub const fn service_uuid(self) -> Uuid {
      match self {
         Self::Buds => LEGACY_SERVICE_UUID,
         Self::BudsPlus | Self::BudsLive | Self::BudsPro | Self::Buds2 => SPP_SERVICE_UUID,
      }
   }
}
