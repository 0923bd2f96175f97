//! Configuration management for the SPP engine.
//!
//! This module handles loading and saving configuration from disk: the
//! target device, its family, and the timing parameters of the connect
//! sequence and the pump.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   error::{Result, SppError},
   protocol::DeviceFamily,
};

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Address of the peripheral to connect to, e.g. `AA:BB:CC:11:22:33`.
   #[serde(default)]
   pub device_address: Option<String>,

   #[serde(default)]
   pub device_family: DeviceFamily,

   /// Preferred adapter name; the default adapter is used when unset or
   /// unavailable.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_profile_name")]
   pub profile_name: String,

   #[serde(default = "default_connect_attempts")]
   pub connect_attempts: u32,

   #[serde(default = "default_connect_retry_interval")]
   pub connect_retry_interval_ms: u64,

   #[serde(default = "default_link_confirm_timeout")]
   pub link_confirm_timeout_sec: u64,

   #[serde(default = "default_stream_accept_timeout")]
   pub stream_accept_timeout_sec: u64,

   #[serde(default = "default_send_pacing")]
   pub send_pacing_ms: u64,

   #[serde(default = "default_auto_reconnect")]
   pub auto_reconnect: bool,
}

fn default_profile_name() -> String {
   "sppwire".to_owned()
}

const fn default_connect_attempts() -> u32 {
   10
}

const fn default_connect_retry_interval() -> u64 {
   100
}

const fn default_link_confirm_timeout() -> u64 {
   15
}

const fn default_stream_accept_timeout() -> u64 {
   10
}

const fn default_send_pacing() -> u64 {
   1000
}

const fn default_auto_reconnect() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         device_address: None,
         device_family: DeviceFamily::default(),
         adapter: None,
         profile_name: default_profile_name(),
         connect_attempts: default_connect_attempts(),
         connect_retry_interval_ms: default_connect_retry_interval(),
         link_confirm_timeout_sec: default_link_confirm_timeout(),
         stream_accept_timeout_sec: default_stream_accept_timeout(),
         send_pacing_ms: default_send_pacing(),
         auto_reconnect: default_auto_reconnect(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let path = if let Ok(home) = env::var("SPPWIRE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home).join("sppwire")
      } else if let Some(config_dir) = dirs::config_dir() {
         config_dir.join("sppwire")
      } else {
         return Err(SppError::ConfigDirNotFound);
      };

      Ok(path.join("config.toml"))
   }

   pub fn connect_retry_interval(&self) -> Duration {
      Duration::from_millis(self.connect_retry_interval_ms)
   }

   pub fn link_confirm_timeout(&self) -> Duration {
      Duration::from_secs(self.link_confirm_timeout_sec)
   }

   pub fn stream_accept_timeout(&self) -> Duration {
      Duration::from_secs(self.stream_accept_timeout_sec)
   }

   pub fn send_pacing(&self) -> Duration {
      Duration::from_millis(self.send_pacing_ms)
   }
}
