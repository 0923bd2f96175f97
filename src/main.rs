//! `sppwired`: keeps an SPP session to a configured peripheral.
//!
//! Received messages are logged as JSON. Lines on stdin of the form
//! `<id> <payload>` (both hex) are sent as requests.

use std::env;

use log::{debug, error, info, warn};
use tokio::{
   io::{AsyncBufReadExt, BufReader},
   signal,
};

use sppwire::{
   ChannelEventBus, Config, ConnectionManager, Result, SppError, SppEvent,
   bluetooth::bluez::BluezTransport,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting sppwired...");

   let config = Config::load()?;
   let Some(address) = env::args().nth(1).or_else(|| config.device_address.clone()) else {
      error!(
         "No device address given; pass one as argument or set device_address in {}",
         Config::config_path()?.display()
      );
      return Err(SppError::ConfigurationInvalid("missing device address".into()));
   };
   info!("Loaded configuration for {} ({})", address, config.device_family);

   let (event_bus, mut events) = ChannelEventBus::new();
   tokio::spawn(async move {
      while let Some(event) = events.recv().await {
         log_event(event);
      }
   });

   let transport = BluezTransport::new().await?;
   let preferred = config.adapter.clone();
   let manager = ConnectionManager::new(transport, event_bus, config);

   manager.select_adapter(preferred.as_deref()).await?;
   manager.connect(&address).await?;

   tokio::spawn(forward_stdin(manager.clone()));

   signal::ctrl_c().await?;
   info!("Shutting down sppwired...");
   manager.disconnect().await?;

   Ok(())
}

async fn forward_stdin(manager: ConnectionManager) {
   let mut lines = BufReader::new(tokio::io::stdin()).lines();
   while let Ok(Some(line)) = lines.next_line().await {
      let line = line.trim();
      if line.is_empty() {
         continue;
      }
      let (id, payload) = line.split_once(' ').unwrap_or((line, ""));
      let Ok(id) = u8::from_str_radix(id, 16) else {
         warn!("Invalid message id: {id}");
         continue;
      };
      let payload = match hex::decode(payload.replace(' ', "")) {
         Ok(payload) => payload,
         Err(e) => {
            warn!("Invalid payload: {e}");
            continue;
         },
      };
      if let Err(e) = manager.send_request(id, &payload) {
         warn!("Cannot send message {id:#04x}: {e}");
      }
   }
}

fn log_event(event: SppEvent) {
   match event {
      SppEvent::Connecting => info!("Connecting..."),
      SppEvent::Connected => info!("Connected"),
      SppEvent::ReadyForReconnection => info!("Link is back"),
      SppEvent::ConnectionLost(reason) => warn!("Connection lost: {reason}"),
      SppEvent::ConnectionFailed(reason) => warn!("Reconnect failed: {reason}"),
      SppEvent::DataReceived(data) => debug!("Read {} byte(s)", data.len()),
      SppEvent::MessageReceived(msg) => println!("{}", msg.to_json()),
      SppEvent::MalformedData(e) => warn!("Malformed data: {e}"),
   }
}
