//! Bluetooth transport daemon.
//!
//! Starts a communicator with the built-in plugins, listens on the
//! configured `bt` endpoints and echoes every frame back to its sender.
//! Optionally runs device discovery and logs what it finds.

use std::sync::Arc;

use bluer::Address;
use log::{info, warn};
use tokio::{signal, task::JoinSet};

use btrpc::{
   Communicator,
   bluetooth::{BtPlugin, FACTORY_NAME},
   config::Config,
   connection::Connection,
   error::Result,
   event::DiscoveryEvent,
   plugin::PluginRegistry,
   transport::Acceptor,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btrpc daemon...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} plugins and {} endpoints",
      config.plugins.len(),
      config.listen.len()
   );

   let communicator = Communicator::initialize(config, &PluginRegistry::builtin()).await?;

   if communicator.config().discover {
      start_discovery(&communicator).await;
   }

   let mut servers = JoinSet::new();
   for endpoint in communicator.config().listen.clone() {
      match communicator.listen(&endpoint).await {
         Ok(acceptor) => {
            servers.spawn(serve(acceptor));
         },
         Err(e) => warn!("Failed to listen on {endpoint}: {e}"),
      }
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down btrpc daemon...");

   // Destroying the communicator wakes every pending accept.
   communicator.destroy();
   while servers.join_next().await.is_some() {}
   Ok(())
}

async fn start_discovery(communicator: &Communicator) {
   let plugins = communicator.plugins().names();
   let Some(plugin) = plugins
      .iter()
      .filter_map(|name| communicator.plugin(name))
      .find(|p| p.as_any().is::<BtPlugin>())
   else {
      warn!("Discovery requested but no {FACTORY_NAME} plugin is loaded");
      return;
   };
   let Some(bt) = plugin.as_any().downcast_ref::<BtPlugin>() else {
      return;
   };

   let listener = Arc::new(|adapter: Address, event: DiscoveryEvent| match event {
      DiscoveryEvent::DeviceFound(info) => info!("[{adapter}] found {}", info.to_json()),
      DiscoveryEvent::DeviceLost(address) => info!("[{adapter}] lost {address}"),
   });
   if let Err(e) = bt.start_discovery(None, listener).await {
      warn!("Failed to start discovery: {e}");
   }
}

async fn serve(mut acceptor: Box<dyn Acceptor>) {
   let mut connections = JoinSet::new();
   loop {
      match acceptor.accept().await {
         Ok(conn) => {
            connections.spawn(echo(conn));
         },
         Err(e) => {
            warn!("Stopped accepting on {}: {e}", acceptor.endpoint());
            break;
         },
      }
   }
   acceptor.close();
}

async fn echo(mut conn: Connection) {
   loop {
      let frame = match conn.recv().await {
         Ok(frame) => frame,
         Err(e) => {
            info!("Connection from {} ended: {e}", conn.peer());
            return;
         },
      };
      if let Err(e) = conn.send(&frame).await {
         warn!("Failed to echo to {}: {e}", conn.peer());
         return;
      }
   }
}
