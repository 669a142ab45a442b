//! Bluetooth transport plugin.
//!
//! This module provides the `bt` transport: the plugin factory and its
//! lifecycle, RFCOMM connectors and acceptors, endpoint parsing, and device
//! discovery over BlueZ.

use std::sync::Arc;

use log::debug;

use crate::{
   communicator::CommunicatorHandle,
   error::{Result, TransportError},
   plugin::Plugin,
};

pub mod discovery;
pub mod endpoint;
pub mod instance;
pub mod plugin;
pub mod transport;

pub use plugin::BtPlugin;

/// Name the Bluetooth factory is registered under.
pub const FACTORY_NAME: &str = "bt";

/// Creates an uninitialized Bluetooth plugin bound to `communicator`.
///
/// Performs no I/O. Fails with `PluginInitialization` when the handle does
/// not refer to a live communicator.
pub fn create(communicator: &CommunicatorHandle, name: &str, args: &[String]) -> Result<Arc<dyn Plugin>> {
   let live = communicator
      .upgrade()
      .ok_or_else(|| TransportError::plugin_init(name, "communicator handle is null"))?;
   if live.is_destroyed() {
      return Err(TransportError::plugin_init(name, "communicator has been destroyed"));
   }
   if !args.is_empty() {
      debug!("Plugin {name} ignores arguments {args:?}");
   }

   let config = live.config().bluetooth.clone();
   Ok(Arc::new(BtPlugin::new(communicator.clone(), name, config)))
}
