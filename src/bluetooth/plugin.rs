//! The Bluetooth transport plugin and its lifecycle.

use std::{any::Any, collections::HashMap, sync::Arc};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   bluetooth::{
      discovery::DeviceInfo,
      endpoint::PROTOCOL,
      instance::Instance,
      transport::BtEndpointFactory,
   },
   communicator::CommunicatorHandle,
   config::BluetoothConfig,
   error::{Result, TransportError},
   event::DiscoverySender,
   plugin::{Plugin, PluginState},
};

/// Bluetooth transport plugin.
///
/// Construction is free of I/O. `initialize` opens the BlueZ session and
/// registers the `bt` endpoint factory with the communicator; `destroy`
/// undoes both.
pub struct BtPlugin {
   name: SmolStr,
   communicator: CommunicatorHandle,
   config: BluetoothConfig,
   state: AtomicCell<PluginState>,
   instance: Mutex<Option<Arc<Instance>>>,
}

impl BtPlugin {
   pub fn new(communicator: CommunicatorHandle, name: &str, config: BluetoothConfig) -> Self {
      Self {
         name: name.into(),
         communicator,
         config,
         state: AtomicCell::new(PluginState::Uninitialized),
         instance: Mutex::new(None),
      }
   }

   fn instance(&self) -> Result<Arc<Instance>> {
      match self.state.load() {
         PluginState::Initialized => self
            .instance
            .lock()
            .clone()
            .ok_or_else(|| TransportError::PluginNotInitialized(self.name.clone())),
         PluginState::Uninitialized => Err(TransportError::PluginNotInitialized(self.name.clone())),
         PluginState::Destroyed => Err(TransportError::PluginDestroyed(self.name.clone())),
      }
   }

   async fn do_initialize(&self) -> Result<()> {
      match self.state.load() {
         PluginState::Uninitialized => {},
         PluginState::Initialized => {
            return Err(TransportError::PluginAlreadyInitialized(self.name.clone()));
         },
         PluginState::Destroyed => return Err(TransportError::PluginDestroyed(self.name.clone())),
      }

      let communicator = self
         .communicator
         .live()
         .map_err(|e| TransportError::plugin_init(self.name.clone(), e))?;

      let instance = Instance::open(&self.name, self.config.clone())
         .await
         .map_err(|e| match e {
            e @ TransportError::PluginInitialization { .. } => e,
            e => TransportError::plugin_init(self.name.clone(), e),
         })?;
      let instance = Arc::new(instance);

      let mut slot = self.instance.lock();
      if let Err(e) =
         communicator.add_endpoint_factory(Arc::new(BtEndpointFactory::new(instance.clone())))
      {
         instance.destroy();
         return Err(TransportError::plugin_init(self.name.clone(), e));
      }
      if let Err(state) = self
         .state
         .compare_exchange(PluginState::Uninitialized, PluginState::Initialized)
      {
         communicator.remove_endpoint_factory(PROTOCOL);
         instance.destroy();
         return Err(match state {
            PluginState::Destroyed => TransportError::PluginDestroyed(self.name.clone()),
            _ => TransportError::PluginAlreadyInitialized(self.name.clone()),
         });
      }
      *slot = Some(instance);
      info!("Plugin {} initialized", self.name);
      Ok(())
   }

   /// Address of the adapter the plugin uses.
   pub fn adapter_address(&self) -> Result<Address> {
      Ok(self.instance()?.adapter_address())
   }

   /// Starts discovery on the adapter with `adapter`, or on the plugin's
   /// adapter when `None`. Events go to `listener`.
   pub async fn start_discovery(&self, adapter: Option<Address>, listener: DiscoverySender) -> Result<()> {
      let instance = self.instance()?;
      let adapter = match adapter {
         Some(address) => instance.adapter_by_address(address).await?,
         None => instance.adapter().clone(),
      };
      instance.discovery().start(adapter, listener).await
   }

   /// Stops discovery on `adapter` (the plugin's adapter when `None`).
   /// Returns whether discovery was running.
   pub fn stop_discovery(&self, adapter: Option<Address>) -> Result<bool> {
      let instance = self.instance()?;
      let address = adapter.unwrap_or_else(|| instance.adapter_address());
      Ok(instance.discovery().stop(address))
   }

   /// Devices found by discovery and not since lost.
   pub fn devices(&self) -> Result<HashMap<Address, DeviceInfo>> {
      Ok(self.instance()?.discovery().devices())
   }
}

impl Plugin for BtPlugin {
   fn name(&self) -> &str {
      &self.name
   }

   fn state(&self) -> PluginState {
      self.state.load()
   }

   fn communicator(&self) -> &CommunicatorHandle {
      &self.communicator
   }

   fn initialize(&self) -> BoxFuture<'_, Result<()>> {
      Box::pin(self.do_initialize())
   }

   fn destroy(&self) {
      if self.state.swap(PluginState::Destroyed) == PluginState::Destroyed {
         debug!("Plugin {} already destroyed", self.name);
         return;
      }

      if let Some(instance) = self.instance.lock().take() {
         match self.communicator.upgrade() {
            Some(communicator) => {
               communicator.remove_endpoint_factory(PROTOCOL);
            },
            None => warn!("Plugin {} outlived its communicator", self.name),
         }
         instance.destroy();
      }
      info!("Plugin {} destroyed", self.name);
   }

   fn as_any(&self) -> &dyn Any {
      self
   }
}

impl Drop for BtPlugin {
   fn drop(&mut self) {
      if self.state.load() == PluginState::Initialized {
         self.destroy();
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{bluetooth::create, communicator::Communicator, config::Config};

   fn bt(plugin: &Arc<dyn Plugin>) -> &BtPlugin {
      plugin.as_any().downcast_ref::<BtPlugin>().expect("a BtPlugin")
   }

   #[test]
   fn test_create_binds_exact_communicator() -> Result<()> {
      let communicator = Communicator::new(Config::default());
      let other = Communicator::new(Config::default());

      let args = vec!["--trace".to_string()];
      let plugin = create(&communicator.handle(), "bt", &args)?;
      assert_eq!(plugin.name(), "bt");
      assert!(plugin.communicator().same_as(&communicator));
      assert!(!plugin.communicator().same_as(&other));
      assert_eq!(plugin.state(), PluginState::Uninitialized);
      Ok(())
   }

   #[test]
   fn test_create_uses_communicator_config() -> Result<()> {
      let mut config = Config::default();
      config.bluetooth.adapter = Some("hci7".to_string());
      let communicator = Communicator::new(config);

      let plugin = create(&communicator.handle(), "bt", &[])?;
      assert_eq!(bt(&plugin).config.adapter.as_deref(), Some("hci7"));
      Ok(())
   }

   #[test]
   fn test_create_with_null_handle_fails() {
      let err = create(&CommunicatorHandle::null(), "bt", &[])
         .err()
         .expect("null handle must fail");
      assert!(matches!(
         err,
         TransportError::PluginInitialization { plugin, .. } if plugin == "bt"
      ));
   }

   #[test]
   fn test_create_after_communicator_shutdown_fails() {
      let communicator = Communicator::new(Config::default());
      let handle = communicator.handle();
      communicator.destroy();
      assert!(matches!(
         create(&handle, "bt", &[]),
         Err(TransportError::PluginInitialization { .. })
      ));

      drop(communicator);
      assert!(matches!(
         create(&handle, "bt", &[]),
         Err(TransportError::PluginInitialization { .. })
      ));
   }

   #[test]
   fn test_destroy_is_idempotent() -> Result<()> {
      let communicator = Communicator::new(Config::default());
      let plugin = create(&communicator.handle(), "bt", &[])?;

      plugin.destroy();
      assert_eq!(plugin.state(), PluginState::Destroyed);
      plugin.destroy();
      assert_eq!(plugin.state(), PluginState::Destroyed);
      Ok(())
   }

   #[tokio::test]
   async fn test_destroyed_plugin_cannot_initialize() -> Result<()> {
      let communicator = Communicator::new(Config::default());
      let plugin = create(&communicator.handle(), "bt", &[])?;
      plugin.destroy();

      assert!(matches!(
         plugin.initialize().await,
         Err(TransportError::PluginDestroyed(name)) if name == "bt"
      ));
      assert_eq!(plugin.state(), PluginState::Destroyed);
      Ok(())
   }

   #[tokio::test]
   async fn test_initialize_without_communicator_fails() -> Result<()> {
      let communicator = Communicator::new(Config::default());
      let plugin = create(&communicator.handle(), "bt", &[])?;
      drop(communicator);

      assert!(matches!(
         plugin.initialize().await,
         Err(TransportError::PluginInitialization { .. })
      ));
      assert_eq!(plugin.state(), PluginState::Uninitialized);
      Ok(())
   }

   #[tokio::test]
   async fn test_invalid_default_timeout_fails_initialization() -> Result<()> {
      let mut config = Config::default();
      config.bluetooth.default_timeout_ms = 0;
      let communicator = Communicator::new(config);
      let plugin = create(&communicator.handle(), "bt", &[])?;

      assert!(matches!(
         plugin.initialize().await,
         Err(TransportError::PluginInitialization { plugin, .. }) if plugin == "bt"
      ));
      assert_eq!(plugin.state(), PluginState::Uninitialized);
      assert!(communicator.endpoint_factory(PROTOCOL).is_none());
      Ok(())
   }

   #[test]
   fn test_operations_require_initialization() -> Result<()> {
      let communicator = Communicator::new(Config::default());
      let plugin = create(&communicator.handle(), "bt", &[])?;
      let bt = bt(&plugin);

      assert!(matches!(bt.devices(), Err(TransportError::PluginNotInitialized(_))));
      assert!(matches!(
         bt.stop_discovery(None),
         Err(TransportError::PluginNotInitialized(_))
      ));
      assert!(matches!(bt.adapter_address(), Err(TransportError::PluginNotInitialized(_))));

      plugin.destroy();
      assert!(matches!(bt.devices(), Err(TransportError::PluginDestroyed(_))));
      Ok(())
   }

   #[test]
   fn test_manager_destroys_uninitialized_plugin() -> Result<()> {
      let communicator = Communicator::new(Config::default());
      let plugin = create(&communicator.handle(), "bt", &[])?;
      communicator.plugins().add("bt", plugin.clone())?;

      communicator.destroy();
      assert_eq!(plugin.state(), PluginState::Destroyed);
      assert!(communicator.plugin("bt").is_none());
      Ok(())
   }
}
