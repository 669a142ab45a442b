//! Per-plugin Bluetooth resources.
//!
//! An `Instance` exists while its plugin is initialized. It owns the BlueZ
//! session and adapter, tracks which endpoints are being listened on, and
//! runs discovery.

use std::{collections::HashSet, future::Future, str::FromStr, sync::Arc};

use bluer::{Adapter, Address, Session};
use log::{debug, info};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{select, sync::watch};

use crate::{
   bluetooth::{
      discovery::Discovery,
      endpoint::{EndpointDescriptor, is_valid_timeout},
   },
   config::BluetoothConfig,
   connection::FrameLimits,
   error::{Result, TransportError},
};

pub struct Instance {
   plugin: SmolStr,
   config: BluetoothConfig,
   session: Session,
   adapter: Adapter,
   adapter_address: Address,
   default_address: Option<Address>,
   endpoints: EndpointRegistry,
   discovery: Discovery,
   shutdown: Shutdown,
}

impl Instance {
   /// Opens a BlueZ session and selects the configured adapter, powering it
   /// on if needed.
   pub async fn open(plugin: &str, config: BluetoothConfig) -> Result<Self> {
      if !is_valid_timeout(config.default_timeout_ms) {
         return Err(TransportError::plugin_init(
            plugin,
            format!("invalid default_timeout_ms {}", config.default_timeout_ms),
         ));
      }
      let default_address = config
         .default_address
         .as_deref()
         .map(|a| {
            Address::from_str(a).map_err(|_| {
               TransportError::plugin_init(plugin, format!("invalid default address `{a}`"))
            })
         })
         .transpose()?;

      let session = Session::new().await?;
      let adapter = match &config.adapter {
         Some(name) => session
            .adapter(name)
            .map_err(|_| TransportError::AdapterNotFound(name.clone()))?,
         None => session.default_adapter().await?,
      };

      if !adapter.is_powered().await? {
         info!("Powering on adapter {}", adapter.name());
         adapter.set_powered(true).await?;
      }
      let adapter_address = adapter.address().await?;
      info!(
         "Plugin {plugin} using adapter {} ({adapter_address})",
         adapter.name()
      );

      Ok(Self {
         plugin: plugin.into(),
         config,
         session,
         adapter,
         adapter_address,
         default_address,
         endpoints: EndpointRegistry::default(),
         discovery: Discovery::new(),
         shutdown: Shutdown::new(),
      })
   }

   pub fn ensure_active(&self) -> Result<()> {
      if self.shutdown.is_triggered() {
         Err(TransportError::PluginDestroyed(self.plugin.clone()))
      } else {
         Ok(())
      }
   }

   /// Runs `fut` until it completes or the instance is destroyed.
   pub async fn until_destroyed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
      self.shutdown.race(&self.plugin, fut).await
   }

   pub const fn config(&self) -> &BluetoothConfig {
      &self.config
   }

   pub const fn session(&self) -> &Session {
      &self.session
   }

   pub const fn adapter(&self) -> &Adapter {
      &self.adapter
   }

   pub const fn adapter_address(&self) -> Address {
      self.adapter_address
   }

   /// Address server endpoints bind to when they name none.
   pub fn server_address(&self) -> Address {
      self.default_address.unwrap_or(self.adapter_address)
   }

   /// Finds a local adapter by its address.
   pub async fn adapter_by_address(&self, address: Address) -> Result<Adapter> {
      if address == self.adapter_address {
         return Ok(self.adapter.clone());
      }
      for name in self.session.adapter_names().await? {
         let adapter = self.session.adapter(&name)?;
         if adapter.address().await? == address {
            return Ok(adapter);
         }
      }
      Err(TransportError::AdapterNotFound(address.to_string()))
   }

   pub const fn endpoints(&self) -> &EndpointRegistry {
      &self.endpoints
   }

   pub const fn discovery(&self) -> &Discovery {
      &self.discovery
   }

   pub fn limits(&self) -> FrameLimits {
      FrameLimits::from(&self.config)
   }

   /// Stops background work and wakes pending accepts and connects, which
   /// then fail. Later transport operations fail too. Idempotent.
   pub fn destroy(&self) {
      if !self.shutdown.trigger() {
         return;
      }
      debug!("Releasing Bluetooth resources of plugin {}", self.plugin);
      self.discovery.stop_all();
   }
}

/// One-shot shutdown flag that can be awaited.
#[derive(Debug)]
pub struct Shutdown(watch::Sender<bool>);

impl Shutdown {
   pub fn new() -> Self {
      Self(watch::Sender::new(false))
   }

   /// Sets the flag. Returns false if it was already set.
   pub fn trigger(&self) -> bool {
      !self.0.send_replace(true)
   }

   pub fn is_triggered(&self) -> bool {
      *self.0.borrow()
   }

   /// Resolves once the flag is set.
   pub async fn triggered(&self) {
      let mut rx = self.0.subscribe();
      // The sender lives in `self`, so this only returns once the flag is set.
      let _ = rx.wait_for(|set| *set).await;
   }

   /// Runs `fut` unless the flag gets set first, in which case the result
   /// is `PluginDestroyed` for `plugin`.
   pub async fn race<T>(&self, plugin: &SmolStr, fut: impl Future<Output = Result<T>>) -> Result<T> {
      select! {
         biased;
         () = self.triggered() => Err(TransportError::PluginDestroyed(plugin.clone())),
         res = fut => res,
      }
   }
}

impl Default for Shutdown {
   fn default() -> Self {
      Self::new()
   }
}

/// Set of endpoints currently listened on.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry(Arc<Mutex<HashSet<EndpointDescriptor>>>);

impl EndpointRegistry {
   /// Claims `desc`. The claim is released when the returned guard drops.
   pub fn claim(&self, desc: &EndpointDescriptor) -> Result<EndpointClaim> {
      if !self.0.lock().insert(desc.clone()) {
         return Err(TransportError::EndpointInUse(desc.to_string()));
      }
      Ok(EndpointClaim {
         registry: self.clone(),
         desc: desc.clone(),
      })
   }

   pub fn contains(&self, desc: &EndpointDescriptor) -> bool {
      self.0.lock().contains(desc)
   }

   pub fn len(&self) -> usize {
      self.0.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.0.lock().is_empty()
   }
}

/// Holds an endpoint in its registry until dropped.
#[derive(Debug)]
pub struct EndpointClaim {
   registry: EndpointRegistry,
   desc: EndpointDescriptor,
}

impl EndpointClaim {
   pub const fn descriptor(&self) -> &EndpointDescriptor {
      &self.desc
   }
}

impl Drop for EndpointClaim {
   fn drop(&mut self) {
      self.registry.0.lock().remove(&self.desc);
   }
}
