//! Plugin contract and the table of plugin factories.
//!
//! Plugins are built by plain factory functions registered under a name at
//! process startup, then driven through `initialize` and `destroy` by the
//! communicator that owns them.

use std::{any::Any, collections::HashMap, sync::Arc};

use futures::future::BoxFuture;
use log::debug;
use smol_str::SmolStr;

use crate::{
   communicator::CommunicatorHandle,
   error::{Result, TransportError},
};

pub mod manager;

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PluginState {
   Uninitialized,
   Initialized,
   Destroyed,
}

/// An extension unit owned by a communicator.
pub trait Plugin: Send + Sync + Any {
   fn name(&self) -> &str;

   fn state(&self) -> PluginState;

   /// The communicator this plugin was created for.
   fn communicator(&self) -> &CommunicatorHandle;

   /// Acquires the plugin's resources. Runs at most once successfully.
   fn initialize(&self) -> BoxFuture<'_, Result<()>>;

   /// Releases the plugin's resources. Safe to call more than once.
   fn destroy(&self);

   fn as_any(&self) -> &dyn Any;
}

/// Builds a plugin bound to a communicator from its configured name and args.
pub type PluginFactoryFn = fn(&CommunicatorHandle, &str, &[String]) -> Result<Arc<dyn Plugin>>;

/// Maps factory names to factory functions.
#[derive(Clone, Default)]
pub struct PluginRegistry {
   factories: HashMap<SmolStr, PluginFactoryFn>,
}

impl PluginRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Registry holding every factory shipped with this crate.
   pub fn builtin() -> Self {
      let mut registry = Self::new();
      registry
         .factories
         .insert(SmolStr::new_static(crate::bluetooth::FACTORY_NAME), crate::bluetooth::create);
      registry
   }

   pub fn register(&mut self, name: &str, factory: PluginFactoryFn) -> Result<()> {
      if self.factories.contains_key(name) {
         return Err(TransportError::DuplicatePluginFactory(name.into()));
      }
      self.factories.insert(name.into(), factory);
      Ok(())
   }

   pub fn contains(&self, name: &str) -> bool {
      self.factories.contains_key(name)
   }

   /// Constructs a plugin with the factory registered as `factory`.
   pub fn create(
      &self,
      factory: &str,
      communicator: &CommunicatorHandle,
      name: &str,
      args: &[String],
   ) -> Result<Arc<dyn Plugin>> {
      let create = self
         .factories
         .get(factory)
         .ok_or_else(|| TransportError::UnknownPluginFactory(factory.into()))?;
      debug!("Creating plugin {name} with factory {factory} ({} args)", args.len());
      create(communicator, name, args)
   }
}
