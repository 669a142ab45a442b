//! Ownership and ordering of a communicator's plugins.

use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   communicator::CommunicatorHandle,
   config::PluginConfig,
   error::{Result, TransportError},
   plugin::{Plugin, PluginRegistry, PluginState},
};

struct LoadedPlugin {
   name: SmolStr,
   plugin: Arc<dyn Plugin>,
}

/// Holds plugins in load order.
///
/// Initialization runs in load order and destruction in reverse.
#[derive(Default)]
pub struct PluginManager {
   plugins: Mutex<Vec<LoadedPlugin>>,
}

impl PluginManager {
   pub fn new() -> Self {
      Self::default()
   }

   /// Creates plugins for `specs`. Entries named in `load_order` come first.
   pub fn load(
      &self,
      communicator: &CommunicatorHandle,
      registry: &PluginRegistry,
      specs: &[PluginConfig],
      load_order: &[String],
   ) -> Result<()> {
      for spec in load_sequence(specs, load_order)? {
         let plugin = registry.create(&spec.factory, communicator, &spec.name, &spec.args)?;
         self.add(&spec.name, plugin)?;
      }
      Ok(())
   }

   /// Adds an already constructed plugin at the end of the load order.
   pub fn add(&self, name: &str, plugin: Arc<dyn Plugin>) -> Result<()> {
      let mut plugins = self.plugins.lock();
      if plugins.iter().any(|p| p.name == name) {
         return Err(TransportError::DuplicatePlugin(name.into()));
      }
      debug!("Loaded plugin {name}");
      plugins.push(LoadedPlugin {
         name: name.into(),
         plugin,
      });
      Ok(())
   }

   pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
      self
         .plugins
         .lock()
         .iter()
         .find(|p| p.name == name)
         .map(|p| p.plugin.clone())
   }

   pub fn names(&self) -> Vec<SmolStr> {
      self.plugins.lock().iter().map(|p| p.name.clone()).collect()
   }

   pub fn len(&self) -> usize {
      self.plugins.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.plugins.lock().is_empty()
   }

   /// Initializes uninitialized plugins in load order.
   ///
   /// On failure, plugins initialized by this call are destroyed in reverse
   /// order before the error is returned.
   pub async fn initialize_all(&self) -> Result<()> {
      let snapshot: Vec<_> = self
         .plugins
         .lock()
         .iter()
         .map(|p| (p.name.clone(), p.plugin.clone()))
         .collect();

      let mut initialized: Vec<Arc<dyn Plugin>> = Vec::with_capacity(snapshot.len());
      for (name, plugin) in snapshot {
         if plugin.state() != PluginState::Uninitialized {
            continue;
         }
         match plugin.initialize().await {
            Ok(()) => {
               info!("Initialized plugin {name}");
               initialized.push(plugin);
            },
            Err(e) => {
               error!("Failed to initialize plugin {name}: {e}");
               for plugin in initialized.iter().rev() {
                  plugin.destroy();
               }
               return Err(e);
            },
         }
      }
      Ok(())
   }

   /// Destroys and releases every plugin in reverse load order.
   pub fn destroy_all(&self) {
      let plugins = std::mem::take(&mut *self.plugins.lock());
      for loaded in plugins.into_iter().rev() {
         debug!("Destroying plugin {}", loaded.name);
         loaded.plugin.destroy();
         if Arc::strong_count(&loaded.plugin) > 1 {
            warn!("Plugin {} is still referenced after destroy", loaded.name);
         }
      }
   }
}

/// Orders plugin entries: `load_order` names first, then the rest as declared.
fn load_sequence<'a>(specs: &'a [PluginConfig], load_order: &[String]) -> Result<Vec<&'a PluginConfig>> {
   for (i, spec) in specs.iter().enumerate() {
      if specs[..i].iter().any(|s| s.name == spec.name) {
         return Err(TransportError::DuplicatePlugin(spec.name.as_str().into()));
      }
   }

   let mut sequence = Vec::with_capacity(specs.len());
   for name in load_order {
      let spec = specs
         .iter()
         .find(|s| &s.name == name)
         .ok_or_else(|| TransportError::PluginNotConfigured(name.as_str().into()))?;
      if !sequence.iter().any(|s: &&PluginConfig| s.name == spec.name) {
         sequence.push(spec);
      }
   }
   for spec in specs {
      if !load_order.contains(&spec.name) {
         sequence.push(spec);
      }
   }
   Ok(sequence)
}
