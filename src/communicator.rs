//! The communicator: the runtime context that owns configuration, plugins,
//! and the endpoint factories plugins register.

use std::{
   collections::HashMap,
   fmt,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
};

use log::{debug, info};
use parking_lot::RwLock;
use smol_str::SmolStr;

use crate::{
   config::Config,
   connection::Connection,
   error::{Result, TransportError},
   plugin::{Plugin, PluginRegistry, manager::PluginManager},
   transport::{self, Acceptor, Endpoint, EndpointFactory},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct CommunicatorInner {
   id: u64,
   config: Config,
   plugins: PluginManager,
   endpoint_factories: RwLock<HashMap<SmolStr, Arc<dyn EndpointFactory>>>,
   destroyed: AtomicBool,
}

/// The runtime's central context.
///
/// This type is cheaply cloneable; all clones refer to the same context.
#[derive(Clone)]
pub struct Communicator(Arc<CommunicatorInner>);

/// Non-owning reference to a communicator, handed to plugins.
///
/// A handle never keeps its communicator alive. `null()` refers to nothing.
#[derive(Clone, Default)]
pub struct CommunicatorHandle(Weak<CommunicatorInner>);

impl CommunicatorHandle {
   pub const fn null() -> Self {
      Self(Weak::new())
   }

   /// Returns the communicator if it still exists.
   pub fn upgrade(&self) -> Option<Communicator> {
      self.0.upgrade().map(Communicator)
   }

   /// True when the handle refers to no live communicator.
   pub fn is_null(&self) -> bool {
      self.0.strong_count() == 0
   }

   pub fn same_as(&self, communicator: &Communicator) -> bool {
      Weak::ptr_eq(&self.0, &Arc::downgrade(&communicator.0))
   }

   /// Upgrades to a communicator that has not been destroyed.
   pub fn live(&self) -> Result<Communicator> {
      self
         .upgrade()
         .filter(|c| !c.is_destroyed())
         .ok_or(TransportError::CommunicatorDestroyed)
   }
}

impl fmt::Debug for CommunicatorHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.upgrade() {
         Some(c) => write!(f, "CommunicatorHandle({})", c.id()),
         None => f.write_str("CommunicatorHandle(null)"),
      }
   }
}

impl Communicator {
   /// Creates a communicator with no plugins loaded.
   pub fn new(config: Config) -> Self {
      let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
      debug!("Creating communicator {id}");
      Self(Arc::new(CommunicatorInner {
         id,
         config,
         plugins: PluginManager::new(),
         endpoint_factories: RwLock::new(HashMap::new()),
         destroyed: AtomicBool::new(false),
      }))
   }

   /// Creates a communicator, then loads and initializes the plugins its
   /// configuration names. Any failure destroys the communicator.
   pub async fn initialize(config: Config, registry: &PluginRegistry) -> Result<Self> {
      let communicator = Self::new(config);
      if let Err(e) = communicator.load_plugins(registry).await {
         communicator.destroy();
         return Err(e);
      }
      Ok(communicator)
   }

   async fn load_plugins(&self, registry: &PluginRegistry) -> Result<()> {
      let config = &self.0.config;
      self
         .0
         .plugins
         .load(&self.handle(), registry, &config.plugins, &config.plugin_load_order)?;
      self.0.plugins.initialize_all().await?;
      info!(
         "Communicator {} started with plugins {:?}",
         self.id(),
         self.0.plugins.names()
      );
      Ok(())
   }

   pub fn id(&self) -> u64 {
      self.0.id
   }

   pub fn handle(&self) -> CommunicatorHandle {
      CommunicatorHandle(Arc::downgrade(&self.0))
   }

   pub fn config(&self) -> &Config {
      &self.0.config
   }

   pub fn plugins(&self) -> &PluginManager {
      &self.0.plugins
   }

   pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
      self.0.plugins.get(name)
   }

   pub fn is_destroyed(&self) -> bool {
      self.0.destroyed.load(Ordering::Acquire)
   }

   fn ensure_live(&self) -> Result<()> {
      if self.is_destroyed() {
         Err(TransportError::CommunicatorDestroyed)
      } else {
         Ok(())
      }
   }

   pub fn add_endpoint_factory(&self, factory: Arc<dyn EndpointFactory>) -> Result<()> {
      self.ensure_live()?;
      let protocol = SmolStr::new_static(factory.protocol());
      let mut factories = self.0.endpoint_factories.write();
      if factories.contains_key(&protocol) {
         return Err(TransportError::DuplicateProtocol(protocol));
      }
      debug!(
         "Communicator {}: registered endpoint factory {protocol} (type {})",
         self.id(),
         factory.type_id()
      );
      factories.insert(protocol, factory);
      Ok(())
   }

   /// Removes and destroys the factory for `protocol`, if any.
   pub fn remove_endpoint_factory(&self, protocol: &str) -> Option<Arc<dyn EndpointFactory>> {
      let factory = self.0.endpoint_factories.write().remove(protocol)?;
      debug!("Communicator {}: removed endpoint factory {protocol}", self.id());
      factory.destroy();
      Some(factory)
   }

   pub fn endpoint_factory(&self, protocol: &str) -> Option<Arc<dyn EndpointFactory>> {
      self.0.endpoint_factories.read().get(protocol).cloned()
   }

   /// Parses an endpoint string such as `bt -a 01:23:45:67:89:AB -c 4`.
   pub fn create_endpoint(&self, endpoint: &str) -> Result<Arc<dyn Endpoint>> {
      self.ensure_live()?;
      let mut tokens = transport::tokenize(endpoint)?;
      if tokens.is_empty() {
         return Err(TransportError::invalid_endpoint(endpoint, "empty endpoint"));
      }
      let protocol = tokens.remove(0);
      let factory = self
         .endpoint_factory(&protocol)
         .ok_or_else(|| TransportError::UnknownProtocol(protocol.as_str().into()))?;
      factory.create(&tokens)
   }

   /// Connects to `endpoint`.
   pub async fn connect(&self, endpoint: &str) -> Result<Connection> {
      let endpoint = self.create_endpoint(endpoint)?;
      let connector = endpoint.connector()?;
      debug!("Connecting via {connector}");
      connector.connect().await
   }

   /// Returns an acceptor listening on `endpoint`.
   pub async fn listen(&self, endpoint: &str) -> Result<Box<dyn Acceptor>> {
      let endpoint = self.create_endpoint(endpoint)?;
      let mut acceptor = endpoint.acceptor()?;
      acceptor.listen().await?;
      info!("Listening on {}", acceptor.endpoint());
      Ok(acceptor)
   }

   /// Destroys plugins in reverse load order and drops all endpoint
   /// factories. Calling it again has no effect.
   pub fn destroy(&self) {
      if self.0.destroyed.swap(true, Ordering::AcqRel) {
         return;
      }
      info!("Destroying communicator {}", self.id());
      self.0.plugins.destroy_all();
      let factories = std::mem::take(&mut *self.0.endpoint_factories.write());
      for factory in factories.values() {
         factory.destroy();
      }
   }
}

impl fmt::Debug for Communicator {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Communicator")
         .field("id", &self.id())
         .field("destroyed", &self.is_destroyed())
         .finish()
   }
}
