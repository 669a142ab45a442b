//! Error types for the Bluetooth transport.
//!
//! This module defines all error types that can occur while loading plugins,
//! parsing endpoints, and moving frames over Bluetooth connections.

use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the transport and its plugins.
#[derive(Error, Debug)]
pub enum TransportError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   /// The single construction/initialization failure surfaced to the plugin
   /// loader. Aborts communicator startup.
   #[error("Plugin `{plugin}` failed to initialize: {reason}")]
   PluginInitialization { plugin: SmolStr, reason: String },

   #[error("No plugin factory registered as `{0}`")]
   UnknownPluginFactory(SmolStr),

   #[error("Plugin factory `{0}` is already registered")]
   DuplicatePluginFactory(SmolStr),

   #[error("Plugin `{0}` is already loaded")]
   DuplicatePlugin(SmolStr),

   #[error("Plugin `{0}` is listed in the load order but not configured")]
   PluginNotConfigured(SmolStr),

   #[error("Plugin `{0}` is not initialized")]
   PluginNotInitialized(SmolStr),

   #[error("Plugin `{0}` is already initialized")]
   PluginAlreadyInitialized(SmolStr),

   #[error("Plugin `{0}` has been destroyed")]
   PluginDestroyed(SmolStr),

   #[error("Communicator has been destroyed")]
   CommunicatorDestroyed,

   #[error("Invalid endpoint `{endpoint}`: {reason}")]
   InvalidEndpoint { endpoint: String, reason: String },

   #[error("Unknown transport protocol `{0}`")]
   UnknownProtocol(SmolStr),

   #[error("An endpoint factory for `{0}` is already registered")]
   DuplicateProtocol(SmolStr),

   #[error("Endpoint already in use: {0}")]
   EndpointInUse(String),

   #[error("Frame of {size} bytes exceeds the limit of {max} bytes")]
   FrameTooLarge { size: usize, max: usize },

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Adapter not found: {0}")]
   AdapterNotFound(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl TransportError {
   pub(crate) fn invalid_endpoint(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
      Self::InvalidEndpoint {
         endpoint: endpoint.into(),
         reason: reason.into(),
      }
   }

   pub(crate) fn plugin_init(plugin: impl Into<SmolStr>, reason: impl ToString) -> Self {
      Self::PluginInitialization {
         plugin: plugin.into(),
         reason: reason.to_string(),
      }
   }
}

/// Convenience type alias for Results with `TransportError`.
pub type Result<T> = std::result::Result<T, TransportError>;
