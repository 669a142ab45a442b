//! Bluetooth RFCOMM transport for RPC communicators.
//!
//! The transport ships as a plugin. A communicator builds it through the
//! factory registered in [`plugin::PluginRegistry::builtin`], initializes it,
//! and from then on resolves `bt` endpoint strings through the endpoint
//! factory the plugin registers.

pub mod bluetooth;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod plugin;
pub mod transport;

pub use communicator::{Communicator, CommunicatorHandle};
pub use error::{Result, TransportError};
