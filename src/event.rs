//! Event handling for Bluetooth device discovery.
//!
//! Discovery tasks report devices appearing and disappearing through a
//! `DiscoveryListener`, which the caller supplies when discovery starts.

use std::sync::Arc;

use bluer::Address;

use crate::bluetooth::discovery::DeviceInfo;

/// Events emitted while discovery runs on an adapter.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
   DeviceFound(DeviceInfo),
   DeviceLost(Address),
}

/// Trait for receiving discovery events.
pub trait DiscoveryListener: Send + Sync {
   /// Called from the discovery task for every event on `adapter`.
   fn on_event(&self, adapter: Address, event: DiscoveryEvent);
}

impl<F> DiscoveryListener for F
where
   F: Fn(Address, DiscoveryEvent) + Send + Sync,
{
   fn on_event(&self, adapter: Address, event: DiscoveryEvent) {
      self(adapter, event);
   }
}

/// Type alias for a thread-safe discovery listener.
pub type DiscoverySender = Arc<dyn DiscoveryListener>;
