//! Device discovery on local adapters.
//!
//! Discovery runs one task per adapter. Every device that shows up is
//! queried for its name, signal strength and advertised services, recorded,
//! and reported to the listener given when discovery started.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
};

use bluer::{Adapter, AdapterEvent, Address};
use futures::{StreamExt, pin_mut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
   error::Result,
   event::{DiscoveryEvent, DiscoverySender},
};

/// What is known about a discovered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
   pub address: Address,
   pub name: Option<SmolStr>,
   pub rssi: Option<i16>,
   pub uuids: HashSet<Uuid>,
   pub paired: bool,
   pub connected: bool,
}

impl DeviceInfo {
   pub fn new(address: Address) -> Self {
      Self {
         address,
         name: None,
         rssi: None,
         uuids: HashSet::new(),
         paired: false,
         connected: false,
      }
   }

   /// Reads device properties. Properties BlueZ cannot provide stay unset.
   pub async fn query(device: &bluer::Device) -> Self {
      let mut info = Self::new(device.address());
      info.name = match device.name().await {
         Ok(Some(name)) => Some(name.into()),
         _ => device.alias().await.ok().map(SmolStr::from),
      };
      info.rssi = device.rssi().await.ok().flatten();
      info.uuids = device.uuids().await.ok().flatten().unwrap_or_default();
      info.paired = device.is_paired().await.unwrap_or(false);
      info.connected = device.is_connected().await.unwrap_or(false);
      info
   }

   /// True when the device advertises the service `uuid`.
   pub fn offers(&self, uuid: &Uuid) -> bool {
      self.uuids.contains(uuid)
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut uuids: Vec<_> = self.uuids.iter().map(Uuid::to_string).collect();
      uuids.sort();
      json!({
         "address": self.address.to_string(),
         "name": self.name.as_deref(),
         "rssi": self.rssi,
         "uuids": uuids,
         "paired": self.paired,
         "connected": self.connected,
      })
   }
}

/// Devices per adapter. The same device can be seen by several adapters.
type DeviceMap = Arc<Mutex<HashMap<Address, HashMap<Address, DeviceInfo>>>>;

/// Discovery sessions keyed by adapter address.
#[derive(Default)]
pub struct Discovery {
   devices: DeviceMap,
   tasks: Mutex<HashMap<Address, JoinHandle<()>>>,
}

impl Discovery {
   pub fn new() -> Self {
      Self::default()
   }

   /// Starts discovery on `adapter`, replacing a running session on it.
   pub async fn start(&self, adapter: Adapter, listener: DiscoverySender) -> Result<()> {
      let address = adapter.address().await?;
      let events = adapter.discover_devices().await?;
      info!("Discovery started on {} ({address})", adapter.name());

      let devices = self.devices.clone();
      let task = tokio::spawn(async move {
         pin_mut!(events);
         while let Some(event) = events.next().await {
            let event = match event {
               AdapterEvent::DeviceAdded(addr) => match adapter.device(addr) {
                  Ok(device) => DiscoveryEvent::DeviceFound(DeviceInfo::query(&device).await),
                  Err(e) => {
                     warn!("Failed to query device {addr}: {e}");
                     continue;
                  },
               },
               AdapterEvent::DeviceRemoved(addr) => DiscoveryEvent::DeviceLost(addr),
               _ => continue,
            };
            record(&devices, address, &event);
            listener.on_event(address, event);
         }
         debug!("Discovery event stream on {address} ended");
      });

      if let Some(previous) = self.tasks.lock().insert(address, task) {
         previous.abort();
      }
      Ok(())
   }

   /// Stops discovery on the adapter with `address`. Returns whether it ran.
   pub fn stop(&self, address: Address) -> bool {
      match self.tasks.lock().remove(&address) {
         Some(task) => {
            task.abort();
            info!("Discovery stopped on {address}");
            true
         },
         None => false,
      }
   }

   pub fn stop_all(&self) {
      for (address, task) in self.tasks.lock().drain() {
         debug!("Stopping discovery on {address}");
         task.abort();
      }
   }

   pub fn is_running(&self, address: Address) -> bool {
      self
         .tasks
         .lock()
         .get(&address)
         .is_some_and(|t| !t.is_finished())
   }

   /// Devices seen so far and not reported lost by every adapter that saw
   /// them. A device seen by several adapters appears once.
   pub fn devices(&self) -> HashMap<Address, DeviceInfo> {
      let devices = self.devices.lock();
      let mut merged = HashMap::new();
      for info in devices.values().flat_map(|seen| seen.values()) {
         merged.entry(info.address).or_insert_with(|| info.clone());
      }
      merged
   }

   /// Devices the adapter with `adapter` has seen and not reported lost.
   pub fn devices_on(&self, adapter: Address) -> HashMap<Address, DeviceInfo> {
      self.devices.lock().get(&adapter).cloned().unwrap_or_default()
   }
}

impl Drop for Discovery {
   fn drop(&mut self) {
      self.stop_all();
   }
}

fn record(
   devices: &Mutex<HashMap<Address, HashMap<Address, DeviceInfo>>>,
   adapter: Address,
   event: &DiscoveryEvent,
) {
   let mut devices = devices.lock();
   match event {
      DiscoveryEvent::DeviceFound(info) => {
         debug!("[{adapter}] found device {} ({:?})", info.address, info.name);
         devices
            .entry(adapter)
            .or_default()
            .insert(info.address, info.clone());
      },
      DiscoveryEvent::DeviceLost(addr) => {
         debug!("[{adapter}] lost device {addr}");
         if let Some(seen) = devices.get_mut(&adapter) {
            seen.remove(addr);
            if seen.is_empty() {
               devices.remove(&adapter);
            }
         }
      },
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const ADDR: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
   const HCI0: Address = Address([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x10]);
   const HCI1: Address = Address([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x11]);
   const SPP: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

   fn sample() -> DeviceInfo {
      DeviceInfo {
         name: Some(SmolStr::new_static("Test Device")),
         rssi: Some(-60),
         uuids: HashSet::from([SPP]),
         paired: true,
         ..DeviceInfo::new(ADDR)
      }
   }

   #[test]
   fn test_record_found_then_lost() {
      let discovery = Discovery::new();
      record(&discovery.devices, HCI0, &DiscoveryEvent::DeviceFound(sample()));
      assert_eq!(discovery.devices().get(&ADDR), Some(&sample()));

      record(&discovery.devices, HCI0, &DiscoveryEvent::DeviceLost(ADDR));
      assert!(discovery.devices().is_empty());
      assert!(discovery.devices_on(HCI0).is_empty());
   }

   #[test]
   fn test_loss_on_one_adapter_keeps_device_on_another() {
      let discovery = Discovery::new();
      record(&discovery.devices, HCI0, &DiscoveryEvent::DeviceFound(sample()));
      record(&discovery.devices, HCI1, &DiscoveryEvent::DeviceFound(sample()));
      assert_eq!(discovery.devices().len(), 1);

      record(&discovery.devices, HCI0, &DiscoveryEvent::DeviceLost(ADDR));
      assert!(discovery.devices_on(HCI0).is_empty());
      assert!(discovery.devices_on(HCI1).contains_key(&ADDR));
      assert_eq!(discovery.devices().get(&ADDR), Some(&sample()));

      record(&discovery.devices, HCI1, &DiscoveryEvent::DeviceLost(ADDR));
      assert!(discovery.devices().is_empty());
   }

   #[test]
   fn test_offers_and_json() {
      let info = sample();
      assert!(info.offers(&SPP));
      assert!(!info.offers(&Uuid::nil()));

      let value = info.to_json();
      assert_eq!(value["address"], "AA:BB:CC:DD:EE:FF");
      assert_eq!(value["name"], "Test Device");
      assert_eq!(value["rssi"], -60);
      assert_eq!(value["uuids"][0], "00001101-0000-1000-8000-00805f9b34fb");
      assert_eq!(value["paired"], true);
      assert_eq!(value["connected"], false);

      assert!(DeviceInfo::new(ADDR).to_json()["name"].is_null());
   }

   #[test]
   fn test_stop_without_session() {
      let discovery = Discovery::new();
      assert!(!discovery.stop(ADDR));
      assert!(!discovery.is_running(ADDR));
      discovery.stop_all();
   }
}
