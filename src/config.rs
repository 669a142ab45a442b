//! Configuration management for the transport daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including the plugins to load and Bluetooth transport parameters.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Main configuration structure for a communicator.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   #[serde(default = "default_plugins")]
   pub plugins: Vec<PluginConfig>,

   /// Plugins named here are loaded first, in this order.
   #[serde(default)]
   pub plugin_load_order: Vec<String>,

   #[serde(default)]
   pub bluetooth: BluetoothConfig,

   /// Endpoints the daemon listens on.
   #[serde(default)]
   pub listen: Vec<String>,

   /// Whether the daemon runs device discovery on the default adapter.
   #[serde(default)]
   pub discover: bool,
}

/// A plugin entry: which registered factory builds it, and its arguments.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PluginConfig {
   pub name: String,
   pub factory: String,
   #[serde(default)]
   pub args: Vec<String>,
}

/// Bluetooth transport parameters.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BluetoothConfig {
   /// Adapter name such as `hci0`; the default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   /// Address used by server endpoints that do not specify `-a`.
   #[serde(default)]
   pub default_address: Option<String>,

   /// Endpoint timeout applied when `-t` is absent, `-1` for infinite.
   #[serde(default = "default_timeout_ms")]
   pub default_timeout_ms: i32,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_write_timeout")]
   pub write_timeout_sec: u64,

   #[serde(default = "default_max_frame_size")]
   pub max_frame_size: usize,

   #[serde(default = "default_queue_depth")]
   pub queue_depth: usize,
}

fn default_plugins() -> Vec<PluginConfig> {
   vec![PluginConfig {
      name: "bt".to_string(),
      factory: "bt".to_string(),
      args: vec![],
   }]
}

const fn default_timeout_ms() -> i32 {
   60_000
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_write_timeout() -> u64 {
   25
}

const fn default_max_frame_size() -> usize {
   1024 * 1024
}

const fn default_queue_depth() -> usize {
   128
}

impl Default for BluetoothConfig {
   fn default() -> Self {
      Self {
         adapter: None,
         default_address: None,
         default_timeout_ms: default_timeout_ms(),
         connect_timeout_sec: default_connect_timeout(),
         write_timeout_sec: default_write_timeout(),
         max_frame_size: default_max_frame_size(),
         queue_depth: default_queue_depth(),
      }
   }
}

impl BluetoothConfig {
   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   pub const fn write_timeout(&self) -> Duration {
      Duration::from_secs(self.write_timeout_sec)
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         plugins: default_plugins(),
         plugin_load_order: vec![],
         bluetooth: BluetoothConfig::default(),
         listen: vec![],
         discover: false,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Self::from_toml(&contents)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   pub fn from_toml(contents: &str) -> Result<Self> {
      Ok(toml::from_str(contents)?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTRPC_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(TransportError::ConfigDirNotFound);
      };

      Ok(config_dir.join("btrpc").join("config.toml"))
   }

   /// Looks up a plugin entry by name.
   pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
      self.plugins.iter().find(|p| p.name == name)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn test_defaults_fill_missing_fields() -> Result<()> {
      let config = Config::from_toml(
         r#"
         listen = ["bt -u 6a193943-1754-4869-8d0a-ddc5f9a7e7b1"]

         [bluetooth]
         adapter = "hci1"
         "#,
      )?;

      assert_eq!(config.plugins, default_plugins());
      assert_eq!(config.listen.len(), 1);
      assert!(!config.discover);
      assert_eq!(config.bluetooth.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.bluetooth.default_timeout_ms, 60_000);
      assert_eq!(config.bluetooth.max_frame_size, 1024 * 1024);
      assert_eq!(config.bluetooth.connect_timeout(), Duration::from_secs(10));
      Ok(())
   }

   #[test]
   fn test_plugin_entries() -> Result<()> {
      let config = Config::from_toml(
         r#"
         plugin_load_order = ["second"]

         [[plugins]]
         name = "first"
         factory = "bt"
         args = ["--verbose", "2"]

         [[plugins]]
         name = "second"
         factory = "bt"
         "#,
      )?;

      assert_eq!(config.plugins.len(), 2);
      assert_eq!(config.plugin_load_order, vec!["second".to_string()]);
      let first = config.plugin("first").expect("first plugin");
      assert_eq!(first.args, vec!["--verbose".to_string(), "2".to_string()]);
      assert!(config.plugin("second").expect("second plugin").args.is_empty());
      assert!(config.plugin("third").is_none());
      Ok(())
   }

   #[test]
   fn test_malformed_config_is_an_error() {
      let err = Config::from_toml("plugins = 3").unwrap_err();
      assert!(matches!(err, TransportError::TomlParse(_)));
   }

   #[test]
   fn test_load_creates_default_file() -> Result<()> {
      let temp_dir = TempDir::new().unwrap();
      unsafe {
         env::set_var("BTRPC_HOME", temp_dir.path());
      }

      let config = Config::load()?;
      let path = temp_dir.path().join("btrpc").join("config.toml");
      assert!(path.exists());
      assert_eq!(config.bluetooth, BluetoothConfig::default());

      let mut changed = config.clone();
      changed.discover = true;
      changed.bluetooth.default_timeout_ms = -1;
      changed.save()?;

      let reloaded = Config::load()?;
      assert!(reloaded.discover);
      assert_eq!(reloaded.bluetooth.default_timeout_ms, -1);
      Ok(())
   }
}
