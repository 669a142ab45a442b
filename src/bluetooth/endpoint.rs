//! `bt` endpoint descriptors.
//!
//! Descriptor syntax:
//!
//! ```text
//! bt [-a ADDRESS] [-u UUID] [-c CHANNEL] [-t MILLIS|infinite] [-z] [--name NAME]
//! ```

use std::{fmt, str::FromStr, time::Duration};

use bluer::Address;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   error::{Result, TransportError},
   transport::{quote, tokenize},
};

/// Protocol keyword of Bluetooth endpoints.
pub const PROTOCOL: &str = "bt";
/// Endpoint type id on the wire.
pub const TYPE_ID: i16 = 6;
/// Timeout value meaning "never time out".
pub const INFINITE_TIMEOUT: i32 = -1;
/// Highest RFCOMM server channel.
const MAX_CHANNEL: u8 = 30;

/// A timeout is either positive or [`INFINITE_TIMEOUT`].
pub const fn is_valid_timeout(timeout_ms: i32) -> bool {
   timeout_ms > 0 || timeout_ms == INFINITE_TIMEOUT
}

/// Identifies a Bluetooth service: a device address plus how to reach the
/// service on it.
///
/// Equality and hashing cover every field, so equal descriptors deduplicate
/// in sets and maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointDescriptor {
   address: Address,
   uuid: Option<Uuid>,
   channel: u8,
   timeout_ms: i32,
   compress: bool,
   name: Option<SmolStr>,
}

impl EndpointDescriptor {
   pub fn new(address: Address) -> Self {
      Self {
         address,
         uuid: None,
         channel: 0,
         timeout_ms: INFINITE_TIMEOUT,
         compress: false,
         name: None,
      }
   }

   /// Parses the option tokens following `bt`. `default_timeout_ms` applies
   /// when `-t` is absent.
   pub fn parse(args: &[String], default_timeout_ms: i32) -> Result<Self> {
      let invalid = |reason: String| {
         TransportError::invalid_endpoint(format!("{PROTOCOL} {}", args.join(" ")), reason)
      };
      if !is_valid_timeout(default_timeout_ms) {
         return Err(invalid(format!("invalid default timeout {default_timeout_ms}")));
      }

      let mut desc = Self::new(Address::any());
      desc.timeout_ms = default_timeout_ms;

      let mut it = args.iter();
      while let Some(option) = it.next() {
         let mut value = || {
            it.next()
               .ok_or_else(|| invalid(format!("no argument provided for {option} option")))
         };
         match option.as_str() {
            "-a" => {
               let v = value()?;
               desc.address = Address::from_str(v)
                  .map_err(|_| invalid(format!("invalid address `{v}` in -a option")))?;
            },
            "-u" => {
               let v = value()?;
               desc.uuid = Some(
                  Uuid::parse_str(v)
                     .map_err(|e| invalid(format!("invalid UUID `{v}` in -u option: {e}")))?,
               );
            },
            "-c" => {
               let v = value()?;
               desc.channel = v
                  .parse::<u8>()
                  .ok()
                  .filter(|c| *c <= MAX_CHANNEL)
                  .ok_or_else(|| invalid(format!("invalid channel `{v}` in -c option")))?;
            },
            "-t" => {
               let v = value()?;
               desc.timeout_ms = if v == "infinite" {
                  INFINITE_TIMEOUT
               } else {
                  v.parse::<i32>()
                     .ok()
                     .filter(|t| *t > 0)
                     .ok_or_else(|| invalid(format!("invalid timeout value `{v}` in -t option")))?
               };
            },
            "-z" => desc.compress = true,
            "--name" => {
               desc.name = Some(value()?.as_str().into());
            },
            other => return Err(invalid(format!("unknown option `{other}`"))),
         }
      }

      Ok(desc)
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   /// True when no concrete device address was given.
   pub fn has_address(&self) -> bool {
      self.address != Address::any()
   }

   pub const fn uuid(&self) -> Option<Uuid> {
      self.uuid
   }

   /// RFCOMM channel, `None` when unspecified.
   pub const fn channel(&self) -> Option<u8> {
      if self.channel == 0 { None } else { Some(self.channel) }
   }

   pub const fn timeout_ms(&self) -> i32 {
      self.timeout_ms
   }

   /// `None` means no timeout.
   pub fn timeout(&self) -> Option<Duration> {
      u64::try_from(self.timeout_ms)
         .ok()
         .map(Duration::from_millis)
   }

   pub const fn compress(&self) -> bool {
      self.compress
   }

   pub fn name(&self) -> Option<&str> {
      self.name.as_deref()
   }

   pub fn with_address(&self, address: Address) -> Self {
      Self {
         address,
         ..self.clone()
      }
   }

   pub fn with_uuid(&self, uuid: Uuid) -> Self {
      Self {
         uuid: Some(uuid),
         ..self.clone()
      }
   }

   /// Values that are neither positive nor [`INFINITE_TIMEOUT`] mean infinite.
   pub fn with_timeout_ms(&self, timeout_ms: i32) -> Self {
      Self {
         timeout_ms: if is_valid_timeout(timeout_ms) { timeout_ms } else { INFINITE_TIMEOUT },
         ..self.clone()
      }
   }

   pub fn with_compress(&self, compress: bool) -> Self {
      Self {
         compress,
         ..self.clone()
      }
   }
}

impl fmt::Display for EndpointDescriptor {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(PROTOCOL)?;
      if self.has_address() {
         write!(f, " -a \"{}\"", self.address)?;
      }
      if let Some(uuid) = self.uuid {
         write!(f, " -u {uuid}")?;
      }
      if let Some(channel) = self.channel() {
         write!(f, " -c {channel}")?;
      }
      if self.timeout_ms == INFINITE_TIMEOUT {
         f.write_str(" -t infinite")?;
      } else {
         write!(f, " -t {}", self.timeout_ms)?;
      }
      if self.compress {
         f.write_str(" -z")?;
      }
      if let Some(name) = &self.name {
         write!(f, " --name {}", quote(name))?;
      }
      Ok(())
   }
}

impl FromStr for EndpointDescriptor {
   type Err = TransportError;

   /// Parses a full endpoint string including the `bt` keyword.
   fn from_str(s: &str) -> Result<Self> {
      let mut tokens = tokenize(s)?;
      if tokens.first().map(String::as_str) != Some(PROTOCOL) {
         return Err(TransportError::invalid_endpoint(s, "not a bt endpoint"));
      }
      tokens.remove(0);
      Self::parse(&tokens, crate::config::BluetoothConfig::default().default_timeout_ms)
   }
}

#[cfg(test)]
mod tests {
   use std::collections::HashSet;

   use super::*;

   const ADDR: Address = Address([0x01, 0x23, 0x45, 0x67, 0x89, 0xAB]);
   const UUID: &str = "6a193943-1754-4869-8d0a-ddc5f9a7e7b1";

   fn parse(s: &str) -> Result<EndpointDescriptor> {
      s.parse()
   }

   #[test]
   fn test_parse_all_options() -> Result<()> {
      let desc = parse(&format!(
         "bt -a \"01:23:45:67:89:ab\" -u {UUID} -c 4 -t 5000 -z --name \"Test Service\""
      ))?;

      assert_eq!(desc.address(), ADDR);
      assert!(desc.has_address());
      assert_eq!(desc.uuid(), Some(Uuid::parse_str(UUID).unwrap()));
      assert_eq!(desc.channel(), Some(4));
      assert_eq!(desc.timeout(), Some(Duration::from_millis(5000)));
      assert!(desc.compress());
      assert_eq!(desc.name(), Some("Test Service"));
      Ok(())
   }

   #[test]
   fn test_defaults() -> Result<()> {
      let desc = EndpointDescriptor::parse(&[], 1234)?;
      assert!(!desc.has_address());
      assert_eq!(desc.uuid(), None);
      assert_eq!(desc.channel(), None);
      assert_eq!(desc.timeout_ms(), 1234);
      assert!(!desc.compress());
      assert_eq!(desc.name(), None);

      let infinite = parse("bt -t infinite")?;
      assert_eq!(infinite.timeout_ms(), INFINITE_TIMEOUT);
      assert_eq!(infinite.timeout(), None);
      Ok(())
   }

   #[test]
   fn test_display_parses_back() -> Result<()> {
      let desc = parse(&format!(
         "bt -a 01:23:45:67:89:AB -u {UUID} -c 12 -t infinite -z --name \"my svc\""
      ))?;
      let text = desc.to_string();
      assert_eq!(
         text,
         format!("bt -a \"01:23:45:67:89:AB\" -u {UUID} -c 12 -t infinite -z --name \"my svc\"")
      );
      assert_eq!(parse(&text)?, desc);

      assert_eq!(parse("bt")?.to_string(), "bt -t 60000");
      Ok(())
   }

   #[test]
   fn test_equal_descriptors_dedupe() -> Result<()> {
      let mut set = HashSet::new();
      set.insert(parse("bt -a 01:23:45:67:89:ab -c 3")?);
      set.insert(parse("bt -c 3 -a \"01:23:45:67:89:AB\"")?);
      assert_eq!(set.len(), 1);

      set.insert(parse("bt -a 01:23:45:67:89:ab -c 3 -z")?);
      set.insert(parse("bt -a 01:23:45:67:89:ab -c 3 -t 10")?);
      assert_eq!(set.len(), 3);
      Ok(())
   }

   #[test]
   fn test_with_helpers_leave_original_untouched() -> Result<()> {
      let desc = parse("bt -c 3")?;
      let uuid = Uuid::parse_str(UUID).unwrap();
      let resolved = desc.with_address(ADDR).with_uuid(uuid).with_timeout_ms(10);

      assert!(!desc.has_address());
      assert_eq!(desc.uuid(), None);
      assert_eq!(resolved.address(), ADDR);
      assert_eq!(resolved.uuid(), Some(uuid));
      assert_eq!(resolved.timeout_ms(), 10);
      assert_eq!(desc.with_timeout_ms(0).timeout_ms(), INFINITE_TIMEOUT);
      assert_eq!(resolved.channel(), Some(3));
      assert_ne!(resolved, desc);
      Ok(())
   }

   #[test]
   fn test_invalid_default_timeout_rejected() -> Result<()> {
      let args = vec!["-c".to_string(), "3".to_string()];
      for bad in [0, -5, i32::MIN] {
         assert!(matches!(
            EndpointDescriptor::parse(&args, bad),
            Err(TransportError::InvalidEndpoint { .. })
         ));
      }

      for good in [1, INFINITE_TIMEOUT] {
         let desc = EndpointDescriptor::parse(&args, good)?;
         assert_eq!(parse(&desc.to_string())?, desc);
      }
      Ok(())
   }

   #[test]
   fn test_invalid_endpoints() {
      for bad in [
         "bt -a",
         "bt -a 01:23:45",
         "bt -u not-a-uuid",
         "bt -c 31",
         "bt -c x",
         "bt -t 0",
         "bt -t -5",
         "bt --name",
         "bt -h localhost",
         "tcp -a 01:23:45:67:89:AB",
      ] {
         assert!(
            matches!(parse(bad), Err(TransportError::InvalidEndpoint { .. })),
            "{bad} should be rejected"
         );
      }
   }
}
