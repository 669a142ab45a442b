//! RFCOMM connectors and acceptors for `bt` endpoints.

use std::{fmt, sync::Arc, time::Duration};

use bluer::{
   Address,
   rfcomm::{ConnectRequest, Profile, ProfileHandle, Role, SocketAddr, Stream},
};
use futures::{StreamExt, future::BoxFuture};
use log::{debug, info, warn};
use tokio::{select, time};
use uuid::Uuid;

use crate::{
   bluetooth::{
      endpoint::{EndpointDescriptor, PROTOCOL, TYPE_ID},
      instance::{EndpointClaim, Instance},
   },
   connection::Connection,
   error::{Result, TransportError},
   transport::{Acceptor, Connector, Endpoint, EndpointFactory},
};

/// Builds `bt` endpoints backed by a plugin's instance.
pub struct BtEndpointFactory {
   instance: Arc<Instance>,
}

impl BtEndpointFactory {
   pub const fn new(instance: Arc<Instance>) -> Self {
      Self { instance }
   }
}

impl EndpointFactory for BtEndpointFactory {
   fn protocol(&self) -> &'static str {
      PROTOCOL
   }

   fn type_id(&self) -> i16 {
      TYPE_ID
   }

   fn create(&self, args: &[String]) -> Result<Arc<dyn Endpoint>> {
      self.instance.ensure_active()?;
      let desc = EndpointDescriptor::parse(args, self.instance.config().default_timeout_ms)?;
      Ok(Arc::new(BtEndpoint {
         desc,
         instance: self.instance.clone(),
      }))
   }

   fn destroy(&self) {
      self.instance.destroy();
   }
}

pub struct BtEndpoint {
   desc: EndpointDescriptor,
   instance: Arc<Instance>,
}

impl BtEndpoint {
   pub const fn descriptor(&self) -> &EndpointDescriptor {
      &self.desc
   }
}

impl fmt::Debug for BtEndpoint {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_tuple("BtEndpoint").field(&self.desc).finish()
   }
}

impl fmt::Display for BtEndpoint {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Display::fmt(&self.desc, f)
   }
}

impl Endpoint for BtEndpoint {
   fn protocol(&self) -> &'static str {
      PROTOCOL
   }

   fn timeout(&self) -> Option<Duration> {
      self.desc.timeout()
   }

   fn connector(&self) -> Result<Box<dyn Connector>> {
      self.instance.ensure_active()?;
      check_connectable(&self.desc)?;
      Ok(Box::new(BtConnector {
         desc: self.desc.clone(),
         instance: self.instance.clone(),
      }))
   }

   fn acceptor(&self) -> Result<Box<dyn Acceptor>> {
      self.instance.ensure_active()?;
      let desc = resolve_server(&self.desc, self.instance.server_address(), random_uuid);
      Ok(Box::new(BtAcceptor {
         desc,
         instance: self.instance.clone(),
         listening: None,
      }))
   }
}

/// A client endpoint needs a device and either a channel or a service UUID.
fn check_connectable(desc: &EndpointDescriptor) -> Result<()> {
   if !desc.has_address() {
      return Err(TransportError::invalid_endpoint(
         desc.to_string(),
         "a device address must be specified with -a",
      ));
   }
   if desc.channel().is_none() && desc.uuid().is_none() {
      return Err(TransportError::invalid_endpoint(
         desc.to_string(),
         "a service UUID (-u) or channel (-c) must be specified",
      ));
   }
   Ok(())
}

/// Fills in the local address and a service UUID for a server endpoint.
fn resolve_server(
   desc: &EndpointDescriptor,
   local: Address,
   uuid: impl FnOnce() -> Uuid,
) -> EndpointDescriptor {
   let mut resolved = desc.clone();
   if !resolved.has_address() {
      resolved = resolved.with_address(local);
   }
   if resolved.uuid().is_none() {
      resolved = resolved.with_uuid(uuid());
   }
   resolved
}

fn random_uuid() -> Uuid {
   uuid::Builder::from_random_bytes(rand::random()).into_uuid()
}

/// Bound on connection establishment: the endpoint timeout when finite,
/// the configured connect timeout otherwise.
fn connect_timeout(desc: &EndpointDescriptor, fallback: Duration) -> Duration {
   desc.timeout().unwrap_or(fallback)
}

pub struct BtConnector {
   desc: EndpointDescriptor,
   instance: Arc<Instance>,
}

impl fmt::Display for BtConnector {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Display::fmt(&self.desc, f)
   }
}

impl Connector for BtConnector {
   fn connect(&self) -> BoxFuture<'_, Result<Connection>> {
      Box::pin(async move {
         self.instance.ensure_active()?;
         let address = self.desc.address();
         let limit = connect_timeout(&self.desc, self.instance.config().connect_timeout());

         let open = self.instance.until_destroyed(self.open_stream(address));
         let stream = time::timeout(limit, open)
            .await
            .map_err(|_| TransportError::RequestTimeout)??;
         info!("Connected to {}", self.desc);
         Ok(Connection::spawn(address.to_string(), stream, self.instance.limits()))
      })
   }
}

impl BtConnector {
   async fn open_stream(&self, address: Address) -> Result<Stream> {
      match (self.desc.channel(), self.desc.uuid()) {
         (Some(channel), _) => {
            debug!("Connecting RFCOMM socket to {address} channel {channel}");
            Ok(Stream::connect(SocketAddr::new(address, channel)).await?)
         },
         (None, Some(uuid)) => self.connect_profile(address, uuid).await,
         (None, None) => Err(TransportError::invalid_endpoint(
            self.desc.to_string(),
            "a service UUID (-u) or channel (-c) must be specified",
         )),
      }
   }

   /// Lets BlueZ resolve the service channel: registers a client profile
   /// for `uuid`, asks the device to connect it, and takes the RFCOMM stream
   /// BlueZ hands to the profile.
   async fn connect_profile(&self, address: Address, uuid: Uuid) -> Result<Stream> {
      let profile = Profile {
         uuid,
         role: Some(Role::Client),
         require_authentication: Some(false),
         require_authorization: Some(false),
         auto_connect: Some(false),
         ..Default::default()
      };
      let mut handle = self.instance.session().register_profile(profile).await?;
      let device = self.instance.adapter().device(address)?;
      debug!("Connecting profile {uuid} on {address}");

      let connect = device.connect_profile(&uuid);
      tokio::pin!(connect);
      let mut requested = false;
      loop {
         select! {
            res = &mut connect, if !requested => {
               res?;
               requested = true;
            }
            req = handle.next() => {
               let req = req.ok_or(TransportError::ConnectionClosed)?;
               if req.device() != address {
                  warn!("Ignoring connection from unexpected device {}", req.device());
                  continue;
               }
               return Ok(req.accept()?);
            }
         }
      }
   }
}

struct Listening {
   handle: ProfileHandle,
   _claim: EndpointClaim,
}

pub struct BtAcceptor {
   desc: EndpointDescriptor,
   instance: Arc<Instance>,
   listening: Option<Listening>,
}

impl fmt::Display for BtAcceptor {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Display::fmt(&self.desc, f)
   }
}

impl Acceptor for BtAcceptor {
   fn listen(&mut self) -> BoxFuture<'_, Result<()>> {
      Box::pin(async move {
         self.instance.ensure_active()?;
         if self.listening.is_some() {
            return Err(TransportError::EndpointInUse(self.desc.to_string()));
         }

         let claim = self.instance.endpoints().claim(&self.desc)?;
         let profile = Profile {
            // resolve_server always sets a UUID
            uuid: self.desc.uuid().unwrap_or_default(),
            name: self.desc.name().map(str::to_string),
            channel: self.desc.channel().map(u16::from),
            role: Some(Role::Server),
            require_authentication: Some(false),
            require_authorization: Some(false),
            ..Default::default()
         };
         let handle = self.instance.session().register_profile(profile).await?;
         debug!("Registered server profile for {}", self.desc);

         self.listening = Some(Listening {
            handle,
            _claim: claim,
         });
         Ok(())
      })
   }

   fn accept(&mut self) -> BoxFuture<'_, Result<Connection>> {
      Box::pin(async move {
         self.instance.ensure_active()?;
         let listening = self
            .listening
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;
         let next = async {
            listening
               .handle
               .next()
               .await
               .ok_or(TransportError::ConnectionClosed)
         };
         let req: ConnectRequest = match self.instance.until_destroyed(next).await {
            Ok(req) => req,
            Err(e) => {
               // No more requests will come; release the profile and the claim.
               self.listening = None;
               return Err(e);
            },
         };

         let peer = req.device();
         let stream = req.accept()?;
         info!("Accepted connection from {peer} on {}", self.desc);
         Ok(Connection::spawn(peer.to_string(), stream, self.instance.limits()))
      })
   }

   fn close(&mut self) {
      if self.listening.take().is_some() {
         debug!("Stopped listening on {}", self.desc);
      }
   }

   fn endpoint(&self) -> String {
      self.desc.to_string()
   }
}
