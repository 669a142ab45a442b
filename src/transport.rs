//! Transport abstraction shared by all endpoint factories.
//!
//! A plugin registers an `EndpointFactory` per protocol with the
//! communicator. The factory parses endpoint strings into `Endpoint`s, which
//! in turn produce connectors (client side) and acceptors (server side).

use std::{fmt, sync::Arc, time::Duration};

use futures::future::BoxFuture;

use crate::{
   connection::Connection,
   error::{Result, TransportError},
};

/// Parses endpoint strings for one protocol.
pub trait EndpointFactory: Send + Sync {
   /// Protocol keyword, the first token of an endpoint string.
   fn protocol(&self) -> &'static str;

   /// Numeric endpoint type used on the wire.
   fn type_id(&self) -> i16;

   /// Parses the option tokens that follow the protocol keyword.
   fn create(&self, args: &[String]) -> Result<Arc<dyn Endpoint>>;

   /// Called when the factory is removed from its communicator.
   fn destroy(&self) {}
}

/// A parsed, addressable endpoint.
pub trait Endpoint: Send + Sync + fmt::Debug + fmt::Display {
   fn protocol(&self) -> &'static str;

   /// `None` means no timeout.
   fn timeout(&self) -> Option<Duration>;

   fn connector(&self) -> Result<Box<dyn Connector>>;

   fn acceptor(&self) -> Result<Box<dyn Acceptor>>;
}

/// Establishes outgoing connections.
pub trait Connector: Send + Sync + fmt::Display {
   fn connect(&self) -> BoxFuture<'_, Result<Connection>>;
}

/// Accepts incoming connections.
pub trait Acceptor: Send + fmt::Display {
   /// Starts listening. Must be called once before `accept`.
   fn listen(&mut self) -> BoxFuture<'_, Result<()>>;

   fn accept(&mut self) -> BoxFuture<'_, Result<Connection>>;

   /// Stops listening and releases the endpoint. Idempotent.
   fn close(&mut self);

   /// The endpoint this acceptor listens on, with defaults resolved.
   fn endpoint(&self) -> String;
}

/// Splits an endpoint string into whitespace-separated tokens.
///
/// Double quotes group a token containing whitespace; the quotes are removed.
pub fn tokenize(input: &str) -> Result<Vec<String>> {
   let mut tokens = Vec::new();
   let mut current = String::new();
   let mut in_token = false;
   let mut quoted = false;

   for c in input.chars() {
      match c {
         '"' => {
            quoted = !quoted;
            in_token = true;
         },
         c if c.is_whitespace() && !quoted => {
            if in_token {
               tokens.push(std::mem::take(&mut current));
               in_token = false;
            }
         },
         c => {
            current.push(c);
            in_token = true;
         },
      }
   }

   if quoted {
      return Err(TransportError::invalid_endpoint(input, "mismatched quotes"));
   }
   if in_token {
      tokens.push(current);
   }
   Ok(tokens)
}

/// Quotes `value` if it would not survive `tokenize` as a single token.
pub fn quote(value: &str) -> String {
   if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"') {
      format!("\"{}\"", value.replace('"', ""))
   } else {
      value.to_string()
   }
}
