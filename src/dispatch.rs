//! Command dispatch over decoded frames.
//!
//! The [`Service`] contract is the seam between the protocol core and
//! application code: a service sees a [`Request`] and answers through a
//! [`Response`], never touching the pipeline machinery. [`Dispatcher`]
//! routes requests to per-command handler functions, and
//! [`ServiceHandler`] hosts any service as the terminal inbound stage of a
//! pipeline.

use crate::codec::CommandFrame;
use crate::pipeline::{HandlerContext, InboundHandler, Message};
use chrono::{DateTime, Utc};
use std::cell::OnceCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::warn;

/// Dispatch errors. Registration failures leave the registry untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// A handler is already registered for this command.
    #[error("command already registered: {0}")]
    DuplicateCommand(String),
    /// No handler is registered for this command.
    #[error("no handler for command: {0}")]
    UnknownCommand(String),
}

/// One decoded request as seen by a service.
pub struct Request {
    frame: CommandFrame,
    peer: SocketAddr,
    created_at: DateTime<Utc>,
    params: OnceCell<HashMap<String, Vec<String>>>,
}

impl Request {
    pub(crate) fn new(frame: CommandFrame, peer: SocketAddr) -> Self {
        Self {
            frame,
            peer,
            created_at: Utc::now(),
            params: OnceCell::new(),
        }
    }

    pub fn command(&self) -> &str {
        &self.frame.command
    }

    pub fn request_id(&self) -> i32 {
        self.frame.request_id
    }

    pub fn content(&self) -> &[u8] {
        &self.frame.content
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Values for a `key=value&key=value` parameter in the content, parsed
    /// lazily on first access. A key without `=` maps to no values.
    pub fn parameter_values(&self, key: &str) -> Option<&[String]> {
        self.params().get(key).map(Vec::as_slice)
    }

    fn params(&self) -> &HashMap<String, Vec<String>> {
        self.params.get_or_init(|| parse_params(&self.frame.content))
    }
}

fn parse_params(content: &[u8]) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    let text = String::from_utf8_lossy(content);
    for pair in text.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => map
                .entry(key.to_string())
                .or_default()
                .push(value.to_string()),
            None => {
                map.entry(pair.to_string()).or_default();
            }
        }
    }
    map
}

/// A service's reply channel. Writes travel the outbound chain from the
/// hosting handler's position; `mark_close` asks the connection to close
/// once pending bytes are flushed.
pub struct Response<'a, 'p> {
    ctx: &'a mut HandlerContext<'p>,
}

impl Response<'_, '_> {
    pub fn write(&mut self, bytes: Vec<u8>) {
        self.ctx.write(Box::new(bytes));
    }

    pub fn mark_close(&mut self) {
        self.ctx.conn().close();
    }
}

/// The request/response contract implemented by application code.
pub trait Service: 'static {
    fn service(
        &mut self,
        request: &Request,
        response: &mut Response<'_, '_>,
    ) -> Result<(), DispatchError>;
}

type CommandHandler = Box<dyn FnMut(&Request, &mut Response<'_, '_>)>;

/// Routes requests to handler functions by command string.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, CommandHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `command`. Registering a command twice is a
    /// recoverable error and leaves the existing handler in place.
    pub fn add_handler(
        &mut self,
        command: &str,
        handler: impl FnMut(&Request, &mut Response<'_, '_>) + 'static,
    ) -> Result<(), DispatchError> {
        if self.handlers.contains_key(command) {
            return Err(DispatchError::DuplicateCommand(command.to_string()));
        }
        self.handlers.insert(command.to_string(), Box::new(handler));
        Ok(())
    }
}

impl Service for Dispatcher {
    fn service(
        &mut self,
        request: &Request,
        response: &mut Response<'_, '_>,
    ) -> Result<(), DispatchError> {
        match self.handlers.get_mut(request.command()) {
            Some(handler) => {
                handler(request, response);
                Ok(())
            }
            None => Err(DispatchError::UnknownCommand(
                request.command().to_string(),
            )),
        }
    }
}

/// Hosts a [`Service`] as an inbound pipeline stage. Answers without
/// forwarding, so it terminates inbound propagation; messages other than
/// [`CommandFrame`] pass through untouched.
pub struct ServiceHandler<S: Service> {
    service: S,
}

impl<S: Service> ServiceHandler<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S: Service> InboundHandler for ServiceHandler<S> {
    fn on_read(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) {
        let frame = match msg.downcast::<CommandFrame>() {
            Ok(frame) => *frame,
            Err(other) => {
                ctx.fire_read(other);
                return;
            }
        };

        let request = Request::new(frame, ctx.conn().peer_addr());
        let mut response = Response { ctx };
        if let Err(e) = self.service.service(&request, &mut response) {
            warn!(
                peer = %request.peer_addr(),
                command = %request.command(),
                error = %e,
                "service dispatch failed"
            );
        }
    }
}
