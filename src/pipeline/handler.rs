//! Handler capability contracts and the messages that flow between them.
//!
//! A handler joins a pipeline with one or both capabilities: inbound
//! (connection lifecycle and reads, walking head to tail) and outbound
//! (writes, walking tail to head). Propagation is explicitly opt-in: each
//! method decides whether to call the matching `fire_*`/`write` on its
//! [`HandlerContext`](super::HandlerContext); returning without doing so
//! stops the chain at that node. The default methods forward unchanged, so a
//! handler only overrides the events it cares about.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use super::HandlerContext;

/// A message traveling through the pipeline. Raw network bytes arrive as
/// [`RawBytes`]; decoders replace them with typed messages downstream.
pub type Message = Box<dyn Any>;

/// Envelope for one raw inbound delivery, as handed to the pipeline head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBytes(pub Vec<u8>);

/// Why a connection is closing. Delivered exactly once per connection.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its end of the stream.
    Eof,
    /// A transport error surfaced by the reactor.
    Io(std::io::Error),
    /// A handler requested the close.
    Local,
}

/// Handler for inbound events, walking head to tail.
pub trait InboundHandler: 'static {
    /// The connection has been opened and its pipeline assembled.
    fn on_open(&mut self, ctx: &mut HandlerContext<'_>) {
        ctx.fire_open();
    }

    /// A message arrived from the previous inbound stage.
    fn on_read(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) {
        ctx.fire_read(msg);
    }

    /// The connection is closing for `reason`.
    fn on_close(&mut self, ctx: &mut HandlerContext<'_>, reason: CloseReason) {
        ctx.fire_close(reason);
    }
}

/// Handler for outbound writes, walking tail to head.
pub trait OutboundHandler: 'static {
    /// A message is traveling toward the connection.
    fn on_write(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) {
        ctx.write(msg);
    }
}

/// A handler registration: the capability pair recorded once at insertion
/// time, so dispatch never inspects handler types.
///
/// Clones share the underlying handler, which is what
/// [`Pipeline::remove_by_handler`](super::Pipeline::remove_by_handler)
/// matches on.
#[derive(Clone)]
pub struct HandlerRef {
    pub(super) inbound: Option<Rc<RefCell<dyn InboundHandler>>>,
    pub(super) outbound: Option<Rc<RefCell<dyn OutboundHandler>>>,
}

impl HandlerRef {
    /// Register an inbound-only handler.
    pub fn inbound<H: InboundHandler>(handler: H) -> Self {
        Self {
            inbound: Some(Rc::new(RefCell::new(handler))),
            outbound: None,
        }
    }

    /// Register an outbound-only handler.
    pub fn outbound<H: OutboundHandler>(handler: H) -> Self {
        Self {
            inbound: None,
            outbound: Some(Rc::new(RefCell::new(handler))),
        }
    }

    /// Register a handler with both capabilities.
    pub fn duplex<H: InboundHandler + OutboundHandler>(handler: H) -> Self {
        let shared = Rc::new(RefCell::new(handler));
        Self {
            inbound: Some(shared.clone()),
            outbound: Some(shared),
        }
    }

    /// Assemble a registration from pre-built capability references. Both
    /// sides may be `None`, in which case insertion is rejected.
    pub fn from_parts(
        inbound: Option<Rc<RefCell<dyn InboundHandler>>>,
        outbound: Option<Rc<RefCell<dyn OutboundHandler>>>,
    ) -> Self {
        Self { inbound, outbound }
    }

    /// True when the registration carries neither capability.
    pub fn is_empty(&self) -> bool {
        self.inbound.is_none() && self.outbound.is_none()
    }
}
