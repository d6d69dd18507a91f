//! Per-connection handler chain.
//!
//! A pipeline is an ordered chain of named handler nodes bounded by two
//! permanent sentinels. Nodes live in a slab arena and are addressed by
//! stable indices, so insertion and removal are O(1) once a node is found
//! and no aliased references into the chain exist. Each node records its
//! capability pair (inbound/outbound handler references) at insertion time;
//! dispatch walks the links and never inspects handler types.
//!
//! Inbound events walk head to tail, outbound writes walk tail to head, and
//! every step is explicitly opt-in: a handler that does not re-fire the
//! event on its context ends the chain there. A write that walks past the
//! head without meeting an outbound handler is queued on the connection,
//! the chain's terminal default.
//!
//! Handlers may mutate the chain while an event is in flight. Removal
//! unlinks the node immediately but defers arena reclamation until the
//! outermost dispatch unwinds; the removed node keeps its own links so an
//! in-flight traversal standing on it still finds its former neighbors.
//!
//! A pipeline is owned by one connection on one worker and carries no
//! internal synchronization. Re-entering the handler that is currently
//! executing (for example by firing an event backwards into yourself)
//! is a programming error and panics.

mod handler;

pub use handler::{
    CloseReason, HandlerRef, InboundHandler, Message, OutboundHandler, RawBytes,
};

use crate::conn::Conn;
use slab::Slab;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::warn;

const HEAD_NAME: &str = "head";
const TAIL_NAME: &str = "tail";

/// Errors from chain mutation. The chain is untouched in every error case.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The registration carries neither inbound nor outbound capability.
    #[error("handler implements neither inbound nor outbound capability")]
    NoCapability,
    /// A node with this name already exists in the chain.
    #[error("handler name already registered: {0}")]
    DuplicateName(String),
}

struct Node {
    name: String,
    inbound: Option<Rc<RefCell<dyn InboundHandler>>>,
    outbound: Option<Rc<RefCell<dyn OutboundHandler>>>,
    prev: Option<usize>,
    next: Option<usize>,
    removed: bool,
}

impl Node {
    fn sentinel(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inbound: None,
            outbound: None,
            prev: None,
            next: None,
            removed: false,
        }
    }
}

/// Ordered chain of handlers owned by one connection.
pub struct Pipeline {
    nodes: Slab<Node>,
    head: usize,
    tail: usize,
    conn: Conn,
    dispatch_depth: u32,
    pending_reclaim: Vec<usize>,
}

impl Pipeline {
    /// Build an empty two-sentinel chain for `conn`.
    pub fn new(conn: Conn) -> Self {
        let mut nodes = Slab::new();
        let head = nodes.insert(Node::sentinel(HEAD_NAME));
        let tail = nodes.insert(Node::sentinel(TAIL_NAME));
        nodes[head].next = Some(tail);
        nodes[tail].prev = Some(head);
        Self {
            nodes,
            head,
            tail,
            conn,
            dispatch_depth: 0,
            pending_reclaim: Vec::new(),
        }
    }

    /// The connection this pipeline belongs to.
    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    /// Insert a handler immediately after the head sentinel.
    pub fn add_first(&mut self, name: &str, handler: HandlerRef) -> Result<(), PipelineError> {
        self.validate(name, &handler)?;
        let after = self.head;
        self.insert_after(after, name, handler);
        Ok(())
    }

    /// Insert a handler immediately before the tail sentinel.
    pub fn add_last(&mut self, name: &str, handler: HandlerRef) -> Result<(), PipelineError> {
        self.validate(name, &handler)?;
        let after = self.nodes[self.tail].prev.expect("tail always has prev");
        self.insert_after(after, name, handler);
        Ok(())
    }

    /// Unlink the first node named `name`, scanning from the head. Returns
    /// whether a node was removed; absent names are a no-op.
    pub fn remove(&mut self, name: &str) -> bool {
        let mut cur = self.nodes[self.head].next;
        while let Some(i) = cur {
            if i == self.tail {
                break;
            }
            let node = &self.nodes[i];
            if !node.removed && node.name == name {
                self.unlink(i);
                return true;
            }
            cur = node.next;
        }
        false
    }

    /// Unlink the first node whose handler is the one behind `handler`
    /// (reference identity), after validating the registration the same way
    /// insertion does.
    pub fn remove_by_handler(&mut self, handler: &HandlerRef) -> Result<bool, PipelineError> {
        if handler.is_empty() {
            return Err(PipelineError::NoCapability);
        }
        let mut cur = self.nodes[self.head].next;
        while let Some(i) = cur {
            if i == self.tail {
                break;
            }
            let node = &self.nodes[i];
            if !node.removed && Self::same_handler(node, handler) {
                self.unlink(i);
                return Ok(true);
            }
            cur = node.next;
        }
        Ok(false)
    }

    /// Names of the user handlers in chain order.
    pub fn names(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut cur = self.nodes[self.head].next;
        while let Some(i) = cur {
            if i == self.tail {
                break;
            }
            let node = &self.nodes[i];
            if !node.removed {
                out.push(node.name.clone());
            }
            cur = node.next;
        }
        out
    }

    /// Fire the connection-opened event from the head.
    pub fn fire_open(&mut self) {
        self.begin_dispatch();
        let head = self.head;
        HandlerContext {
            pipeline: &mut *self,
            node: head,
        }
        .fire_open();
        self.end_dispatch();
    }

    /// Fire a message-read event from the head.
    pub fn fire_read(&mut self, msg: Message) {
        self.begin_dispatch();
        let head = self.head;
        HandlerContext {
            pipeline: &mut *self,
            node: head,
        }
        .fire_read(msg);
        self.end_dispatch();
    }

    /// Fire the connection-closed event from the head.
    pub fn fire_close(&mut self, reason: CloseReason) {
        self.begin_dispatch();
        let head = self.head;
        HandlerContext {
            pipeline: &mut *self,
            node: head,
        }
        .fire_close(reason);
        self.end_dispatch();
    }

    fn validate(&self, name: &str, handler: &HandlerRef) -> Result<(), PipelineError> {
        if handler.is_empty() {
            return Err(PipelineError::NoCapability);
        }
        let mut cur = Some(self.head);
        while let Some(i) = cur {
            let node = &self.nodes[i];
            if !node.removed && node.name == name {
                return Err(PipelineError::DuplicateName(name.to_string()));
            }
            cur = node.next;
        }
        Ok(())
    }

    fn insert_after(&mut self, after: usize, name: &str, handler: HandlerRef) {
        let next = self.nodes[after].next.expect("insertion point has next");
        let idx = self.nodes.insert(Node {
            name: name.to_string(),
            inbound: handler.inbound,
            outbound: handler.outbound,
            prev: Some(after),
            next: Some(next),
            removed: false,
        });
        self.nodes[after].next = Some(idx);
        self.nodes[next].prev = Some(idx);
    }

    /// Bypass `idx` in the chain. The node keeps its own links so in-flight
    /// traversal continues past it; the arena slot is reclaimed immediately
    /// outside dispatch, otherwise once the outermost dispatch unwinds.
    fn unlink(&mut self, idx: usize) {
        let prev = self.nodes[idx].prev;
        let next = self.nodes[idx].next;
        if let Some(p) = prev {
            self.nodes[p].next = next;
        }
        if let Some(n) = next {
            self.nodes[n].prev = prev;
        }
        if self.dispatch_depth > 0 {
            let node = &mut self.nodes[idx];
            node.removed = true;
            node.inbound = None;
            node.outbound = None;
            self.pending_reclaim.push(idx);
        } else {
            self.nodes.remove(idx);
        }
    }

    fn same_handler(node: &Node, handler: &HandlerRef) -> bool {
        let inbound_match = match (&node.inbound, &handler.inbound) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        };
        let outbound_match = match (&node.outbound, &handler.outbound) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        };
        inbound_match || outbound_match
    }

    fn next_inbound(&self, from: usize) -> Option<(usize, Rc<RefCell<dyn InboundHandler>>)> {
        let mut cur = self.nodes[from].next;
        while let Some(i) = cur {
            let node = &self.nodes[i];
            if !node.removed {
                if let Some(h) = &node.inbound {
                    return Some((i, Rc::clone(h)));
                }
            }
            cur = node.next;
        }
        None
    }

    fn prev_outbound(&self, from: usize) -> Option<(usize, Rc<RefCell<dyn OutboundHandler>>)> {
        let mut cur = self.nodes[from].prev;
        while let Some(i) = cur {
            let node = &self.nodes[i];
            if !node.removed {
                if let Some(h) = &node.outbound {
                    return Some((i, Rc::clone(h)));
                }
            }
            cur = node.prev;
        }
        None
    }

    /// Terminal default for writes that walked past the head: queue the
    /// bytes on the connection's non-blocking send queue.
    fn send_to_conn(&self, msg: Message) {
        match msg.downcast::<Vec<u8>>() {
            Ok(bytes) => self.conn.send(&bytes),
            Err(other) => match other.downcast::<RawBytes>() {
                Ok(raw) => self.conn.send(&raw.0),
                Err(_) => warn!(
                    peer = %self.conn.peer_addr(),
                    "dropping non-byte outbound message at pipeline head"
                ),
            },
        }
    }

    fn begin_dispatch(&mut self) {
        self.dispatch_depth += 1;
    }

    fn end_dispatch(&mut self) {
        self.dispatch_depth -= 1;
        if self.dispatch_depth == 0 {
            for idx in std::mem::take(&mut self.pending_reclaim) {
                self.nodes.try_remove(idx);
            }
        }
    }
}

/// A handler's view of its position in the chain during dispatch.
///
/// Every `fire_*`/`write` call propagates from this node, and the mutation
/// methods allow a handler to reshape the chain mid-event.
pub struct HandlerContext<'a> {
    pipeline: &'a mut Pipeline,
    node: usize,
}

impl HandlerContext<'_> {
    /// Name of the node this context belongs to.
    pub fn name(&self) -> &str {
        &self.pipeline.nodes[self.node].name
    }

    /// The connection owning this pipeline.
    pub fn conn(&self) -> &Conn {
        &self.pipeline.conn
    }

    /// Forward the connection-opened event to the next inbound handler.
    pub fn fire_open(&mut self) {
        if let Some((idx, handler)) = self.pipeline.next_inbound(self.node) {
            let mut ctx = HandlerContext {
                pipeline: &mut *self.pipeline,
                node: idx,
            };
            handler.borrow_mut().on_open(&mut ctx);
        }
    }

    /// Forward a message to the next inbound handler.
    pub fn fire_read(&mut self, msg: Message) {
        if let Some((idx, handler)) = self.pipeline.next_inbound(self.node) {
            let mut ctx = HandlerContext {
                pipeline: &mut *self.pipeline,
                node: idx,
            };
            handler.borrow_mut().on_read(&mut ctx, msg);
        }
    }

    /// Forward the connection-closed event to the next inbound handler.
    pub fn fire_close(&mut self, reason: CloseReason) {
        if let Some((idx, handler)) = self.pipeline.next_inbound(self.node) {
            let mut ctx = HandlerContext {
                pipeline: &mut *self.pipeline,
                node: idx,
            };
            handler.borrow_mut().on_close(&mut ctx, reason);
        }
    }

    /// Send a message toward the connection through the nearest outbound
    /// handler behind this node, or queue it on the connection if none.
    pub fn write(&mut self, msg: Message) {
        match self.pipeline.prev_outbound(self.node) {
            Some((idx, handler)) => {
                let mut ctx = HandlerContext {
                    pipeline: &mut *self.pipeline,
                    node: idx,
                };
                handler.borrow_mut().on_write(&mut ctx, msg);
            }
            None => self.pipeline.send_to_conn(msg),
        }
    }

    /// Insert a handler at the front of the chain.
    pub fn add_first(&mut self, name: &str, handler: HandlerRef) -> Result<(), PipelineError> {
        self.pipeline.add_first(name, handler)
    }

    /// Insert a handler at the back of the chain.
    pub fn add_last(&mut self, name: &str, handler: HandlerRef) -> Result<(), PipelineError> {
        self.pipeline.add_last(name, handler)
    }

    /// Remove a handler by name; no-op if absent.
    pub fn remove(&mut self, name: &str) -> bool {
        self.pipeline.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn test_pipeline() -> Pipeline {
        let peer: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        Pipeline::new(Conn::new(peer))
    }

    type Log = Rc<RefCell<Vec<String>>>;

    /// Records every event it sees, then forwards.
    struct Recorder {
        tag: &'static str,
        log: Log,
    }

    impl InboundHandler for Recorder {
        fn on_open(&mut self, ctx: &mut HandlerContext<'_>) {
            self.log.borrow_mut().push(format!("open:{}", self.tag));
            ctx.fire_open();
        }

        fn on_read(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) {
            self.log.borrow_mut().push(format!("read:{}", self.tag));
            ctx.fire_read(msg);
        }

        fn on_close(&mut self, ctx: &mut HandlerContext<'_>, reason: CloseReason) {
            self.log.borrow_mut().push(format!("close:{}", self.tag));
            ctx.fire_close(reason);
        }
    }

    /// Consumes reads without forwarding.
    struct Terminator {
        log: Log,
    }

    impl InboundHandler for Terminator {
        fn on_read(&mut self, _ctx: &mut HandlerContext<'_>, _msg: Message) {
            self.log.borrow_mut().push("read:terminator".to_string());
        }
    }

    fn recorder(tag: &'static str, log: &Log) -> HandlerRef {
        HandlerRef::inbound(Recorder {
            tag,
            log: log.clone(),
        })
    }

    #[test]
    fn test_inbound_order_add_last_then_add_first() {
        let mut pipeline = test_pipeline();
        let log: Log = Rc::default();

        pipeline.add_last("a", recorder("a", &log)).unwrap();
        pipeline.add_last("b", recorder("b", &log)).unwrap();
        pipeline.add_last("c", recorder("c", &log)).unwrap();

        pipeline.fire_read(Box::new(1u8));
        assert_eq!(*log.borrow(), vec!["read:a", "read:b", "read:c"]);

        log.borrow_mut().clear();
        pipeline.add_first("d", recorder("d", &log)).unwrap();
        pipeline.fire_read(Box::new(1u8));
        assert_eq!(*log.borrow(), vec!["read:d", "read:a", "read:b", "read:c"]);
    }

    #[test]
    fn test_handler_that_does_not_forward_stops_the_chain() {
        let mut pipeline = test_pipeline();
        let log: Log = Rc::default();

        pipeline.add_last("a", recorder("a", &log)).unwrap();
        pipeline
            .add_last(
                "stop",
                HandlerRef::inbound(Terminator { log: log.clone() }),
            )
            .unwrap();
        pipeline.add_last("c", recorder("c", &log)).unwrap();

        pipeline.fire_read(Box::new(1u8));
        assert_eq!(*log.borrow(), vec!["read:a", "read:terminator"]);
    }

    #[test]
    fn test_open_and_close_walk_the_chain() {
        let mut pipeline = test_pipeline();
        let log: Log = Rc::default();

        pipeline.add_last("a", recorder("a", &log)).unwrap();
        pipeline.add_last("b", recorder("b", &log)).unwrap();

        pipeline.fire_open();
        pipeline.fire_close(CloseReason::Eof);
        assert_eq!(
            *log.borrow(),
            vec!["open:a", "open:b", "close:a", "close:b"]
        );
    }

    #[test]
    fn test_remove_is_idempotent_and_preserves_order() {
        let mut pipeline = test_pipeline();
        let log: Log = Rc::default();

        pipeline.add_last("a", recorder("a", &log)).unwrap();
        pipeline.add_last("b", recorder("b", &log)).unwrap();
        pipeline.add_last("c", recorder("c", &log)).unwrap();

        assert!(!pipeline.remove("absent"));
        assert!(pipeline.remove("b"));
        assert!(!pipeline.remove("b"));
        assert_eq!(pipeline.names(), vec!["a", "c"]);

        pipeline.fire_read(Box::new(1u8));
        assert_eq!(*log.borrow(), vec!["read:a", "read:c"]);
    }

    #[test]
    fn test_duplicate_name_is_rejected_without_mutation() {
        let mut pipeline = test_pipeline();
        let log: Log = Rc::default();

        pipeline.add_last("a", recorder("a", &log)).unwrap();
        let err = pipeline.add_last("a", recorder("a2", &log)).unwrap_err();
        assert_eq!(err, PipelineError::DuplicateName("a".to_string()));
        assert_eq!(pipeline.names(), vec!["a"]);
    }

    #[test]
    fn test_empty_capability_pair_is_rejected() {
        let mut pipeline = test_pipeline();
        let empty = HandlerRef::from_parts(None, None);

        assert_eq!(
            pipeline.add_last("nothing", empty.clone()).unwrap_err(),
            PipelineError::NoCapability
        );
        assert_eq!(
            pipeline.remove_by_handler(&empty).unwrap_err(),
            PipelineError::NoCapability
        );
        assert!(pipeline.names().is_empty());
    }

    #[test]
    fn test_remove_by_handler_matches_identity() {
        let mut pipeline = test_pipeline();
        let log: Log = Rc::default();

        let keep = recorder("keep", &log);
        let target = recorder("target", &log);
        pipeline.add_last("keep", keep).unwrap();
        pipeline.add_last("target", target.clone()).unwrap();

        assert!(pipeline.remove_by_handler(&target).unwrap());
        assert!(!pipeline.remove_by_handler(&target).unwrap());
        assert_eq!(pipeline.names(), vec!["keep"]);
    }

    /// Inbound handler that replies by writing bytes outbound.
    struct Replier;

    impl InboundHandler for Replier {
        fn on_read(&mut self, ctx: &mut HandlerContext<'_>, _msg: Message) {
            ctx.write(Box::new(b"reply".to_vec()));
        }
    }

    /// Outbound handler that upper-cases byte messages and forwards them.
    struct Upper;

    impl OutboundHandler for Upper {
        fn on_write(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) {
            match msg.downcast::<Vec<u8>>() {
                Ok(bytes) => ctx.write(Box::new(bytes.to_ascii_uppercase())),
                Err(other) => ctx.write(other),
            }
        }
    }

    /// Outbound handler that swallows writes.
    struct Blackhole;

    impl OutboundHandler for Blackhole {
        fn on_write(&mut self, _ctx: &mut HandlerContext<'_>, _msg: Message) {}
    }

    #[test]
    fn test_write_with_no_outbound_handler_reaches_the_connection() {
        let mut pipeline = test_pipeline();
        pipeline
            .add_last("replier", HandlerRef::inbound(Replier))
            .unwrap();

        pipeline.fire_read(Box::new(1u8));
        assert_eq!(pipeline.conn().pending_bytes(), 5);
    }

    #[test]
    fn test_outbound_handler_transforms_on_the_way_out() {
        let mut pipeline = test_pipeline();
        pipeline
            .add_last("upper", HandlerRef::outbound(Upper))
            .unwrap();
        pipeline
            .add_last("replier", HandlerRef::inbound(Replier))
            .unwrap();

        pipeline.fire_read(Box::new(1u8));

        let mut out = Vec::new();
        pipeline.conn().flush(&mut out).unwrap();
        assert_eq!(out, b"REPLY");
    }

    #[test]
    fn test_outbound_handler_can_terminate_the_write() {
        let mut pipeline = test_pipeline();
        pipeline
            .add_last("blackhole", HandlerRef::outbound(Blackhole))
            .unwrap();
        pipeline
            .add_last("replier", HandlerRef::inbound(Replier))
            .unwrap();

        pipeline.fire_read(Box::new(1u8));
        assert_eq!(pipeline.conn().pending_bytes(), 0);
    }

    /// Removes itself on first read, then forwards.
    struct OneShot {
        log: Log,
    }

    impl InboundHandler for OneShot {
        fn on_read(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) {
            self.log.borrow_mut().push("read:oneshot".to_string());
            ctx.remove("oneshot");
            ctx.fire_read(msg);
        }
    }

    #[test]
    fn test_handler_may_remove_itself_mid_dispatch() {
        let mut pipeline = test_pipeline();
        let log: Log = Rc::default();

        pipeline
            .add_last("oneshot", HandlerRef::inbound(OneShot { log: log.clone() }))
            .unwrap();
        pipeline.add_last("after", recorder("after", &log)).unwrap();

        pipeline.fire_read(Box::new(1u8));
        pipeline.fire_read(Box::new(2u8));
        assert_eq!(
            *log.borrow(),
            vec!["read:oneshot", "read:after", "read:after"]
        );
        assert_eq!(pipeline.names(), vec!["after"]);
    }

    #[test]
    fn test_duplex_handler_counts_once_for_identity_removal() {
        struct Both;
        impl InboundHandler for Both {}
        impl OutboundHandler for Both {}

        let mut pipeline = test_pipeline();
        let both = HandlerRef::duplex(Both);
        pipeline.add_last("both", both.clone()).unwrap();

        assert!(pipeline.remove_by_handler(&both).unwrap());
        assert!(pipeline.names().is_empty());
    }
}
