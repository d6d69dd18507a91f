//! Per-connection handle shared between the event loop and the pipeline.
//!
//! A [`Conn`] is a cheap clone over shared per-connection state: the peer
//! address, the pending outbound byte queue, a close-request flag, and one
//! opaque context slot. Handlers write through it without blocking; the
//! owning worker's event loop drains the queue to the socket when it is
//! writable. A connection and everything reachable through its handle live
//! on exactly one worker thread, so the interior state needs no locking.

use bytes::{Buf, BytesMut};
use std::any::Any;
use std::cell::RefCell;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::rc::Rc;

struct ConnInner {
    peer: SocketAddr,
    pending: BytesMut,
    close_requested: bool,
    context: Option<Box<dyn Any>>,
}

/// Handle to one connection's shared state.
#[derive(Clone)]
pub struct Conn {
    inner: Rc<RefCell<ConnInner>>,
}

impl Conn {
    /// Create a handle for a connection with the given peer address.
    pub(crate) fn new(peer: SocketAddr) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ConnInner {
                peer,
                pending: BytesMut::new(),
                close_requested: false,
                context: None,
            })),
        }
    }

    /// Remote address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.borrow().peer
    }

    /// Queue bytes for asynchronous delivery. Never blocks; the event loop
    /// flushes the queue when the socket is writable.
    pub fn send(&self, bytes: &[u8]) {
        self.inner.borrow_mut().pending.extend_from_slice(bytes);
    }

    /// Request that the connection be closed once pending bytes are flushed.
    pub fn close(&self) {
        self.inner.borrow_mut().close_requested = true;
    }

    /// Whether a close has been requested.
    pub fn is_close_requested(&self) -> bool {
        self.inner.borrow().close_requested
    }

    /// Store an opaque per-connection value, replacing any previous one.
    pub fn set_context(&self, value: Box<dyn Any>) {
        self.inner.borrow_mut().context = Some(value);
    }

    /// Take the opaque per-connection value, leaving the slot empty.
    pub fn take_context(&self) -> Option<Box<dyn Any>> {
        self.inner.borrow_mut().context.take()
    }

    /// Bytes queued but not yet written to the socket.
    pub fn pending_bytes(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Write as much of the pending queue as `dst` accepts.
    ///
    /// Returns `Ok(true)` once the queue is fully drained and `Ok(false)` if
    /// the destination would block with bytes still pending.
    pub(crate) fn flush(&self, dst: &mut impl Write) -> io::Result<bool> {
        let mut inner = self.inner.borrow_mut();
        while !inner.pending.is_empty() {
            match dst.write(&inner.pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => inner.pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Conn")
            .field("peer", &inner.peer)
            .field("pending", &inner.pending.len())
            .field("close_requested", &inner.close_requested)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Conn {
        Conn::new("127.0.0.1:9000".parse().unwrap())
    }

    /// Writer that accepts a fixed number of bytes, then would-blocks.
    struct Throttled {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            let n = buf.len().min(self.budget);
            self.accepted.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_send_queues_and_flush_drains() {
        let conn = test_conn();
        conn.send(b"hello ");
        conn.send(b"world");
        assert_eq!(conn.pending_bytes(), 11);

        let mut out = Vec::new();
        assert!(conn.flush(&mut out).unwrap());
        assert_eq!(out, b"hello world");
        assert_eq!(conn.pending_bytes(), 0);
    }

    #[test]
    fn test_partial_flush_keeps_remainder() {
        let conn = test_conn();
        conn.send(b"abcdef");

        let mut dst = Throttled {
            accepted: Vec::new(),
            budget: 4,
        };
        assert!(!conn.flush(&mut dst).unwrap());
        assert_eq!(dst.accepted, b"abcd");
        assert_eq!(conn.pending_bytes(), 2);

        let mut rest = Vec::new();
        assert!(conn.flush(&mut rest).unwrap());
        assert_eq!(rest, b"ef");
    }

    #[test]
    fn test_close_request_flag() {
        let conn = test_conn();
        assert!(!conn.is_close_requested());
        conn.close();
        assert!(conn.is_close_requested());
    }

    #[test]
    fn test_context_slot() {
        let conn = test_conn();
        assert!(conn.take_context().is_none());

        conn.set_context(Box::new("session-41".to_string()));
        let value = conn.take_context().unwrap();
        assert_eq!(value.downcast_ref::<String>().unwrap(), "session-41");
        assert!(conn.take_context().is_none());
    }
}
