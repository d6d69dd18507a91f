//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue
//! on macOS.
//!
//! Reads are drained per event into a worker-local scratch buffer and each
//! chunk is fired at the pipeline head as a `RawBytes` envelope, so the
//! first handler (normally the frame decoder) always sees raw bytes.
//! Outbound bytes queued by handlers are flushed after every dispatch;
//! leftovers register writable interest and drain when the socket allows.

use super::ConnInitializer;
use crate::config::Config;
use crate::conn::Conn;
use crate::pipeline::{CloseReason, Pipeline, RawBytes};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 1024;

/// Per-worker connection state.
struct ActiveConn {
    stream: TcpStream,
    conn: Conn,
    pipeline: Pipeline,
    interests: Interest,
    /// Set once the close event has fired; it never fires twice.
    closed: bool,
}

/// Run the server: spawn the workers and block until they exit.
pub fn run(config: Arc<Config>, initializer: ConnInitializer) -> io::Result<()> {
    let num_workers = config.workers.unwrap_or_else(num_cpus);

    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    info!(workers = num_workers, addr = %addr, "starting reactor");

    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let config = Arc::clone(&config);
        let initializer = Arc::clone(&initializer);

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = worker_loop(worker_id, addr, &config, &initializer) {
                    error!(worker = worker_id, error = %e, "worker failed");
                }
            })?;

        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

fn worker_loop(
    worker_id: usize,
    addr: SocketAddr,
    config: &Config,
    initializer: &ConnInitializer,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENT_CAPACITY);

    // Create listener with SO_REUSEPORT for kernel load balancing
    let listener = create_listener_with_reuseport(addr)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut connections: Slab<ActiveConn> = Slab::with_capacity(config.max_connections);
    let mut scratch = vec![0u8; config.read_buffer];

    info!(
        worker = worker_id,
        max_connections = config.max_connections,
        read_buffer = config.read_buffer,
        "worker started"
    );

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(
                        &listener,
                        &mut poll,
                        &mut connections,
                        config.max_connections,
                        worker_id,
                        initializer,
                    )?;
                }
                Token(conn_id) => {
                    handle_connection_event(
                        conn_id,
                        event,
                        &mut poll,
                        &mut connections,
                        &mut scratch,
                    );
                }
            }
        }
    }
}

fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<ActiveConn>,
    max_connections: usize,
    worker_id: usize,
    initializer: &ConnInitializer,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if connections.len() >= max_connections {
                    warn!("connection limit reached, rejecting connection");
                    continue;
                }

                let conn = Conn::new(peer_addr);
                let mut pipeline = Pipeline::new(conn.clone());
                initializer(&mut pipeline);

                let conn_id = connections.insert(ActiveConn {
                    stream,
                    conn,
                    pipeline,
                    interests: Interest::READABLE,
                    closed: false,
                });

                // Re-borrow after insert
                let ac = &mut connections[conn_id];
                poll.registry()
                    .register(&mut ac.stream, Token(conn_id), Interest::READABLE)?;

                debug!(
                    worker = worker_id,
                    conn_id,
                    peer = %peer_addr,
                    "accepted connection"
                );

                ac.pipeline.fire_open();
                after_dispatch(conn_id, poll, connections);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!("accept error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

fn handle_connection_event(
    conn_id: usize,
    event: &mio::event::Event,
    poll: &mut Poll,
    connections: &mut Slab<ActiveConn>,
    scratch: &mut [u8],
) {
    if !connections.contains(conn_id) {
        return;
    }

    if event.is_readable() {
        handle_readable(conn_id, poll, connections, scratch);
    }

    // The readable path may have closed and removed the connection.
    if !connections.contains(conn_id) {
        return;
    }

    if event.is_writable() {
        handle_writable(conn_id, poll, connections);
    }
}

fn handle_readable(
    conn_id: usize,
    poll: &mut Poll,
    connections: &mut Slab<ActiveConn>,
    scratch: &mut [u8],
) {
    // Drain the socket; with edge-triggered readiness a partial read
    // would otherwise lose the rest until the peer sends again.
    loop {
        let ac = match connections.get_mut(conn_id) {
            Some(ac) => ac,
            None => return,
        };

        match ac.stream.read(scratch) {
            Ok(0) => {
                close_connection(conn_id, poll, connections, CloseReason::Eof);
                return;
            }
            Ok(n) => {
                let chunk = scratch[..n].to_vec();
                ac.pipeline.fire_read(Box::new(RawBytes(chunk)));
                if ac.conn.is_close_requested() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                close_connection(conn_id, poll, connections, CloseReason::Io(e));
                return;
            }
        }
    }

    after_dispatch(conn_id, poll, connections);
}

fn handle_writable(conn_id: usize, poll: &mut Poll, connections: &mut Slab<ActiveConn>) {
    after_dispatch(conn_id, poll, connections);
}

/// Flush pending outbound bytes and settle the connection's fate: keep
/// reading, wait for writability, or honor a requested close.
fn after_dispatch(conn_id: usize, poll: &mut Poll, connections: &mut Slab<ActiveConn>) {
    let ac = match connections.get_mut(conn_id) {
        Some(ac) => ac,
        None => return,
    };

    match ac.conn.flush(&mut ac.stream) {
        Ok(true) => {
            if ac.conn.is_close_requested() {
                close_connection(conn_id, poll, connections, CloseReason::Local);
                return;
            }
            update_interests(conn_id, poll, ac, Interest::READABLE);
        }
        Ok(false) => {
            update_interests(
                conn_id,
                poll,
                ac,
                Interest::READABLE.add(Interest::WRITABLE),
            );
        }
        Err(e) => {
            close_connection(conn_id, poll, connections, CloseReason::Io(e));
        }
    }
}

fn update_interests(conn_id: usize, poll: &mut Poll, ac: &mut ActiveConn, wanted: Interest) {
    if ac.interests == wanted {
        return;
    }
    if let Err(e) = poll
        .registry()
        .reregister(&mut ac.stream, Token(conn_id), wanted)
    {
        warn!(conn_id, error = %e, "failed to update interest");
        return;
    }
    ac.interests = wanted;
}

/// Tear down a connection, firing its close event exactly once. Bytes
/// still pending at this point are dropped; closing stops further events.
fn close_connection(
    conn_id: usize,
    poll: &mut Poll,
    connections: &mut Slab<ActiveConn>,
    reason: CloseReason,
) {
    if let Some(mut ac) = connections.try_remove(conn_id) {
        let _ = poll.registry().deregister(&mut ac.stream);
        if !ac.closed {
            ac.closed = true;
            ac.pipeline.fire_close(reason);
        }
        debug!(conn_id, "connection closed");
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
