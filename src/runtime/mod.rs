//! Reactor runtime bridging non-blocking sockets to pipelines.
//!
//! One worker thread per core (or `workers` from the config), each running
//! its own mio poll loop over a SO_REUSEPORT listener, so the kernel load
//! balances accepts. A connection lives on exactly one worker for its whole
//! life: its pipeline, handlers, and buffers are mutated only there, which
//! is what lets the core carry no locks. Handlers must not block; a stalled
//! callback stalls every connection sharing the worker.

mod event_loop;

use crate::pipeline::Pipeline;
use std::sync::Arc;

/// Per-connection setup callback: installs the decoder and business
/// handlers on a freshly built pipeline before any event fires.
pub type ConnInitializer = Arc<dyn Fn(&mut Pipeline) + Send + Sync>;

pub use event_loop::run;
