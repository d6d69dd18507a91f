//! Length-prefixed command framing over per-connection handler pipelines.
//!
//! The core pieces, leaf to root:
//! - [`buffer`]: growable byte buffer with explicit read/write cursors,
//!   parameterized by a byte-order strategy
//! - [`pipeline`]: per-connection ordered chain of inbound/outbound
//!   handlers with directional, explicitly forwarded event propagation
//! - [`codec`]: the length-prefixed command frame format and the
//!   byte-to-message accumulation handler hosting any [`codec::Decoder`]
//! - [`dispatch`]: the request/response service contract and a
//!   command-keyed dispatcher
//! - [`runtime`]: the multi-worker mio reactor bridging sockets to
//!   pipelines
//!
//! Connections are partitioned across worker threads and never migrate;
//! everything a connection owns is mutated on its worker only, so the core
//! carries no locks and handlers must never block.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod conn;
pub mod context;
pub mod dispatch;
pub mod pipeline;
pub mod runtime;
