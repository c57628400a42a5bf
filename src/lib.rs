//! Maild - a background mail sync server.
//!
//! Aggregates several remote IMAP mailboxes into one local SQLite cache and
//! serves short-lived client processes over a length-framed JSON protocol on
//! a Unix-domain socket. The cache is kept live through periodic polls and
//! per-account IMAP IDLE watchers.

pub mod accounts;
pub mod cache;
pub mod db;
pub mod error;
pub mod imap_adapter;
pub mod logger;
pub mod models;
pub mod paths;
pub mod pidfile;
pub mod rpc;
pub mod server;
pub mod sync;

pub use error::{Error, ErrorKind, Result};

/// Version baked into the pidfile and reported over RPC.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
