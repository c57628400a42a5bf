// Provider-aware IMAP adapter. Everything here runs on blocking connections
// driven through `tokio::task::spawn_blocking` by the sync layer; one
// outstanding command per connection.

pub mod body;
pub mod client;
pub mod codec;
pub mod idle;
pub mod ops;
pub mod parse;
pub mod provider;

pub use client::{connect_and_login, connect_with_retry, ImapSession};

/// State captured by SELECT (plus a STATUS round-trip for the CONDSTORE
/// high-water mark).
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectInfo {
    pub uid_validity: u32,
    pub uid_next: u32,
    pub exists: u32,
    /// 0 when the server lacks CONDSTORE.
    pub highest_modseq: u64,
}

/// An unsolicited change seen by the IDLE watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleNotice {
    Exists(u32),
    Expunge(u32),
    Fetch(u32),
}
