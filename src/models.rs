use serde::{Deserialize, Serialize};

/// Mail provider tag from the account store. Provider-specific quirks
/// (role-name tables, Gmail raw search) key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gmail,
    Yahoo,
    Qq,
    ImapGeneric,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Yahoo => "yahoo",
            Provider::Qq => "qq",
            Provider::ImapGeneric => "imap_generic",
        }
    }

    /// Default IMAP host for providers that have a well-known one.
    pub fn default_host(self) -> Option<&'static str> {
        match self {
            Provider::Gmail => Some("imap.gmail.com"),
            Provider::Yahoo => Some("imap.mail.yahoo.com"),
            Provider::Qq => Some("imap.qq.com"),
            Provider::ImapGeneric => None,
        }
    }
}

/// One entry of the on-disk account store. Identity is `email`; the server
/// only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub provider: Provider,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    pub password: String,
}

/// Canonical mailbox roles the server resolves per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxRole {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Junk,
}

impl MailboxRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MailboxRole::Inbox => "inbox",
            MailboxRole::Sent => "sent",
            MailboxRole::Drafts => "drafts",
            MailboxRole::Trash => "trash",
            MailboxRole::Junk => "junk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbox" => Some(MailboxRole::Inbox),
            "sent" => Some(MailboxRole::Sent),
            "drafts" => Some(MailboxRole::Drafts),
            "trash" => Some(MailboxRole::Trash),
            "junk" => Some(MailboxRole::Junk),
            _ => None,
        }
    }
}

/// A mailbox as returned by LIST. `name` is the raw (UTF-7 encoded) name used
/// for IMAP operations; `display_name` is decoded for humans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub name: String,
    pub display_name: String,
    pub role: Option<MailboxRole>,
}

/// Attachment descriptor. Contents stay on the server; only the metadata
/// needed to render and later download a part is cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub part_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    #[serde(default)]
    pub encoding: String,
}

/// A cached email. The body is present only once the message has been opened;
/// until then the row carries envelope data plus an empty snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    pub uid: u32,
    pub message_id: String,
    /// Server receive time, unix seconds. Listing order key.
    pub internal_date: i64,
    pub from: String,
    #[serde(default)]
    pub reply_to: String,
    pub to: String,
    pub subject: String,
    /// Raw RFC 2822 Date header.
    pub date: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub body_html: String,
    #[serde(default)]
    pub unread: bool,
    /// References header, message-ids in order.
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Per-mailbox sync state (UIDVALIDITY epoch, CONDSTORE high-water mark).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxState {
    pub account: String,
    pub mailbox: String,
    pub uid_validity: u32,
    /// 0 when the server lacks CONDSTORE.
    pub highest_modseq: u64,
    pub last_sync_unix: i64,
}

/// A persistent per-account sync lock row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLock {
    pub account: String,
    pub pid: u32,
    pub start_token: String,
    pub acquired_unix: i64,
}

/// What a sync run did, reported in `SyncCompleted` events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub added: u64,
    pub removed: u64,
    pub flags_changed: u64,
}

/// Aggregated per-account status for `GetAccounts` / `server status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    pub email: String,
    pub provider: Provider,
    pub email_count: u64,
    pub syncing: bool,
    pub last_sync_unix: i64,
}
