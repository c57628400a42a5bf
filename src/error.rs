// Error taxonomy shared by the server, syncers, and RPC layer.
// Every failure carries a machine-readable kind so clients can switch on it
// without parsing text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure; retryable.
    Net,
    /// Credentials rejected; account pauses until `RefreshAccounts`.
    Auth,
    /// Malformed IMAP response; connection reset, retried once.
    Proto,
    NoSuchMailbox,
    /// Quota or throttle; retried with a long backoff.
    ServerBusy,
    CacheCorrupt,
    BadAccounts,
    BadRequest,
    Timeout,
    Shutdown,
    /// No such process when resolving a start token.
    ProcessGone,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Net => "net",
            ErrorKind::Auth => "auth",
            ErrorKind::Proto => "proto",
            ErrorKind::NoSuchMailbox => "no_such_mailbox",
            ErrorKind::ServerBusy => "server_busy",
            ErrorKind::CacheCorrupt => "cache_corrupt",
            ErrorKind::BadAccounts => "bad_accounts",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::ProcessGone => "process_gone",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn net(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Net, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Auth, message)
    }

    pub fn proto(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Proto, message)
    }

    pub fn no_such_mailbox(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::NoSuchMailbox, message)
    }

    pub fn server_busy(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::ServerBusy, message)
    }

    pub fn cache_corrupt(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::CacheCorrupt, message)
    }

    pub fn bad_accounts(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::BadAccounts, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::BadRequest, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Timeout, message)
    }

    pub fn shutdown(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Shutdown, message)
    }

    pub fn process_gone(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::ProcessGone, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::net(format!("I/O error: {}", e))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::cache_corrupt(format!("cache error: {}", e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::bad_request(format!("invalid JSON: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Map an `imap` crate error onto the taxonomy. LOGIN rejections come back as
/// `NO` responses from the server, transport problems as Io/ConnectionLost.
/// Server `NO` text is classified by content since response codes vary wildly
/// across providers.
pub fn imap_error(context: &str, e: &imap::Error) -> Error {
    let message = format!("{}: {}", context, e);
    match e {
        imap::Error::Io(_) | imap::Error::ConnectionLost => Error::net(message),
        imap::Error::No(_) => {
            let lower = message.to_lowercase();
            if lower.contains("auth") || lower.contains("login") || lower.contains("password") {
                Error::auth(message)
            } else if lower.contains("nonexistent")
                || lower.contains("no such mailbox")
                || lower.contains("unknown mailbox")
                || lower.contains("doesn't exist")
            {
                Error::no_such_mailbox(message)
            } else if lower.contains("throttl")
                || lower.contains("quota")
                || lower.contains("too many")
                || lower.contains("overquota")
            {
                Error::server_busy(message)
            } else {
                Error::proto(message)
            }
        }
        imap::Error::Bad(_) | imap::Error::Parse(_) => Error::proto(message),
        _ => {
            // TLS setup and handshake failures land here; they are transport
            // problems from the caller's point of view.
            let lower = message.to_lowercase();
            if lower.contains("tls") || lower.contains("handshake") || lower.contains("connect") {
                Error::net(message)
            } else {
                Error::proto(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ErrorKind::Net.as_str(), "net");
        assert_eq!(ErrorKind::NoSuchMailbox.as_str(), "no_such_mailbox");
        assert_eq!(ErrorKind::BadAccounts.as_str(), "bad_accounts");
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ServerBusy).unwrap();
        assert_eq!(json, "\"server_busy\"");
        let back: ErrorKind = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(back, ErrorKind::Timeout);
    }
}
