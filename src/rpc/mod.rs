// Wire protocol shared by the server and every client process. Each frame is
// a u32 big-endian length followed by UTF-8 JSON; requests and responses are
// correlated by id, and a Subscribe request turns the connection into an
// event stream.

pub mod client;
pub mod codec;

use crate::error::ErrorKind;
use crate::models::SyncOutcome;
use serde::{Deserialize, Serialize};

/// Hard cap on a frame body. Anything larger is a protocol violation and the
/// connection is closed without allocating the body.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

/// Every command the server understands. On the wire this is
/// `{"cmd": "...", "args": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "args")]
pub enum Command {
    Ping,
    GetAccounts,
    GetEmails {
        account: String,
        mailbox: String,
        #[serde(default = "default_limit")]
        limit: u32,
    },
    GetBody {
        account: String,
        mailbox: String,
        uid: u32,
    },
    GetLabels {
        account: String,
    },
    Search {
        account: String,
        mailbox: String,
        query: String,
    },
    Sync {
        account: String,
        mailbox: String,
    },
    MarkRead {
        account: String,
        mailbox: String,
        uid: u32,
    },
    MarkReadMulti {
        account: String,
        mailbox: String,
        uids: Vec<u32>,
    },
    Delete {
        account: String,
        mailbox: String,
        uid: u32,
    },
    DeleteMulti {
        account: String,
        mailbox: String,
        uids: Vec<u32>,
    },
    MoveToTrash {
        account: String,
        mailbox: String,
        uid: u32,
    },
    MoveMultiToTrash {
        account: String,
        mailbox: String,
        uids: Vec<u32>,
    },
    SaveDraft {
        account: String,
        /// Opaque RFC 822 draft bytes, base64-encoded for transport.
        rfc822: String,
    },
    Subscribe,
    RefreshAccounts,
    Shutdown,
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Response {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: &crate::error::Error) -> Self {
        Response {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind: error.kind,
                message: error.message.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// A frame on a subscribed connection. `id` echoes the Subscribe request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub id: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SyncStarted {
        account: String,
        mailbox: String,
    },
    #[serde(rename_all = "camelCase")]
    SyncCompleted {
        account: String,
        mailbox: String,
        added: u64,
        removed: u64,
        flags_changed: u64,
    },
    SyncError {
        account: String,
        mailbox: String,
        error: String,
    },
    /// IDLE-driven hint, emitted before the debounced delta sync runs.
    MailboxChanged {
        account: String,
        mailbox: String,
    },
}

impl Event {
    pub fn sync_completed(account: &str, mailbox: &str, outcome: SyncOutcome) -> Self {
        Event::SyncCompleted {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            added: outcome.added,
            removed: outcome.removed,
            flags_changed: outcome.flags_changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let req = Request {
            id: 7,
            command: Command::GetEmails {
                account: "a@gmail.com".into(),
                mailbox: "INBOX".into(),
                limit: 20,
            },
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["cmd"], "GetEmails");
        assert_eq!(value["args"]["mailbox"], "INBOX");
    }

    #[test]
    fn unit_commands_need_no_args() {
        let req: Request = serde_json::from_str(r#"{"id":1,"cmd":"Ping"}"#).unwrap();
        assert!(matches!(req.command, Command::Ping));
    }

    #[test]
    fn limit_defaults_when_absent() {
        let req: Request = serde_json::from_str(
            r#"{"id":2,"cmd":"GetEmails","args":{"account":"a","mailbox":"INBOX"}}"#,
        )
        .unwrap();
        match req.command {
            Command::GetEmails { limit, .. } => assert_eq!(limit, 50),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn sync_completed_uses_camel_case() {
        let event = Event::SyncCompleted {
            account: "a".into(),
            mailbox: "INBOX".into(),
            added: 3,
            removed: 0,
            flags_changed: 1,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "SyncCompleted");
        assert_eq!(value["flagsChanged"], 1);
    }

    #[test]
    fn error_body_carries_kind() {
        let resp = Response::failure(9, &crate::error::Error::net("gone"));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["kind"], "net");
    }
}
