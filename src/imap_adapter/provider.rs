// Provider quirks. Everything that differs between mail providers lives
// behind this trait so the sync engine stays provider-agnostic: canonical
// role names, and how search queries reach the server.

use crate::models::{MailboxRole, Provider};
use chrono::Utc;

pub trait ProviderQuirks: Send + Sync {
    /// Candidate raw mailbox names for a canonical role, most specific
    /// first. Used when RFC 6154 attributes are absent.
    fn role_candidates(&self, role: MailboxRole) -> &'static [&'static str];

    /// Build the server-side SEARCH query for a user query string.
    fn search_query(&self, query: &str) -> String {
        translate_query(query)
    }
}

struct Gmail;
struct Yahoo;
struct Qq;
struct Generic;

pub fn quirks(provider: Provider) -> &'static dyn ProviderQuirks {
    match provider {
        Provider::Gmail => &Gmail,
        Provider::Yahoo => &Yahoo,
        Provider::Qq => &Qq,
        Provider::ImapGeneric => &Generic,
    }
}

impl ProviderQuirks for Gmail {
    fn role_candidates(&self, role: MailboxRole) -> &'static [&'static str] {
        match role {
            MailboxRole::Inbox => &["INBOX"],
            MailboxRole::Sent => &["[Gmail]/Sent Mail", "Sent"],
            MailboxRole::Drafts => &["[Gmail]/Drafts", "Drafts"],
            MailboxRole::Trash => &["[Gmail]/Trash", "[Gmail]/Bin", "Trash"],
            MailboxRole::Junk => &["[Gmail]/Spam", "Junk"],
        }
    }

    /// Gmail interprets `from:`, `has:attachment`, etc. itself via X-GM-RAW.
    fn search_query(&self, query: &str) -> String {
        format!("X-GM-RAW {}", quote_atom(query))
    }
}

impl ProviderQuirks for Yahoo {
    fn role_candidates(&self, role: MailboxRole) -> &'static [&'static str] {
        match role {
            MailboxRole::Inbox => &["INBOX"],
            MailboxRole::Sent => &["Sent", "Sent Items"],
            MailboxRole::Drafts => &["Draft", "Drafts"],
            MailboxRole::Trash => &["Trash", "Deleted Items"],
            MailboxRole::Junk => &["Bulk Mail", "Junk", "Spam"],
        }
    }
}

impl ProviderQuirks for Qq {
    fn role_candidates(&self, role: MailboxRole) -> &'static [&'static str] {
        match role {
            MailboxRole::Inbox => &["INBOX"],
            MailboxRole::Sent => &["Sent Messages", "Sent"],
            MailboxRole::Drafts => &["Drafts"],
            MailboxRole::Trash => &["Deleted Messages", "Trash"],
            MailboxRole::Junk => &["Junk"],
        }
    }
}

impl ProviderQuirks for Generic {
    fn role_candidates(&self, role: MailboxRole) -> &'static [&'static str] {
        match role {
            MailboxRole::Inbox => &["INBOX"],
            MailboxRole::Sent => &["Sent", "Sent Items", "Sent Messages", "INBOX.Sent"],
            MailboxRole::Drafts => &["Drafts", "Draft", "INBOX.Drafts"],
            MailboxRole::Trash => &[
                "Trash",
                "Deleted",
                "Deleted Items",
                "Deleted Messages",
                "INBOX.Trash",
            ],
            MailboxRole::Junk => &["Junk", "Spam", "INBOX.Junk"],
        }
    }
}

/// Translate the recognised query subset into IMAP SEARCH terms. Tokens:
/// `from:`, `to:`, `subject:`, `is:unread`, `has:attachment`,
/// `newer_than:Nd`, `older_than:Nd`; anything else becomes a TEXT term.
pub fn translate_query(query: &str) -> String {
    let mut terms = Vec::new();

    for token in query.split_whitespace() {
        match token.split_once(':') {
            Some(("from", value)) if !value.is_empty() => {
                terms.push(format!("FROM {}", quote_atom(value)));
            }
            Some(("to", value)) if !value.is_empty() => {
                terms.push(format!("TO {}", quote_atom(value)));
            }
            Some(("subject", value)) if !value.is_empty() => {
                terms.push(format!("SUBJECT {}", quote_atom(value)));
            }
            Some(("is", "unread")) => terms.push("UNSEEN".to_string()),
            Some(("is", "read")) => terms.push("SEEN".to_string()),
            // No IMAP term for attachments; multipart/mixed is the usual
            // proxy.
            Some(("has", "attachment")) => {
                terms.push("HEADER Content-Type \"multipart/mixed\"".to_string());
            }
            Some(("newer_than", value)) => {
                if let Some(date) = days_ago(value) {
                    terms.push(format!("SINCE {}", date));
                } else {
                    terms.push(format!("TEXT {}", quote_atom(token)));
                }
            }
            Some(("older_than", value)) => {
                if let Some(date) = days_ago(value) {
                    terms.push(format!("BEFORE {}", date));
                } else {
                    terms.push(format!("TEXT {}", quote_atom(token)));
                }
            }
            // Unknown key:value tokens degrade to a text search.
            Some(_) => terms.push(format!("TEXT {}", quote_atom(token))),
            None => terms.push(format!("TEXT {}", quote_atom(token))),
        }
    }

    if terms.is_empty() {
        "ALL".to_string()
    } else {
        terms.join(" ")
    }
}

/// `"3d"` → IMAP date string three days back.
fn days_ago(value: &str) -> Option<String> {
    let days: i64 = value.strip_suffix('d')?.parse().ok()?;
    let date = Utc::now() - chrono::Duration::days(days);
    Some(date.format("%d-%b-%Y").to_string())
}

/// Quote a search value; IMAP quoted strings escape backslash and quote.
fn quote_atom(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gmail_forwards_raw_query() {
        let q = quirks(Provider::Gmail).search_query("from:bob has:attachment");
        assert_eq!(q, "X-GM-RAW \"from:bob has:attachment\"");
    }

    #[test]
    fn generic_translates_known_tokens() {
        let q = quirks(Provider::ImapGeneric).search_query("from:bob is:unread report");
        assert_eq!(q, "FROM \"bob\" UNSEEN TEXT \"report\"");
    }

    #[test]
    fn unknown_token_degrades_to_text() {
        assert_eq!(translate_query("label:work"), "TEXT \"label:work\"");
    }

    #[test]
    fn empty_query_is_all() {
        assert_eq!(translate_query("   "), "ALL");
    }

    #[test]
    fn newer_than_becomes_since() {
        let q = translate_query("newer_than:7d");
        assert!(q.starts_with("SINCE "), "got {:?}", q);
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(translate_query("subject:\"hi\""), "SUBJECT \"\\\"hi\\\"\"");
    }

    #[test]
    fn trash_candidates_cover_gmail_and_generic() {
        assert!(quirks(Provider::Gmail)
            .role_candidates(MailboxRole::Trash)
            .contains(&"[Gmail]/Trash"));
        assert!(quirks(Provider::ImapGeneric)
            .role_candidates(MailboxRole::Trash)
            .contains(&"Trash"));
    }
}
