// Typed operations over a blocking IMAP session. Callers run these inside
// spawn_blocking; each function issues complete commands and leaves the
// session usable.

use super::client::ImapSession;
use super::parse::parse_envelopes;
use super::provider::ProviderQuirks;
use super::SelectInfo;
use crate::error::{imap_error, Error, Result};
use crate::models::{Email, Mailbox, MailboxRole};
use regex::Regex;
use std::collections::HashSet;

/// Fetch items for the envelope pass. Bodies stay on the server.
const ENVELOPE_ITEMS: &str = "(UID FLAGS INTERNALDATE RFC822.SIZE ENVELOPE BODYSTRUCTURE BODY.PEEK[HEADER.FIELDS (REFERENCES)])";

/// UID FETCH batch size; large sets overwhelm some servers.
const FETCH_BATCH: usize = 100;

/// SELECT a mailbox and capture its state. HIGHESTMODSEQ comes from a STATUS
/// round-trip so the adapter does not depend on SELECT response parsing for
/// CONDSTORE data.
pub fn select(session: &mut ImapSession, mailbox: &str) -> Result<SelectInfo> {
    let mb = session
        .select(mailbox)
        .map_err(|e| map_select_error(mailbox, &e))?;

    let mut info = SelectInfo {
        uid_validity: mb.uid_validity.unwrap_or(0),
        uid_next: mb.uid_next.unwrap_or(0),
        exists: mb.exists,
        highest_modseq: 0,
    };
    info.highest_modseq = status_highest_modseq(session, mailbox).unwrap_or(0);
    Ok(info)
}

fn map_select_error(mailbox: &str, e: &imap::Error) -> Error {
    let err = imap_error(&format!("cannot select mailbox '{}'", mailbox), e);
    // Servers word "no such mailbox" inconsistently; a NO reply to SELECT is
    // almost always exactly that.
    if matches!(e, imap::Error::No(_)) && err.kind == crate::error::ErrorKind::Proto {
        Error::no_such_mailbox(err.message)
    } else {
        err
    }
}

/// STATUS (HIGHESTMODSEQ) for one mailbox; 0 when the server lacks CONDSTORE.
fn status_highest_modseq(session: &mut ImapSession, mailbox: &str) -> Result<u64> {
    let command = format!("STATUS {} (HIGHESTMODSEQ)", quote_mailbox(mailbox));
    let response = session
        .run_command_and_read_response(&command)
        .map_err(|e| imap_error("STATUS failed", &e))?;
    let text = String::from_utf8_lossy(&response);
    let re = Regex::new(r"HIGHESTMODSEQ\s+(\d+)").expect("static regex");
    Ok(re
        .captures(&text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0))
}

/// Envelope sync pass: UIDs from `SEARCH SINCE <date>`, newest `cap_max`
/// kept, fetched in batches.
pub fn fetch_since(
    session: &mut ImapSession,
    mailbox_exists: u32,
    since_days: i64,
    cap_max: usize,
) -> Result<Vec<Email>> {
    if mailbox_exists == 0 {
        return Ok(Vec::new());
    }

    let since = chrono::Utc::now() - chrono::Duration::days(since_days);
    let query = format!("SINCE {}", since.format("%d-%b-%Y"));
    let mut uids: Vec<u32> = session
        .uid_search(&query)
        .map_err(|e| imap_error("SEARCH SINCE failed", &e))?
        .into_iter()
        .collect();

    uids.sort_unstable();
    if uids.len() > cap_max {
        let start = uids.len() - cap_max;
        uids.drain(..start);
    }

    fetch_envelopes(session, &uids)
}

/// Fetch envelope rows for an explicit UID list.
pub fn fetch_envelopes(session: &mut ImapSession, uids: &[u32]) -> Result<Vec<Email>> {
    let mut emails = Vec::new();
    for chunk in uids.chunks(FETCH_BATCH) {
        let uid_set = join_uids(chunk);
        let messages = session
            .uid_fetch(&uid_set, ENVELOPE_ITEMS)
            .map_err(|e| imap_error("UID FETCH failed", &e))?;
        emails.extend(parse_envelopes(messages.iter()));
    }
    Ok(emails)
}

/// Flag reconciliation: (uid, unread) for every UID still present.
pub fn fetch_flags(session: &mut ImapSession, uids: &[u32]) -> Result<Vec<(u32, bool)>> {
    let mut flags = Vec::new();
    for chunk in uids.chunks(FETCH_BATCH) {
        let uid_set = join_uids(chunk);
        let messages = session
            .uid_fetch(&uid_set, "(UID FLAGS)")
            .map_err(|e| imap_error("UID FETCH FLAGS failed", &e))?;
        for msg in messages.iter() {
            if let Some(uid) = msg.uid {
                let unread = !msg
                    .flags()
                    .iter()
                    .any(|f| matches!(f, imap::types::Flag::Seen));
                flags.push((uid, unread));
            }
        }
    }
    Ok(flags)
}

/// CONDSTORE delta: everything whose mod-sequence moved past `modseq`.
/// Returns (uid, unread) pairs; new UIDs appear here too since their
/// mod-sequence is above any older high-water mark.
pub fn fetch_changed_since(
    session: &mut ImapSession,
    modseq: u64,
) -> Result<Vec<(u32, bool)>> {
    let query = format!("(UID FLAGS) (CHANGEDSINCE {})", modseq);
    let messages = session
        .uid_fetch("1:*", &query)
        .map_err(|e| imap_error("UID FETCH CHANGEDSINCE failed", &e))?;

    let mut changed = Vec::new();
    for msg in messages.iter() {
        if let Some(uid) = msg.uid {
            let unread = !msg
                .flags()
                .iter()
                .any(|f| matches!(f, imap::types::Flag::Seen));
            changed.push((uid, unread));
        }
    }
    Ok(changed)
}

/// Every UID currently in the selected mailbox. Used for expunge detection.
pub fn all_uids(session: &mut ImapSession) -> Result<HashSet<u32>> {
    Ok(session
        .uid_search("ALL")
        .map_err(|e| imap_error("SEARCH ALL failed", &e))?
        .into_iter()
        .collect())
}

/// Provider-aware search; returns matching UIDs.
pub fn search(
    session: &mut ImapSession,
    quirks: &dyn ProviderQuirks,
    query: &str,
) -> Result<Vec<u32>> {
    let server_query = quirks.search_query(query);
    let mut uids: Vec<u32> = session
        .uid_search(&server_query)
        .map_err(|e| imap_error("SEARCH failed", &e))?
        .into_iter()
        .collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
}

#[derive(Debug, Clone, Copy)]
pub enum FlagOp {
    Add,
    Remove,
    Set,
}

/// STORE flags on a UID set.
pub fn set_flags(
    session: &mut ImapSession,
    uids: &[u32],
    flag: &str,
    op: FlagOp,
) -> Result<()> {
    if uids.is_empty() {
        return Ok(());
    }
    let prefix = match op {
        FlagOp::Add => "+FLAGS",
        FlagOp::Remove => "-FLAGS",
        FlagOp::Set => "FLAGS",
    };
    let command = format!("{} ({})", prefix, flag);
    session
        .uid_store(join_uids(uids), &command)
        .map_err(|e| imap_error("UID STORE failed", &e))?;
    Ok(())
}

/// Move UIDs to another mailbox: MOVE when advertised, else
/// COPY + \Deleted + EXPUNGE scoped to the moved UIDs.
pub fn move_uids(session: &mut ImapSession, uids: &[u32], dest: &str) -> Result<()> {
    if uids.is_empty() {
        return Ok(());
    }
    let uid_set = join_uids(uids);

    let caps = session
        .capabilities()
        .map_err(|e| imap_error("CAPABILITY failed", &e))?;

    if caps.has_str("MOVE") {
        session
            .uid_mv(&uid_set, dest)
            .map_err(|e| imap_error("UID MOVE failed", &e))?;
        return Ok(());
    }

    session
        .uid_copy(&uid_set, dest)
        .map_err(|e| imap_error("UID COPY failed", &e))?;
    session
        .uid_store(&uid_set, "+FLAGS (\\Deleted)")
        .map_err(|e| imap_error("UID STORE \\Deleted failed", &e))?;
    expunge_uids(session, &caps, &uid_set)
}

/// Permanently delete UIDs from the selected mailbox.
pub fn delete_uids(session: &mut ImapSession, uids: &[u32]) -> Result<()> {
    if uids.is_empty() {
        return Ok(());
    }
    let uid_set = join_uids(uids);
    let caps = session
        .capabilities()
        .map_err(|e| imap_error("CAPABILITY failed", &e))?;
    session
        .uid_store(&uid_set, "+FLAGS (\\Deleted)")
        .map_err(|e| imap_error("UID STORE \\Deleted failed", &e))?;
    expunge_uids(session, &caps, &uid_set)
}

/// UID EXPUNGE keeps the blast radius to our own UIDs; plain EXPUNGE is the
/// fallback when UIDPLUS is missing.
fn expunge_uids(
    session: &mut ImapSession,
    caps: &imap::types::Capabilities,
    uid_set: &str,
) -> Result<()> {
    if caps.has_str("UIDPLUS") {
        session
            .uid_expunge(uid_set)
            .map_err(|e| imap_error("UID EXPUNGE failed", &e))?;
    } else {
        session
            .expunge()
            .map_err(|e| imap_error("EXPUNGE failed", &e))?;
    }
    Ok(())
}

/// APPEND draft bytes with \Draft set; the APPENDUID-assigned UID comes back
/// when the server supports UIDPLUS.
pub fn append_draft(
    session: &mut ImapSession,
    mailbox: &str,
    rfc822: &[u8],
) -> Result<Option<u32>> {
    let appended = session
        .append(mailbox, rfc822)
        .flag(imap::types::Flag::Draft)
        .finish()
        .map_err(|e| imap_error("APPEND failed", &e))?;

    let uid = appended.uids.as_ref().and_then(|uids| {
        uids.iter().next().map(|member| match member {
            imap_proto::types::UidSetMember::Uid(uid) => *uid,
            imap_proto::types::UidSetMember::UidRange(range) => *range.start(),
        })
    });
    Ok(uid)
}

/// LIST every mailbox with its resolved role. RFC 6154 attributes win;
/// provider name tables fill the gaps.
pub fn list_mailboxes(
    session: &mut ImapSession,
    quirks: &dyn ProviderQuirks,
) -> Result<Vec<Mailbox>> {
    let names = session
        .list(Some(""), Some("*"))
        .map_err(|e| imap_error("LIST failed", &e))?;

    let mut mailboxes = Vec::new();
    for name in names.iter() {
        let raw_name = name.name().to_string();
        let display_name = utf7_imap::decode_utf7_imap(raw_name.clone());
        let attrs = format!("{:?}", name.attributes());

        if attrs.contains("NoSelect") {
            continue;
        }

        let role = role_from_attributes(&attrs)
            .or_else(|| role_from_name(quirks, &raw_name, &display_name));

        mailboxes.push(Mailbox {
            name: raw_name,
            display_name,
            role,
        });
    }
    Ok(mailboxes)
}

/// Resolve one canonical role to a raw mailbox name.
pub fn resolve_role(
    session: &mut ImapSession,
    quirks: &dyn ProviderQuirks,
    role: MailboxRole,
) -> Result<String> {
    let mailboxes = list_mailboxes(session, quirks)?;
    mailboxes
        .into_iter()
        .find(|m| m.role == Some(role))
        .map(|m| m.name)
        .ok_or_else(|| {
            Error::no_such_mailbox(format!("no mailbox with the {} role", role.as_str()))
        })
}

fn role_from_attributes(attrs: &str) -> Option<MailboxRole> {
    // The debug rendering of LIST attributes carries the special-use names
    // (\Sent, \Drafts, ...) verbatim.
    if attrs.contains("Sent") {
        Some(MailboxRole::Sent)
    } else if attrs.contains("Drafts") {
        Some(MailboxRole::Drafts)
    } else if attrs.contains("Trash") {
        Some(MailboxRole::Trash)
    } else if attrs.contains("Junk") || attrs.contains("Spam") {
        Some(MailboxRole::Junk)
    } else {
        None
    }
}

fn role_from_name(
    quirks: &dyn ProviderQuirks,
    raw_name: &str,
    display_name: &str,
) -> Option<MailboxRole> {
    if raw_name.eq_ignore_ascii_case("INBOX") {
        return Some(MailboxRole::Inbox);
    }
    for role in [
        MailboxRole::Sent,
        MailboxRole::Drafts,
        MailboxRole::Trash,
        MailboxRole::Junk,
    ] {
        for candidate in quirks.role_candidates(role) {
            if raw_name.eq_ignore_ascii_case(candidate)
                || display_name.eq_ignore_ascii_case(candidate)
            {
                return Some(role);
            }
        }
    }
    None
}

fn join_uids(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn quote_mailbox(mailbox: &str) -> String {
    format!("\"{}\"", mailbox.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_sets_are_comma_joined() {
        assert_eq!(join_uids(&[1, 2, 10]), "1,2,10");
    }

    #[test]
    fn role_attribute_detection() {
        assert_eq!(
            role_from_attributes("[Custom(\"\\\\Trash\")]"),
            Some(MailboxRole::Trash)
        );
        assert_eq!(role_from_attributes("[Marked]"), None);
    }

    #[test]
    fn role_name_fallback_uses_provider_table() {
        let q = super::super::provider::quirks(crate::models::Provider::Gmail);
        assert_eq!(
            role_from_name(q, "[Gmail]/Sent Mail", "[Gmail]/Sent Mail"),
            Some(MailboxRole::Sent)
        );
        assert_eq!(role_from_name(q, "INBOX", "INBOX"), Some(MailboxRole::Inbox));
        assert_eq!(role_from_name(q, "Receipts", "Receipts"), None);
    }

    #[test]
    fn mailbox_names_are_quoted_for_status() {
        assert_eq!(quote_mailbox("INBOX"), "\"INBOX\"");
        assert_eq!(quote_mailbox("a\"b"), "\"a\\\"b\"");
    }
}
