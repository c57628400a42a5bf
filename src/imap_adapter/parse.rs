// Envelope parsing: IMAP FETCH results into cacheable email rows. Bodies are
// not touched here; they arrive later through the on-demand fetch path.

use super::codec::{decode_bytes_to_string, decode_header, parse_email_date};
use crate::models::Email;

/// Parse a batch of FETCH responses carrying
/// `(UID FLAGS INTERNALDATE RFC822.SIZE ENVELOPE BODYSTRUCTURE
///   BODY[HEADER.FIELDS (REFERENCES)])`.
pub fn parse_envelopes<'a, I>(messages: I) -> Vec<Email>
where
    I: Iterator<Item = &'a imap::types::Fetch<'a>>,
{
    let mut emails = Vec::new();

    for msg in messages {
        let Some(uid) = msg.uid else { continue };
        let Some(envelope) = msg.envelope() else {
            continue;
        };

        let subject = envelope
            .subject
            .as_ref()
            .map(|s| decode_header(&decode_bytes_to_string(s.as_ref())))
            .unwrap_or_default();

        let from = envelope
            .from
            .as_ref()
            .map(|addrs| format_addresses(addrs))
            .unwrap_or_default();
        let reply_to = envelope
            .reply_to
            .as_ref()
            .map(|addrs| format_addresses(addrs))
            .unwrap_or_default();
        let to = envelope
            .to
            .as_ref()
            .map(|addrs| format_addresses(addrs))
            .unwrap_or_default();

        let message_id = envelope
            .message_id
            .as_ref()
            .map(|id| normalize_message_id(&decode_bytes_to_string(id.as_ref())))
            .unwrap_or_default();

        let date = envelope
            .date
            .as_ref()
            .map(|d| decode_bytes_to_string(d.as_ref()))
            .unwrap_or_default();

        let internal_date = msg.internal_date().map(|d| d.timestamp());
        let timestamp = parse_email_date(&date, internal_date);

        let unread = !msg
            .flags()
            .iter()
            .any(|flag| matches!(flag, imap::types::Flag::Seen));

        // BODYSTRUCTURE is only consulted for the attachment hint; real
        // descriptors are extracted when the body is fetched.
        let has_attachments = msg
            .bodystructure()
            .map(bodystructure_has_attachments)
            .unwrap_or(false);

        let references = msg
            .header()
            .map(parse_references_header)
            .unwrap_or_default();

        emails.push(Email {
            uid,
            message_id,
            internal_date: internal_date.unwrap_or(timestamp),
            from,
            reply_to,
            to,
            subject,
            date,
            snippet: String::new(),
            body_html: String::new(),
            unread,
            references,
            has_attachments,
            attachments: Vec::new(),
        });
    }

    emails
}

/// "Name <a@b>" style rendering of an envelope address list.
fn format_addresses(addrs: &[imap_proto::types::Address]) -> String {
    addrs
        .iter()
        .map(|addr| {
            let mailbox =
                decode_bytes_to_string(addr.mailbox.as_ref().map(|m| m.as_ref()).unwrap_or(b""));
            let host = decode_bytes_to_string(addr.host.as_ref().map(|h| h.as_ref()).unwrap_or(b""));
            let email = format!("{}@{}", mailbox, host);
            match addr.name.as_ref() {
                Some(name_bytes) => {
                    let name = decode_header(&decode_bytes_to_string(name_bytes.as_ref()));
                    if name.trim().is_empty() {
                        email
                    } else {
                        format!("{} <{}>", name.trim(), email)
                    }
                }
                None => email,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn normalize_message_id(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '<' || c == '>').to_string()
}

/// Pull message-ids out of a `References:` header section, unfolding
/// continuation lines first.
pub fn parse_references_header(header_bytes: &[u8]) -> Vec<String> {
    let text = decode_bytes_to_string(header_bytes);
    let unfolded = text.replace("\r\n ", " ").replace("\r\n\t", " ");

    for line in unfolded.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("references") {
            continue;
        }
        return value
            .split_whitespace()
            .map(normalize_message_id)
            .filter(|id| !id.is_empty())
            .collect();
    }
    Vec::new()
}

/// The debug rendering of a BODYSTRUCTURE mentions attachment dispositions
/// or filenames whenever parts carry them; that is enough for a listing hint.
fn bodystructure_has_attachments<T: std::fmt::Debug>(body: &T) -> bool {
    let debug_str = format!("{:?}", body).to_lowercase();
    debug_str.contains("attachment") || debug_str.contains("filename")
}
