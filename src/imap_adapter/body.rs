// On-demand body fetch. The full message is pulled once, parsed with
// mail-parser, reduced to a displayable HTML body plus a short snippet, and
// the attachment descriptors are extracted for the cache.

use super::client::ImapSession;
use crate::error::{imap_error, Error, Result};
use crate::models::Attachment;
use mail_parser::MimeHeaders;

pub struct FetchedBody {
    pub body_html: String,
    pub snippet: String,
    pub attachments: Vec<Attachment>,
}

/// Fetch and parse one message body by UID in the currently selected mailbox.
pub fn fetch_body(session: &mut ImapSession, uid: u32) -> Result<FetchedBody> {
    let messages = session
        .uid_fetch(uid.to_string(), "BODY.PEEK[]")
        .map_err(|e| imap_error("UID FETCH body failed", &e))?;

    let message = messages
        .iter()
        .next()
        .ok_or_else(|| Error::proto(format!("no message found for UID {}", uid)))?;

    let raw = message
        .body()
        .ok_or_else(|| Error::proto(format!("fetch for UID {} carried no body", uid)))?;

    parse_body(raw)
}

/// Reduce raw RFC 822 bytes to display form. HTML part preferred; a plain
/// text part is wrapped in <pre>.
pub fn parse_body(raw: &[u8]) -> Result<FetchedBody> {
    let parsed = mail_parser::MessageParser::default()
        .parse(raw)
        .ok_or_else(|| Error::proto("failed to parse message body"))?;

    let text_body = parsed.body_text(0).map(|t| t.to_string());

    let body_html = if let Some(html) = parsed.body_html(0) {
        html.to_string()
    } else if let Some(ref text) = text_body {
        format!("<pre>{}</pre>", html_escape::encode_text(text))
    } else {
        String::new()
    };

    let snippet = generate_snippet(text_body.as_deref(), &body_html);

    let mut attachments = Vec::new();
    for (index, attachment) in parsed.attachments().enumerate() {
        let filename = attachment
            .attachment_name()
            .unwrap_or("unnamed")
            .to_string();
        let content_type = attachment
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        attachments.push(Attachment {
            part_id: (index + 1).to_string(),
            filename,
            content_type,
            size: attachment.contents().len() as i64,
            encoding: transfer_encoding(attachment),
        });
    }

    Ok(FetchedBody {
        body_html,
        snippet,
        attachments,
    })
}

fn transfer_encoding(part: &mail_parser::MessagePart) -> String {
    match part.encoding {
        mail_parser::Encoding::Base64 => "base64".to_string(),
        mail_parser::Encoding::QuotedPrintable => "quoted-printable".to_string(),
        mail_parser::Encoding::None => String::new(),
    }
}

/// First ~200 chars of readable text, whitespace flattened.
fn generate_snippet(text_body: Option<&str>, body_html: &str) -> String {
    let source = match text_body {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => strip_tags(body_html),
    };
    source
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(200)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Cheap tag stripper for snippet purposes only.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_message_becomes_pre_block() {
        let raw = b"From: a@b.com\r\nTo: c@d.com\r\nSubject: hi\r\n\
                    Content-Type: text/plain\r\n\r\nhello there\r\n";
        let body = parse_body(raw).unwrap();
        assert!(body.body_html.starts_with("<pre>"));
        assert_eq!(body.snippet, "hello there");
        assert!(body.attachments.is_empty());
    }

    #[test]
    fn html_part_is_preferred() {
        let raw = b"From: a@b.com\r\nSubject: hi\r\nMIME-Version: 1.0\r\n\
            Content-Type: multipart/alternative; boundary=\"b1\"\r\n\r\n\
            --b1\r\nContent-Type: text/plain\r\n\r\nplain version\r\n\
            --b1\r\nContent-Type: text/html\r\n\r\n<p>html version</p>\r\n\
            --b1--\r\n";
        let body = parse_body(raw).unwrap();
        assert!(body.body_html.contains("html version"));
        assert_eq!(body.snippet, "plain version");
    }

    #[test]
    fn snippet_is_capped_and_flattened() {
        let long = "word ".repeat(100);
        let raw = format!(
            "From: a@b.com\r\nSubject: s\r\nContent-Type: text/plain\r\n\r\n{}",
            long
        );
        let body = parse_body(raw.as_bytes()).unwrap();
        assert!(body.snippet.chars().count() <= 200);
        assert!(!body.snippet.contains('\n'));
    }

    #[test]
    fn attachment_descriptors_are_extracted() {
        let raw = b"From: a@b.com\r\nSubject: att\r\nMIME-Version: 1.0\r\n\
            Content-Type: multipart/mixed; boundary=\"b2\"\r\n\r\n\
            --b2\r\nContent-Type: text/plain\r\n\r\nsee attached\r\n\
            --b2\r\nContent-Type: application/pdf; name=\"doc.pdf\"\r\n\
            Content-Disposition: attachment; filename=\"doc.pdf\"\r\n\
            Content-Transfer-Encoding: base64\r\n\r\nJVBERi0=\r\n\
            --b2--\r\n";
        let body = parse_body(raw).unwrap();
        assert_eq!(body.attachments.len(), 1);
        let att = &body.attachments[0];
        assert_eq!(att.filename, "doc.pdf");
        assert_eq!(att.content_type, "application/pdf");
        assert_eq!(att.part_id, "1");
        assert!(att.size > 0);
    }
}
