// RFC 2047 header decoding and date parsing helpers for envelope data.

use base64::Engine;
use chrono::{DateTime, Utc};
use encoding_rs::Encoding;

/// Decode RFC 2047 encoded words (`=?charset?Q|B?text?=`). Text outside
/// encoded words passes through untouched; undecodable words are kept
/// verbatim.
pub fn decode_header(encoded: &str) -> String {
    if !encoded.contains("=?") {
        return encoded.to_string();
    }

    let mut result = String::new();
    let mut remaining = encoded;

    while let Some(start_pos) = remaining.find("=?") {
        result.push_str(&remaining[..start_pos]);
        let word = &remaining[start_pos..];

        match decode_encoded_word(word) {
            Some((decoded, consumed)) => {
                result.push_str(&decoded);
                remaining = &word[consumed..];
                // Whitespace between adjacent encoded words is ignored.
                if remaining.starts_with(' ') && remaining[1..].starts_with("=?") {
                    remaining = &remaining[1..];
                }
            }
            None => {
                result.push_str("=?");
                remaining = &word[2..];
            }
        }
    }

    result.push_str(remaining);
    result
}

/// Try to decode one encoded word at the start of `s`. Returns the decoded
/// text and how many bytes of `s` the word covered.
fn decode_encoded_word(s: &str) -> Option<(String, usize)> {
    let inner = s.strip_prefix("=?")?;
    let charset_end = inner.find('?')?;
    let charset = &inner[..charset_end];
    let after_charset = &inner[charset_end + 1..];
    let encoding_end = after_charset.find('?')?;
    let encoding = &after_charset[..encoding_end];
    let after_encoding = &after_charset[encoding_end + 1..];
    let text_end = after_encoding.find("?=")?;
    let encoded_text = &after_encoding[..text_end];

    let consumed = 2 + charset.len() + 1 + encoding.len() + 1 + encoded_text.len() + 2;

    let bytes = match encoding.to_ascii_uppercase().as_str() {
        // In Q encoding an underscore stands for a space.
        "Q" => quoted_printable::decode(
            encoded_text.replace('_', " "),
            quoted_printable::ParseMode::Robust,
        )
        .ok()?,
        "B" => base64::engine::general_purpose::STANDARD
            .decode(encoded_text)
            .ok()?,
        _ => return None,
    };

    let decoded = match Encoding::for_label(charset.as_bytes()) {
        Some(enc) => {
            let (cow, _, _) = enc.decode(&bytes);
            cow.into_owned()
        }
        None => String::from_utf8(bytes).ok()?,
    };

    Some((decoded, consumed))
}

/// Lossy UTF-8 view of raw envelope bytes.
pub fn decode_bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).to_string(),
    }
}

/// Parse an email Date header to unix seconds, falling back to the server's
/// INTERNALDATE and finally to now. INTERNALDATE is more trustworthy than
/// whatever the sender put in Date, but listing stability wants Date first.
pub fn parse_email_date(date_str: &str, internal_date: Option<i64>) -> i64 {
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return dt.timestamp();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(date_str) {
        return dt.timestamp();
    }
    if let Some(ts) = internal_date {
        return ts;
    }
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_headers_pass_through() {
        assert_eq!(decode_header("Hello world"), "Hello world");
    }

    #[test]
    fn decodes_utf8_base64_word() {
        // "Héllo" in UTF-8 base64
        assert_eq!(decode_header("=?UTF-8?B?SMOpbGxv?="), "Héllo");
    }

    #[test]
    fn decodes_q_encoding_with_underscores() {
        assert_eq!(decode_header("=?UTF-8?Q?Hello_world?="), "Hello world");
        assert_eq!(decode_header("=?ISO-8859-1?Q?caf=E9?="), "café");
    }

    #[test]
    fn adjacent_words_drop_separating_space() {
        assert_eq!(
            decode_header("=?UTF-8?Q?Hello?= =?UTF-8?Q?World?="),
            "HelloWorld"
        );
    }

    #[test]
    fn invalid_word_is_kept_verbatim() {
        assert_eq!(decode_header("=?bogus"), "=?bogus");
    }

    #[test]
    fn mixed_text_and_encoded_word() {
        assert_eq!(
            decode_header("Re: =?UTF-8?B?SMOpbGxv?= again"),
            "Re: Héllo again"
        );
    }

    #[test]
    fn date_parsing_falls_back_to_internal_date() {
        let ts = parse_email_date("Mon, 15 Jan 2024 14:30:00 +0000", None);
        assert_eq!(ts, 1705329000);
        assert_eq!(parse_email_date("garbage", Some(1700000000)), 1700000000);
    }
}
