// IMAP connection setup using the imap 3.0.0 ClientBuilder API.

use crate::error::{imap_error, Error, Result};
use crate::models::Account;
use std::time::Duration;

pub type ImapSession = imap::Session<Box<dyn imap::ImapConnection>>;

/// Connect and log in. TLS is mandatory unless the account explicitly turned
/// it off (local test servers only).
pub fn connect_and_login(account: &Account) -> Result<ImapSession> {
    let mode = if account.tls {
        imap::ConnectionMode::Tls
    } else {
        imap::ConnectionMode::Plaintext
    };

    tracing::debug!(
        host = %account.host,
        port = account.port,
        tls = account.tls,
        "Connecting to IMAP server"
    );

    let client = imap::ClientBuilder::new(account.host.as_str(), account.port)
        .mode(mode)
        .connect()
        .map_err(|e| imap_error("failed to connect to IMAP server", &e))?;

    let mut session = client
        .login(&account.username, &account.password)
        .map_err(|e| {
            let err = imap_error("login failed", &e.0);
            // A refused LOGIN is an auth problem even when the server words
            // it oddly.
            if err.kind == crate::error::ErrorKind::Proto {
                Error::auth(err.message)
            } else {
                err
            }
        })?;

    if should_send_imap_id(&account.host) {
        // Some providers (QQ, 163) refuse SELECT until the client identifies
        // itself.
        if let Err(e) = send_imap_id(&mut session) {
            tracing::warn!(error = %e, "Failed to send IMAP ID, continuing");
        }
    }

    tracing::debug!(email = %account.email, "IMAP authentication successful");
    Ok(session)
}

/// Connect with exponential backoff: 3 attempts at 1 s / 4 s / 16 s. Only
/// transport errors are retried; an auth rejection surfaces immediately.
pub fn connect_with_retry(account: &Account) -> Result<ImapSession> {
    let mut delay = Duration::from_secs(1);
    let mut last_err = None;
    for attempt in 1..=3 {
        match connect_and_login(account) {
            Ok(session) => return Ok(session),
            Err(e) if e.kind == crate::error::ErrorKind::Net => {
                tracing::warn!(
                    email = %account.email,
                    attempt,
                    error = %e,
                    "IMAP connect failed, backing off"
                );
                last_err = Some(e);
                if attempt < 3 {
                    std::thread::sleep(delay);
                    delay = (delay * 4).min(Duration::from_secs(16));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::net("IMAP connect failed")))
}

/// Chinese providers require the ID command after login.
fn should_send_imap_id(host: &str) -> bool {
    let host = host.to_lowercase();
    host.contains("qq.com")
        || host.contains("163.com")
        || host.contains("126.com")
        || host.contains("yeah.net")
        || host.contains("sina.com")
        || host.contains("sohu.com")
}

fn send_imap_id(session: &mut ImapSession) -> Result<()> {
    let id_params = [
        ("name", "Maild"),
        ("version", env!("CARGO_PKG_VERSION")),
        ("vendor", "Maild"),
    ];

    let mut params_str = String::new();
    for (key, value) in id_params {
        if !params_str.is_empty() {
            params_str.push(' ');
        }
        params_str.push_str(&format!("\"{}\" \"{}\"", key, value));
    }

    let command = format!("ID ({})", params_str);
    session
        .run_command_and_read_response(&command)
        .map_err(|e| imap_error("failed to send IMAP ID", &e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_command_targets() {
        assert!(should_send_imap_id("imap.qq.com"));
        assert!(should_send_imap_id("IMAP.163.COM"));
        assert!(!should_send_imap_id("imap.gmail.com"));
    }
}
