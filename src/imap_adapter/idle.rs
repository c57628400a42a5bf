// IMAP IDLE watcher. Each account gets one long-lived connection parked in
// IDLE on its inbox; EXISTS/EXPUNGE/FETCH notices are forwarded to the
// server, which debounces them into delta syncs. The wait re-arms inside the
// 29-minute window RFC 2177 allows, and the loop reconnects after failures.

use super::client::{connect_and_login, ImapSession};
use super::IdleNotice;
use crate::error::{imap_error, Error, ErrorKind, Result};
use crate::models::Account;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How one blocking IDLE session ended.
enum SessionEnd {
    /// Timed out or observed notices; reconnect immediately.
    ReArm,
    /// Server lacks IDLE; stop watching this account for good.
    Unsupported,
}

/// Long-running watcher task for one account's mailbox. Exits when
/// `shutdown` flips or the server turns out not to support IDLE.
pub async fn idle_loop(
    account: Account,
    mailbox: String,
    notify: mpsc::Sender<(String, String, IdleNotice)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let account_clone = account.clone();
        let mailbox_clone = mailbox.clone();
        let notify_clone = notify.clone();

        let session = tokio::task::spawn_blocking(move || {
            idle_session(&account_clone, &mailbox_clone, &notify_clone)
        });

        let outcome = tokio::select! {
            _ = shutdown.changed() => return,
            res = session => res,
        };

        match outcome {
            Ok(Ok(SessionEnd::ReArm)) => {
                // Clean timeout or notices delivered; re-arm right away.
            }
            Ok(Ok(SessionEnd::Unsupported)) => {
                tracing::warn!(
                    email = %account.email,
                    "Server does not support IDLE, relying on polling only"
                );
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    email = %account.email,
                    mailbox = %mailbox,
                    error = %e,
                    "IDLE session error, reconnecting after pause"
                );
                let sleep = tokio::time::sleep(Duration::from_secs(30));
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = sleep => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "IDLE task join error");
                return;
            }
        }
    }
}

/// Run a single IDLE session: connect, select, wait for notices until the
/// re-arm window elapses.
fn idle_session(
    account: &Account,
    mailbox: &str,
    notify: &mpsc::Sender<(String, String, IdleNotice)>,
) -> Result<SessionEnd> {
    use imap::types::UnsolicitedResponse;

    let mut session: ImapSession = connect_and_login(account)?;

    let capabilities = session
        .capabilities()
        .map_err(|e| imap_error("failed to get capabilities", &e))?;
    if !capabilities.has_str("IDLE") {
        let _ = session.logout();
        return Ok(SessionEnd::Unsupported);
    }

    session
        .select(mailbox)
        .map_err(|e| imap_error("cannot select mailbox for IDLE", &e))?;

    tracing::debug!(email = %account.email, mailbox, "IDLE armed");

    let account_email = account.email.to_string();
    let mailbox_name = mailbox.to_string();

    let mut idle_handle = session.idle();
    idle_handle.keepalive(true);
    // Stay under the 29-minute server timeout from RFC 2177.
    idle_handle.timeout(Duration::from_secs(29 * 60));

    let wait_result = idle_handle.wait_while(|response: UnsolicitedResponse| {
        let notice = match response {
            UnsolicitedResponse::Exists(count) => Some(IdleNotice::Exists(count)),
            UnsolicitedResponse::Expunge(seq) => Some(IdleNotice::Expunge(seq)),
            UnsolicitedResponse::Fetch { id, .. } => Some(IdleNotice::Fetch(id)),
            _ => None,
        };
        if let Some(notice) = notice {
            let _ = notify.blocking_send((
                account_email.clone(),
                mailbox_name.clone(),
                notice,
            ));
        }
        // Keep waiting; coalescing happens server-side in the debouncer.
        true
    });

    match wait_result {
        Ok(_) => Ok(SessionEnd::ReArm),
        Err(e) => Err(Error::new(
            ErrorKind::Net,
            format!("IDLE wait failed: {}", e),
        )),
    }
}
