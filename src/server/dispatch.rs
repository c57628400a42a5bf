// RPC command dispatch. Cache reads answer directly; anything touching IMAP
// goes through the account's syncer so per-account ordering holds.

use super::SharedState;
use crate::error::{Error, ErrorKind, Result};
use crate::models::AccountStatus;
use crate::rpc::Command;
use crate::sync::Syncer;
use base64::Engine;
use serde_json::{json, Value};

pub async fn handle(state: &SharedState, command: Command) -> Result<Value> {
    match command {
        Command::Ping => Ok(json!("pong")),

        Command::GetAccounts => {
            let mut statuses = Vec::new();
            for syncer in state.syncers() {
                let email = &syncer.account.email;
                statuses.push(AccountStatus {
                    email: email.clone(),
                    provider: syncer.account.provider,
                    email_count: state.cache.count_emails(email).await?,
                    syncing: syncer.is_syncing(),
                    last_sync_unix: state.cache.last_sync_unix(email).await?,
                });
            }
            Ok(serde_json::to_value(statuses)?)
        }

        Command::GetEmails {
            account,
            mailbox,
            limit,
        } => {
            state.check_account(&account)?;
            let emails = state
                .cache
                .load_emails_limit(&account, &mailbox, limit)
                .await?;
            Ok(serde_json::to_value(emails)?)
        }

        Command::GetBody {
            account,
            mailbox,
            uid,
        } => {
            // Cache hit answers without an IMAP round-trip.
            if state.cache.has_body(&account, &mailbox, uid).await? {
                let email = state.cache.load_email(&account, &mailbox, uid).await?;
                if let Some(email) = email {
                    return Ok(json!({
                        "bodyHtml": email.body_html,
                        "attachments": email.attachments,
                    }));
                }
            }
            let syncer = state.syncer(&account)?;
            let email = syncer.get_body(mailbox, uid).await?;
            Ok(json!({
                "bodyHtml": email.body_html,
                "attachments": email.attachments,
            }))
        }

        Command::GetLabels { account } => {
            let syncer = state.syncer(&account)?;
            match syncer.list_mailboxes().await {
                Ok(mailboxes) => Ok(serde_json::to_value(mailboxes)?),
                Err(e) if retryable(&e) => {
                    // Offline: answer from the roles recorded on earlier runs.
                    let known = state.cache.known_mailboxes(&account).await?;
                    let mailboxes: Vec<Value> = known
                        .into_iter()
                        .map(|(name, role)| {
                            json!({
                                "name": name,
                                "display_name": name,
                                "role": role,
                            })
                        })
                        .collect();
                    Ok(Value::Array(mailboxes))
                }
                Err(e) => Err(e),
            }
        }

        Command::Search {
            account,
            mailbox,
            query,
        } => {
            let syncer = state.syncer(&account)?;
            match syncer.search(mailbox.clone(), query.clone()).await {
                Ok(emails) => Ok(serde_json::to_value(emails)?),
                Err(e) if retryable(&e) => {
                    tracing::debug!(error = %e, "IMAP search failed, using cached search");
                    let emails = state.cache.search_cached(&account, &mailbox, &query).await?;
                    Ok(serde_json::to_value(emails)?)
                }
                Err(e) => Err(e),
            }
        }

        Command::Sync { account, mailbox } => {
            let syncer = state.syncer(&account)?;
            let outcome = syncer.sync(mailbox).await?;
            Ok(serde_json::to_value(outcome)?)
        }

        Command::MarkRead {
            account,
            mailbox,
            uid,
        } => {
            let syncer = state.syncer(&account)?;
            syncer.mark_read(mailbox, vec![uid]).await?;
            Ok(Value::Null)
        }

        Command::MarkReadMulti {
            account,
            mailbox,
            uids,
        } => {
            let syncer = state.syncer(&account)?;
            syncer.mark_read(mailbox, uids).await?;
            Ok(Value::Null)
        }

        Command::Delete {
            account,
            mailbox,
            uid,
        } => {
            let syncer = state.syncer(&account)?;
            syncer.delete(mailbox, vec![uid]).await?;
            Ok(Value::Null)
        }

        Command::DeleteMulti {
            account,
            mailbox,
            uids,
        } => {
            let syncer = state.syncer(&account)?;
            syncer.delete(mailbox, uids).await?;
            Ok(Value::Null)
        }

        Command::MoveToTrash {
            account,
            mailbox,
            uid,
        } => {
            let syncer = state.syncer(&account)?;
            syncer.move_to_trash(mailbox, vec![uid]).await?;
            Ok(Value::Null)
        }

        Command::MoveMultiToTrash {
            account,
            mailbox,
            uids,
        } => {
            let syncer = state.syncer(&account)?;
            syncer.move_to_trash(mailbox, uids).await?;
            Ok(Value::Null)
        }

        Command::SaveDraft { account, rfc822 } => {
            let syncer = state.syncer(&account)?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(rfc822.as_bytes())
                .map_err(|e| Error::bad_request(format!("rfc822 is not valid base64: {}", e)))?;
            let uid = syncer.save_draft(bytes).await?;
            Ok(json!({ "uid": uid }))
        }

        Command::RefreshAccounts => {
            state.reload_accounts().await?;
            Ok(Value::Null)
        }

        Command::Shutdown => {
            state.request_shutdown();
            Ok(Value::Null)
        }

        // Handled by the connection loop, never dispatched here.
        Command::Subscribe => Err(Error::bad_request("Subscribe is a streaming command")),
    }
}

/// Errors worth falling back to the cache for.
fn retryable(e: &Error) -> bool {
    matches!(e.kind, ErrorKind::Net | ErrorKind::Timeout | ErrorKind::Auth)
}

impl SharedState {
    /// Resolve a syncer; a remembered account-store failure outranks an
    /// unknown-account answer.
    pub(super) fn syncer(&self, account: &str) -> Result<Syncer> {
        self.check_account(account)?;
        self.find_syncer(account)
            .ok_or_else(|| Error::bad_request(format!("unknown account: {}", account)))
    }

    pub(super) fn check_account(&self, _account: &str) -> Result<()> {
        if let Some(err) = self.accounts_error() {
            return Err(err);
        }
        Ok(())
    }
}
