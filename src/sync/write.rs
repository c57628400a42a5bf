// Write-through mutations. The remote IMAP operation always runs first; the
// cache is only touched after the server confirms, so a failed write leaves
// the cache byte-for-byte unchanged.

use crate::cache::Cache;
use crate::error::Result;
use crate::imap_adapter::{self, body::FetchedBody, ops, provider};
use crate::models::{Account, Email, MailboxRole};

/// Set or clear \Seen remotely, then mirror the unread flag locally.
pub async fn mark_read(
    account: &Account,
    cache: &Cache,
    mailbox: &str,
    uids: &[u32],
    unread: bool,
) -> Result<()> {
    let account_clone = account.clone();
    let mailbox_name = mailbox.to_string();
    let uid_list = uids.to_vec();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut session = imap_adapter::connect_with_retry(&account_clone)?;
        ops::select(&mut session, &mailbox_name)?;
        let op = if unread {
            ops::FlagOp::Remove
        } else {
            ops::FlagOp::Add
        };
        ops::set_flags(&mut session, &uid_list, "\\Seen", op)?;
        let _ = session.logout();
        Ok(())
    })
    .await
    .map_err(|e| crate::error::Error::net(format!("task join error: {}", e)))??;

    for uid in uids {
        cache.update_flags(&account.email, mailbox, *uid, unread).await?;
    }
    Ok(())
}

/// Permanently delete remotely, then drop the cached rows.
pub async fn delete(account: &Account, cache: &Cache, mailbox: &str, uids: &[u32]) -> Result<()> {
    let account_clone = account.clone();
    let mailbox_name = mailbox.to_string();
    let uid_list = uids.to_vec();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut session = imap_adapter::connect_with_retry(&account_clone)?;
        ops::select(&mut session, &mailbox_name)?;
        ops::delete_uids(&mut session, &uid_list)?;
        let _ = session.logout();
        Ok(())
    })
    .await
    .map_err(|e| crate::error::Error::net(format!("task join error: {}", e)))??;

    for uid in uids {
        cache.delete_email(&account.email, mailbox, *uid).await?;
    }
    Ok(())
}

/// Move to the provider's trash mailbox, then drop the cached source rows.
/// The trash copy appears in the cache when that mailbox next syncs.
pub async fn move_to_trash(
    account: &Account,
    cache: &Cache,
    mailbox: &str,
    uids: &[u32],
) -> Result<()> {
    let account_clone = account.clone();
    let mailbox_name = mailbox.to_string();
    let uid_list = uids.to_vec();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let quirks = provider::quirks(account_clone.provider);
        let mut session = imap_adapter::connect_with_retry(&account_clone)?;
        let trash = ops::resolve_role(&mut session, quirks, MailboxRole::Trash)?;
        ops::select(&mut session, &mailbox_name)?;
        ops::move_uids(&mut session, &uid_list, &trash)?;
        let _ = session.logout();
        Ok(())
    })
    .await
    .map_err(|e| crate::error::Error::net(format!("task join error: {}", e)))??;

    for uid in uids {
        cache.delete_email(&account.email, mailbox, *uid).await?;
    }
    Ok(())
}

/// APPEND opaque draft bytes to the Drafts mailbox. No cache mutation; the
/// drafts mailbox picks the message up on its next sync.
pub async fn save_draft(account: &Account, rfc822: Vec<u8>) -> Result<Option<u32>> {
    let account_clone = account.clone();
    tokio::task::spawn_blocking(move || -> Result<Option<u32>> {
        let quirks = provider::quirks(account_clone.provider);
        let mut session = imap_adapter::connect_with_retry(&account_clone)?;
        let drafts = ops::resolve_role(&mut session, quirks, MailboxRole::Drafts)?;
        let uid = ops::append_draft(&mut session, &drafts, &rfc822)?;
        let _ = session.logout();
        Ok(uid)
    })
    .await
    .map_err(|e| crate::error::Error::net(format!("task join error: {}", e)))?
}

/// Fetch-on-demand body: pull, parse, and store, then return the hydrated
/// cache row.
pub async fn fetch_and_cache_body(
    account: &Account,
    cache: &Cache,
    mailbox: &str,
    uid: u32,
) -> Result<Email> {
    let account_clone = account.clone();
    let mailbox_name = mailbox.to_string();

    let body: FetchedBody = tokio::task::spawn_blocking(move || {
        let mut session = imap_adapter::connect_with_retry(&account_clone)?;
        ops::select(&mut session, &mailbox_name)?;
        let body = imap_adapter::body::fetch_body(&mut session, uid)?;
        let _ = session.logout();
        Ok::<_, crate::error::Error>(body)
    })
    .await
    .map_err(|e| crate::error::Error::net(format!("task join error: {}", e)))??;

    cache
        .set_body(
            &account.email,
            mailbox,
            uid,
            &body.body_html,
            &body.snippet,
            &body.attachments,
        )
        .await?;

    cache
        .load_email(&account.email, mailbox, uid)
        .await?
        .ok_or_else(|| {
            crate::error::Error::bad_request(format!(
                "UID {} is not cached for {}/{}",
                uid, account.email, mailbox
            ))
        })
}

/// Provider-aware server search, hydrating any hits the cache has not seen.
/// Returns the matching cache rows, newest first.
pub async fn search(
    account: &Account,
    cache: &Cache,
    mailbox: &str,
    query: &str,
) -> Result<Vec<Email>> {
    let cached: std::collections::HashSet<u32> = cache
        .cached_uids(&account.email, mailbox)
        .await?
        .into_iter()
        .collect();

    let account_clone = account.clone();
    let mailbox_name = mailbox.to_string();
    let query_owned = query.to_string();

    let (uids, info, new_rows) = tokio::task::spawn_blocking(move || {
        let quirks = provider::quirks(account_clone.provider);
        let mut session = imap_adapter::connect_with_retry(&account_clone)?;
        let info = ops::select(&mut session, &mailbox_name)?;
        let uids = ops::search(&mut session, quirks, &query_owned)?;
        let missing: Vec<u32> = uids
            .iter()
            .copied()
            .filter(|uid| !cached.contains(uid))
            .collect();
        let new_rows = ops::fetch_envelopes(&mut session, &missing)?;
        let _ = session.logout();
        Ok::<_, crate::error::Error>((uids, info, new_rows))
    })
    .await
    .map_err(|e| crate::error::Error::net(format!("task join error: {}", e)))??;

    if !new_rows.is_empty() {
        cache
            .upsert_emails(&account.email, mailbox, info.uid_validity, &new_rows)
            .await?;
    }

    cache.load_emails_by_uids(&account.email, mailbox, &uids).await
}

/// List mailboxes with roles, persisting roles for the offline path.
pub async fn list_mailboxes(
    account: &Account,
    cache: &Cache,
) -> Result<Vec<crate::models::Mailbox>> {
    let account_clone = account.clone();
    let mailboxes = tokio::task::spawn_blocking(move || {
        let quirks = provider::quirks(account_clone.provider);
        let mut session = imap_adapter::connect_with_retry(&account_clone)?;
        let mailboxes = ops::list_mailboxes(&mut session, quirks)?;
        let _ = session.logout();
        Ok::<_, crate::error::Error>(mailboxes)
    })
    .await
    .map_err(|e| crate::error::Error::net(format!("task join error: {}", e)))??;

    for mailbox in &mailboxes {
        cache
            .record_mailbox_role(&account.email, &mailbox.name, mailbox.role)
            .await?;
    }
    Ok(mailboxes)
}
