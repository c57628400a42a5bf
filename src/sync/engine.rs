// Sync algorithms. A full sync pulls the envelope window and reconciles the
// whole mailbox; a delta sync prefers CONDSTORE and falls back to UID-set
// comparison. IMAP work happens in one blocking session per phase, cache
// writes follow on the async side.

use crate::cache::Cache;
use crate::error::Result;
use crate::imap_adapter::{self, ops, SelectInfo};
use crate::models::{Account, Email, SyncOutcome};
use std::collections::HashSet;

/// Envelope window: everything newer than this many days...
pub const SYNC_WINDOW_DAYS: i64 = 14;
/// ...capped at this many messages.
pub const MAX_EMAILS: usize = 1000;
/// Bodies prefetched for the newest bodyless messages after a full sync.
const PREFETCH_BODY_COUNT: u32 = 10;

/// Entry point used by the syncer: full sync when the mailbox has no cached
/// rows yet, delta otherwise. A UIDVALIDITY change mid-delta falls back to a
/// full run.
pub async fn sync_mailbox(account: &Account, cache: &Cache, mailbox: &str) -> Result<SyncOutcome> {
    let cached_count = cache.count_mailbox_emails(&account.email, mailbox).await?;
    if cached_count == 0 {
        full_sync(account, cache, mailbox).await
    } else {
        delta_sync(account, cache, mailbox).await
    }
}

/// Full sync: envelope window fetch, stale-row removal, body prefetch.
pub async fn full_sync(account: &Account, cache: &Cache, mailbox: &str) -> Result<SyncOutcome> {
    let account_clone = account.clone();
    let mailbox_name = mailbox.to_string();

    let (info, rows, server_uids) = tokio::task::spawn_blocking(
        move || -> Result<(SelectInfo, Vec<Email>, HashSet<u32>)> {
            let mut session = imap_adapter::connect_with_retry(&account_clone)?;
            let info = ops::select(&mut session, &mailbox_name)?;
            let rows = ops::fetch_since(&mut session, info.exists, SYNC_WINDOW_DAYS, MAX_EMAILS)?;
            let server_uids = ops::all_uids(&mut session)?;
            let _ = session.logout();
            Ok((info, rows, server_uids))
        },
    )
    .await
    .map_err(|e| crate::error::Error::net(format!("sync task join error: {}", e)))??;

    let previously_cached: HashSet<u32> = cache
        .cached_uids(&account.email, mailbox)
        .await?
        .into_iter()
        .collect();

    cache
        .upsert_emails(&account.email, mailbox, info.uid_validity, &rows)
        .await?;

    // Rows that vanished server-side while we were away. After a UIDVALIDITY
    // wipe the cache only holds fresh rows, so this is a no-op there.
    let mut removed = 0;
    for uid in cache.cached_uids(&account.email, mailbox).await? {
        if !server_uids.contains(&uid) {
            cache.delete_email(&account.email, mailbox, uid).await?;
            removed += 1;
        }
    }

    cache
        .update_mailbox_state(&account.email, mailbox, info.uid_validity, info.highest_modseq)
        .await?;

    prefetch_bodies(account, cache, mailbox).await;

    let added = rows
        .iter()
        .filter(|r| !previously_cached.contains(&r.uid))
        .count() as u64;

    tracing::info!(
        email = %account.email,
        mailbox,
        added,
        removed,
        total = server_uids.len(),
        "Full sync complete"
    );

    Ok(SyncOutcome {
        added,
        removed,
        flags_changed: 0,
    })
}

/// What the blocking half of a delta sync brings back.
enum DeltaFetch {
    /// UIDVALIDITY moved; the caller reruns as a full sync.
    EpochChanged,
    Data {
        info: SelectInfo,
        /// (uid, unread) pairs to reconcile.
        flags: Vec<(u32, bool)>,
        /// Envelope rows for UIDs the cache has never seen.
        new_rows: Vec<Email>,
        server_uids: HashSet<u32>,
    },
}

/// Delta sync: CONDSTORE when both sides have a mod-sequence, UID-set
/// comparison otherwise.
pub async fn delta_sync(account: &Account, cache: &Cache, mailbox: &str) -> Result<SyncOutcome> {
    let state = cache.mailbox_state(&account.email, mailbox).await?;
    let known_validity = state.as_ref().map(|s| s.uid_validity).unwrap_or(0);
    let known_modseq = state.as_ref().map(|s| s.highest_modseq).unwrap_or(0);
    let cached: HashSet<u32> = cache
        .cached_uids(&account.email, mailbox)
        .await?
        .into_iter()
        .collect();
    let unread_before = cache.unread_map(&account.email, mailbox).await?;

    let account_clone = account.clone();
    let mailbox_name = mailbox.to_string();
    let cached_clone = cached.clone();

    let fetched = tokio::task::spawn_blocking(move || -> Result<DeltaFetch> {
        let mut session = imap_adapter::connect_with_retry(&account_clone)?;
        let info = ops::select(&mut session, &mailbox_name)?;

        if known_validity != 0 && info.uid_validity != known_validity {
            let _ = session.logout();
            return Ok(DeltaFetch::EpochChanged);
        }

        let server_uids = ops::all_uids(&mut session)?;

        let flags = if known_modseq > 0 && info.highest_modseq > 0 {
            ops::fetch_changed_since(&mut session, known_modseq)?
        } else {
            // No CONDSTORE: reconcile flags over everything still cached.
            let present: Vec<u32> = cached_clone
                .iter()
                .copied()
                .filter(|uid| server_uids.contains(uid))
                .collect();
            ops::fetch_flags(&mut session, &present)?
        };

        let new_uids: Vec<u32> = server_uids
            .iter()
            .copied()
            .filter(|uid| !cached_clone.contains(uid))
            .collect();
        let new_rows = ops::fetch_envelopes(&mut session, &new_uids)?;

        let _ = session.logout();
        Ok(DeltaFetch::Data {
            info,
            flags,
            new_rows,
            server_uids,
        })
    })
    .await
    .map_err(|e| crate::error::Error::net(format!("sync task join error: {}", e)))??;

    let (info, flags, new_rows, server_uids) = match fetched {
        DeltaFetch::EpochChanged => {
            tracing::warn!(
                email = %account.email,
                mailbox,
                "UIDVALIDITY changed, rerunning as full sync"
            );
            return full_sync(account, cache, mailbox).await;
        }
        DeltaFetch::Data {
            info,
            flags,
            new_rows,
            server_uids,
        } => (info, flags, new_rows, server_uids),
    };

    let added = new_rows.len() as u64;
    if !new_rows.is_empty() {
        cache
            .upsert_emails(&account.email, mailbox, info.uid_validity, &new_rows)
            .await?;
    }

    let mut flags_changed = 0;
    for (uid, unread) in flags {
        match unread_before.get(&uid) {
            Some(previous) if *previous != unread => {
                cache
                    .update_flags(&account.email, mailbox, uid, unread)
                    .await?;
                flags_changed += 1;
            }
            _ => {}
        }
    }

    let mut removed = 0;
    for uid in &cached {
        if !server_uids.contains(uid) {
            cache.delete_email(&account.email, mailbox, *uid).await?;
            removed += 1;
        }
    }

    cache
        .update_mailbox_state(&account.email, mailbox, info.uid_validity, info.highest_modseq)
        .await?;

    tracing::debug!(
        email = %account.email,
        mailbox,
        added,
        removed,
        flags_changed,
        "Delta sync complete"
    );

    Ok(SyncOutcome {
        added,
        removed,
        flags_changed,
    })
}

/// Pull bodies for the newest messages that only have envelopes so opening
/// them is instant. Failures are logged and ignored; the on-demand path
/// covers anything missed.
async fn prefetch_bodies(account: &Account, cache: &Cache, mailbox: &str) {
    let uids = match cache
        .uids_without_body(&account.email, mailbox, PREFETCH_BODY_COUNT)
        .await
    {
        Ok(uids) if !uids.is_empty() => uids,
        _ => return,
    };

    let account_clone = account.clone();
    let mailbox_name = mailbox.to_string();
    let fetched = tokio::task::spawn_blocking(move || {
        let mut session = imap_adapter::connect_and_login(&account_clone)?;
        ops::select(&mut session, &mailbox_name)?;
        let mut bodies = Vec::new();
        for uid in uids {
            match imap_adapter::body::fetch_body(&mut session, uid) {
                Ok(body) => bodies.push((uid, body)),
                Err(e) => {
                    tracing::debug!(uid, error = %e, "Body prefetch failed for message");
                }
            }
        }
        let _ = session.logout();
        Ok::<_, crate::error::Error>(bodies)
    })
    .await;

    let bodies = match fetched {
        Ok(Ok(bodies)) => bodies,
        Ok(Err(e)) => {
            tracing::debug!(email = %account.email, error = %e, "Body prefetch skipped");
            return;
        }
        Err(e) => {
            tracing::debug!(error = %e, "Body prefetch task join error");
            return;
        }
    };

    for (uid, body) in bodies {
        if let Err(e) = cache
            .set_body(
                &account.email,
                mailbox,
                uid,
                &body.body_html,
                &body.snippet,
                &body.attachments,
            )
            .await
        {
            tracing::warn!(uid, error = %e, "Failed to store prefetched body");
        }
    }
}
