// IDLE notice debouncer. Notices for one (account, mailbox) are coalesced
// over a 500 ms window: the first emits a MailboxChanged hint and schedules
// one delta sync; followers inside the window are absorbed.

use crate::imap_adapter::IdleNotice;
use crate::rpc::Event;
use crate::sync::Syncer;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Consume idle notices until shutdown. `lookup` resolves the account email
/// to its current syncer handle (accounts can be reloaded under us).
pub async fn debounce_loop<F>(
    mut notices: mpsc::Receiver<(String, String, IdleNotice)>,
    events: broadcast::Sender<Event>,
    lookup: F,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Fn(&str) -> Option<Syncer> + Send + Sync + 'static,
{
    let pending: Arc<Mutex<HashSet<(String, String)>>> = Arc::new(Mutex::new(HashSet::new()));
    let lookup = Arc::new(lookup);

    loop {
        let (account, mailbox, notice) = tokio::select! {
            _ = shutdown.changed() => return,
            notice = notices.recv() => match notice {
                Some(notice) => notice,
                None => return,
            },
        };

        tracing::debug!(%account, %mailbox, ?notice, "IDLE notice");

        let key = (account.clone(), mailbox.clone());
        {
            let mut pending = pending.lock().unwrap();
            if !pending.insert(key.clone()) {
                // Already one pending trigger for this mailbox; absorb.
                continue;
            }
        }

        // The hint goes out immediately, before the delta sync it announces.
        let _ = events.send(Event::MailboxChanged {
            account: account.clone(),
            mailbox: mailbox.clone(),
        });

        let pending_clone = pending.clone();
        let lookup_clone = lookup.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;
            pending_clone.lock().unwrap().remove(&key);
            if let Some(syncer) = lookup_clone(&account) {
                if let Err(e) = syncer.sync_background(mailbox.clone()).await {
                    tracing::debug!(%account, error = %e, "Debounced sync trigger failed");
                }
            }
        });
    }
}
