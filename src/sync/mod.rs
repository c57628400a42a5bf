// Per-account sync worker. One task per account owns an mpsc command queue;
// every IMAP-touching operation for the account serialises through it, which
// is what keeps (account, mailbox) mutations ordered. Sync runs additionally
// take the persistent per-account lock so two server processes can never
// write the same account at once.

pub mod engine;
pub mod write;

use crate::cache::Cache;
use crate::error::{Error, ErrorKind, Result};
use crate::models::{Account, Email, Mailbox, SyncOutcome};
use crate::rpc::Event;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

/// Bounded wait for the cross-process sync lock.
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Back-off after a transport failure / a throttling response.
const NET_BACKOFF: Duration = Duration::from_secs(30);
const BUSY_BACKOFF: Duration = Duration::from_secs(60);

pub enum SyncerCommand {
    Sync {
        mailbox: String,
        /// Background triggers (scheduler, IDLE) respect the back-off window
        /// and report nowhere; explicit RPCs always run.
        background: bool,
        reply: Option<oneshot::Sender<Result<SyncOutcome>>>,
    },
    GetBody {
        mailbox: String,
        uid: u32,
        reply: oneshot::Sender<Result<Email>>,
    },
    Search {
        mailbox: String,
        query: String,
        reply: oneshot::Sender<Result<Vec<Email>>>,
    },
    ListMailboxes {
        reply: oneshot::Sender<Result<Vec<Mailbox>>>,
    },
    MarkRead {
        mailbox: String,
        uids: Vec<u32>,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        mailbox: String,
        uids: Vec<u32>,
        reply: oneshot::Sender<Result<()>>,
    },
    MoveToTrash {
        mailbox: String,
        uids: Vec<u32>,
        reply: oneshot::Sender<Result<()>>,
    },
    SaveDraft {
        rfc822: Vec<u8>,
        reply: oneshot::Sender<Result<Option<u32>>>,
    },
}

/// Cloneable handle to one account's worker task.
#[derive(Clone)]
pub struct Syncer {
    pub account: Account,
    tx: mpsc::Sender<SyncerCommand>,
    syncing: Arc<AtomicBool>,
}

impl Syncer {
    pub fn spawn(
        account: Account,
        cache: Cache,
        events: broadcast::Sender<Event>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let syncing = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            account: account.clone(),
            cache,
            events,
            syncing: syncing.clone(),
            paused: false,
            backoff_until: None,
        };
        tokio::spawn(worker.run(rx, shutdown));

        Syncer {
            account,
            tx,
            syncing,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Relaxed)
    }

    pub async fn sync(&self, mailbox: String) -> Result<SyncOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncerCommand::Sync {
            mailbox,
            background: false,
            reply: Some(reply),
        })
        .await?;
        recv_reply(rx).await
    }

    /// Fire-and-forget delta trigger from the scheduler or the debouncer.
    pub async fn sync_background(&self, mailbox: String) -> Result<()> {
        self.send(SyncerCommand::Sync {
            mailbox,
            background: true,
            reply: None,
        })
        .await
    }

    pub async fn get_body(&self, mailbox: String, uid: u32) -> Result<Email> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncerCommand::GetBody { mailbox, uid, reply }).await?;
        recv_reply(rx).await
    }

    pub async fn search(&self, mailbox: String, query: String) -> Result<Vec<Email>> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncerCommand::Search {
            mailbox,
            query,
            reply,
        })
        .await?;
        recv_reply(rx).await
    }

    pub async fn list_mailboxes(&self) -> Result<Vec<Mailbox>> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncerCommand::ListMailboxes { reply }).await?;
        recv_reply(rx).await
    }

    pub async fn mark_read(&self, mailbox: String, uids: Vec<u32>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncerCommand::MarkRead {
            mailbox,
            uids,
            reply,
        })
        .await?;
        recv_reply(rx).await
    }

    pub async fn delete(&self, mailbox: String, uids: Vec<u32>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncerCommand::Delete {
            mailbox,
            uids,
            reply,
        })
        .await?;
        recv_reply(rx).await
    }

    pub async fn move_to_trash(&self, mailbox: String, uids: Vec<u32>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncerCommand::MoveToTrash {
            mailbox,
            uids,
            reply,
        })
        .await?;
        recv_reply(rx).await
    }

    pub async fn save_draft(&self, rfc822: Vec<u8>) -> Result<Option<u32>> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncerCommand::SaveDraft { rfc822, reply }).await?;
        recv_reply(rx).await
    }

    async fn send(&self, command: SyncerCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::shutdown("account worker is gone"))
    }
}

async fn recv_reply<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await
        .map_err(|_| Error::shutdown("account worker dropped the request"))?
}

struct Worker {
    account: Account,
    cache: Cache,
    events: broadcast::Sender<Event>,
    syncing: Arc<AtomicBool>,
    /// Set on an auth rejection; cleared only by account reload.
    paused: bool,
    backoff_until: Option<Instant>,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SyncerCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let command = tokio::select! {
                _ = shutdown.changed() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command).await;
        }
        tracing::debug!(email = %self.account.email, "Account worker draining");
    }

    async fn handle(&mut self, command: SyncerCommand) {
        let account = self.account.clone();
        let cache = self.cache.clone();

        match command {
            SyncerCommand::Sync {
                mailbox,
                background,
                reply,
            } => {
                let result = self.run_sync(&mailbox, background).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SyncerCommand::GetBody { mailbox, uid, reply } => {
                let result = match self.ensure_active() {
                    Ok(()) => {
                        let result =
                            write::fetch_and_cache_body(&account, &cache, &mailbox, uid).await;
                        self.note_result(&result);
                        result
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SyncerCommand::Search {
                mailbox,
                query,
                reply,
            } => {
                let result = match self.ensure_active() {
                    Ok(()) => {
                        let result = write::search(&account, &cache, &mailbox, &query).await;
                        self.note_result(&result);
                        result
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SyncerCommand::ListMailboxes { reply } => {
                let result = match self.ensure_active() {
                    Ok(()) => {
                        let result = write::list_mailboxes(&account, &cache).await;
                        self.note_result(&result);
                        result
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SyncerCommand::MarkRead {
                mailbox,
                uids,
                reply,
            } => {
                let result = match self.ensure_active() {
                    Ok(()) => {
                        let result =
                            write::mark_read(&account, &cache, &mailbox, &uids, false).await;
                        self.note_result(&result);
                        result
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SyncerCommand::Delete {
                mailbox,
                uids,
                reply,
            } => {
                let result = match self.ensure_active() {
                    Ok(()) => {
                        let result = write::delete(&account, &cache, &mailbox, &uids).await;
                        self.note_result(&result);
                        result
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SyncerCommand::MoveToTrash {
                mailbox,
                uids,
                reply,
            } => {
                let result = match self.ensure_active() {
                    Ok(()) => {
                        let result = write::move_to_trash(&account, &cache, &mailbox, &uids).await;
                        self.note_result(&result);
                        result
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SyncerCommand::SaveDraft { rfc822, reply } => {
                let result = match self.ensure_active() {
                    Ok(()) => {
                        let result = write::save_draft(&account, rfc822).await;
                        self.note_result(&result);
                        result
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Operations are refused while the account is paused on bad credentials.
    fn ensure_active(&self) -> Result<()> {
        if self.paused {
            Err(Error::auth(format!(
                "account {} is paused after an authentication failure",
                self.account.email
            )))
        } else {
            Ok(())
        }
    }

    fn note_result<T>(&mut self, result: &Result<T>) {
        if let Err(e) = result {
            self.note_failure(e);
        }
    }

    async fn run_sync(&mut self, mailbox: &str, background: bool) -> Result<SyncOutcome> {
        self.ensure_active()?;
        if background {
            if let Some(until) = self.backoff_until {
                if Instant::now() < until {
                    tracing::debug!(
                        email = %self.account.email,
                        "Skipping background sync during back-off"
                    );
                    return Ok(SyncOutcome::default());
                }
            }
        }

        self.acquire_lock().await?;
        self.syncing.store(true, Ordering::Relaxed);
        self.emit(Event::SyncStarted {
            account: self.account.email.clone(),
            mailbox: mailbox.to_string(),
        });

        let result = engine::sync_mailbox(&self.account, &self.cache, mailbox).await;

        // The lock releases on every exit path.
        if let Err(e) = self.cache.release_lock(&self.account.email).await {
            tracing::error!(email = %self.account.email, error = %e, "Failed to release sync lock");
        }
        self.syncing.store(false, Ordering::Relaxed);

        match &result {
            Ok(outcome) => {
                self.backoff_until = None;
                self.emit(Event::sync_completed(
                    &self.account.email,
                    mailbox,
                    *outcome,
                ));
            }
            Err(e) => {
                self.note_failure(e);
                self.emit(Event::SyncError {
                    account: self.account.email.clone(),
                    mailbox: mailbox.to_string(),
                    error: e.to_string(),
                });
            }
        }

        result
    }

    /// Take the persistent per-account lock, waiting up to five minutes.
    /// A crashed holder's lock is cleaned the first time we see it.
    async fn acquire_lock(&self) -> Result<()> {
        if self.cache.acquire_lock(&self.account.email).await? {
            return Ok(());
        }

        // Someone holds it; clear stale holders once, then wait.
        self.cache.cleanup_stale_locks().await?;

        let deadline = Instant::now() + LOCK_WAIT_TIMEOUT;
        loop {
            if self.cache.acquire_lock(&self.account.email).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "timed out waiting for the {} sync lock",
                    self.account.email
                )));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    fn note_failure(&mut self, e: &Error) {
        match e.kind {
            ErrorKind::Auth => {
                tracing::warn!(
                    email = %self.account.email,
                    "Authentication rejected, pausing account until accounts reload"
                );
                self.paused = true;
            }
            ErrorKind::Net => {
                self.backoff_until = Some(Instant::now() + NET_BACKOFF);
            }
            ErrorKind::ServerBusy => {
                self.backoff_until = Some(Instant::now() + BUSY_BACKOFF);
            }
            _ => {}
        }
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine; send only fails then.
        let _ = self.events.send(event);
    }
}
