// Server runtime: singleton acquisition with supersession, the accept loop,
// the fallback poll scheduler, IDLE watcher wiring, and graceful shutdown.

pub mod dispatch;
pub mod events;

use crate::accounts;
use crate::cache::Cache;
use crate::error::{Error, ErrorKind, Result};
use crate::imap_adapter::{idle, IdleNotice};
use crate::paths::Paths;
use crate::pidfile::{self, PidFileStatus};
use crate::rpc::{codec, Command, Event, EventFrame, Request, Response};
use crate::sync::Syncer;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Fallback poll cadence; catches providers whose IDLE silently drops.
const POLL_INTERVAL: Duration = Duration::from_secs(120);
/// Server-side soft deadline per non-subscription request.
const RPC_SOFT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Grace period for in-flight syncer work at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SharedState {
    pub paths: Paths,
    pub cache: Cache,
    pub events: broadcast::Sender<Event>,
    syncers: RwLock<Vec<Syncer>>,
    accounts_err: RwLock<Option<Error>>,
    idle_tasks: Mutex<Vec<JoinHandle<()>>>,
    idle_notify: mpsc::Sender<(String, String, IdleNotice)>,
    shutdown_tx: watch::Sender<bool>,
}

impl SharedState {
    pub fn syncers(&self) -> Vec<Syncer> {
        self.syncers.read().unwrap().clone()
    }

    pub fn find_syncer(&self, email: &str) -> Option<Syncer> {
        self.syncers
            .read()
            .unwrap()
            .iter()
            .find(|s| s.account.email == email)
            .cloned()
    }

    pub fn accounts_error(&self) -> Option<Error> {
        self.accounts_err.read().unwrap().clone()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// (Re)read the account store and rebuild the syncer set. Called at
    /// startup and on every `RefreshAccounts`; a reload also clears any
    /// auth-paused state since workers are recreated.
    pub async fn reload_accounts(&self) -> Result<()> {
        let loaded = match accounts::load_accounts(&self.paths.accounts_path()) {
            Ok(accounts) => {
                *self.accounts_err.write().unwrap() = None;
                accounts
            }
            Err(e) => {
                *self.accounts_err.write().unwrap() = Some(e.clone());
                tracing::error!(error = %e, "Account store unusable, running without syncers");
                self.syncers.write().unwrap().clear();
                return Err(e);
            }
        };

        // Accounts that left the store take their cached data with them.
        let previous: Vec<String> = self
            .syncers()
            .into_iter()
            .map(|s| s.account.email)
            .collect();
        for email in &previous {
            if !loaded.iter().any(|a| &a.email == email) {
                tracing::info!(%email, "Account removed, purging cached data");
                self.cache.purge_account(email).await?;
            }
        }

        for handle in self.idle_tasks.lock().await.drain(..) {
            handle.abort();
        }

        let mut new_syncers = Vec::with_capacity(loaded.len());
        for account in loaded {
            self.cache
                .touch_account(&account.email, account.provider.as_str())
                .await?;

            let syncer = Syncer::spawn(
                account.clone(),
                self.cache.clone(),
                self.events.clone(),
                self.shutdown_rx(),
            );
            new_syncers.push(syncer);

            let idle_task = tokio::spawn(idle::idle_loop(
                account,
                "INBOX".to_string(),
                self.idle_notify.clone(),
                self.shutdown_rx(),
            ));
            self.idle_tasks.lock().await.push(idle_task);
        }

        let count = new_syncers.len();
        *self.syncers.write().unwrap() = new_syncers;
        tracing::info!(account_count = count, "Account registry loaded");
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Served until shutdown.
    Ran,
    /// A live same-version server already exists; nothing to do.
    AlreadyRunning,
}

/// Run the sync server in the foreground until shutdown.
pub fn run(
    paths: Paths,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RunOutcome>> + Send>> {
    Box::pin(run_inner(paths))
}

async fn run_inner(paths: Paths) -> Result<RunOutcome> {
    let pid = std::process::id();
    match acquire_singleton(&paths, pid).await? {
        SingletonStatus::AlreadyRunning => return Ok(RunOutcome::AlreadyRunning),
        SingletonStatus::Acquired => {}
    }

    tracing::info!(pid, version = crate::VERSION, "Mail sync server starting");

    let cache = Cache::open(&paths.cache_db_path()).await?;
    let cleaned = cache.cleanup_stale_locks().await?;
    if cleaned > 0 {
        tracing::info!(cleaned, "Cleared stale sync locks from previous runs");
    }

    let (events_tx, _) = broadcast::channel(256);
    let (shutdown_tx, _) = watch::channel(false);
    let (idle_tx, idle_rx) = mpsc::channel(64);

    let state = Arc::new(SharedState {
        paths: paths.clone(),
        cache,
        events: events_tx,
        syncers: RwLock::new(Vec::new()),
        accounts_err: RwLock::new(None),
        idle_tasks: Mutex::new(Vec::new()),
        idle_notify: idle_tx,
        shutdown_tx,
    });

    // A malformed store is not fatal: the server runs empty and reports
    // bad_accounts on per-account RPCs until a RefreshAccounts fixes it.
    let _ = state.reload_accounts().await;

    let listener = bind_socket(&paths)?;

    // IDLE notices → debounced delta syncs.
    {
        let state_clone = state.clone();
        let events = state.events.clone();
        let shutdown = state.shutdown_rx();
        tokio::spawn(events::debounce_loop(
            idle_rx,
            events,
            move |email: &str| state_clone.find_syncer(email),
            shutdown,
        ));
    }

    // Fallback poll scheduler.
    {
        let state_clone = state.clone();
        let mut shutdown = state.shutdown_rx();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                for syncer in state_clone.syncers() {
                    if let Err(e) = syncer.sync_background("INBOX".to_string()).await {
                        tracing::debug!(error = %e, "Scheduled sync trigger failed");
                    }
                }
            }
        });
    }

    spawn_signal_handler(state.clone());

    // Accept loop: one task per connection.
    let mut shutdown_rx = state.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let state_clone = state.clone();
                    tokio::spawn(handle_connection(state_clone, stream));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                }
            },
        }
    }

    shutdown_cleanup(&state, &paths).await;
    Ok(RunOutcome::Ran)
}

enum SingletonStatus {
    Acquired,
    AlreadyRunning,
}

/// Pidfile protocol: attach to a live same-version server, supersede an
/// older one (graceful RPC shutdown, then SIGTERM), clear leftovers from
/// dead processes.
async fn acquire_singleton(paths: &Paths, pid: u32) -> Result<SingletonStatus> {
    let pid_path = paths.pid_path();
    match pidfile::try_write_pid_file(&pid_path, pid, crate::VERSION)? {
        PidFileStatus::Acquired => return Ok(SingletonStatus::Acquired),
        PidFileStatus::HeldBy {
            pid: held_pid,
            version,
        } => {
            if pidfile::is_our_process(held_pid) {
                if version == crate::VERSION {
                    tracing::info!(held_pid, "Same-version server already running");
                    return Ok(SingletonStatus::AlreadyRunning);
                }

                tracing::info!(
                    held_pid,
                    held_version = %version,
                    own_version = crate::VERSION,
                    "Superseding server of different version"
                );
                if let Ok(mut client) = crate::rpc::client::Client::connect(paths).await {
                    let _ = client.request(Command::Shutdown).await;
                }
                let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
                while pidfile::process_exists(held_pid) && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                if pidfile::process_exists(held_pid) {
                    tracing::warn!(held_pid, "Old server ignored shutdown, terminating it");
                    #[cfg(unix)]
                    unsafe {
                        libc::kill(held_pid as libc::pid_t, libc::SIGTERM);
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            } else {
                tracing::info!(held_pid, "Clearing pidfile left by dead process");
            }

            pidfile::remove_pid_file(&pid_path);
            match pidfile::try_write_pid_file(&pid_path, pid, crate::VERSION)? {
                PidFileStatus::Acquired => Ok(SingletonStatus::Acquired),
                PidFileStatus::HeldBy { pid: winner, .. } => Err(Error::net(format!(
                    "lost the pidfile race to pid {}",
                    winner
                ))),
            }
        }
    }
}

/// Bind the RPC socket with owner-only permissions. We hold the pidfile, so
/// any existing socket file is a leftover with no live owner.
fn bind_socket(paths: &Paths) -> Result<UnixListener> {
    let socket_path = paths.socket_path();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .map_err(|e| Error::net(format!("cannot remove stale socket: {}", e)))?;
    }

    let listener = UnixListener::bind(&socket_path)
        .map_err(|e| Error::net(format!("cannot bind {}: {}", socket_path.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::net(format!("cannot chmod socket: {}", e)))?;
    }

    tracing::info!(socket = %socket_path.display(), "Listening");
    Ok(listener)
}

fn spawn_signal_handler(state: Arc<SharedState>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("Signal received, shutting down");
        state.request_shutdown();
    });
}

/// Per-connection worker: requests are processed strictly in arrival order,
/// so response order matches request order.
async fn handle_connection(state: Arc<SharedState>, stream: UnixStream) {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let frame = match codec::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                // Oversized announcements get one error response, then the
                // connection dies; the body was never allocated.
                if e.kind == ErrorKind::BadRequest {
                    let response = Response::failure(0, &e);
                    let _ = codec::write_json(&mut writer, &response).await;
                }
                return;
            }
        };

        let request: Request = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                let err = Error::bad_request(format!("malformed request: {}", e));
                let _ = codec::write_json(&mut writer, &Response::failure(0, &err)).await;
                return;
            }
        };

        if matches!(request.command, Command::Subscribe) {
            stream_events(&state, reader, writer, request.id).await;
            return;
        }

        let response =
            match tokio::time::timeout(RPC_SOFT_TIMEOUT, dispatch::handle(&state, request.command))
                .await
            {
                Ok(Ok(value)) => Response::success(request.id, value),
                Ok(Err(e)) => Response::failure(request.id, &e),
                Err(_) => Response::failure(
                    request.id,
                    &Error::timeout("request exceeded the 5 minute server deadline"),
                ),
            };

        if codec::write_json(&mut writer, &response).await.is_err() {
            return;
        }
    }
}

/// Event-stream mode: forward broadcast events until the client hangs up or
/// the server shuts down.
async fn stream_events(
    state: &SharedState,
    mut reader: tokio::net::unix::OwnedReadHalf,
    mut writer: tokio::net::unix::OwnedWriteHalf,
    id: u64,
) {
    let mut events = state.events.subscribe();
    let mut shutdown = state.shutdown_rx();
    if *shutdown.borrow() {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            // EOF or anything else from the client ends the stream.
            _ = codec::read_frame(&mut reader) => return,
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = EventFrame { id, event };
                    if codec::write_json(&mut writer, &frame).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

/// Wait for in-flight syncer work, then remove the socket and pidfile.
async fn shutdown_cleanup(state: &SharedState, paths: &Paths) {
    tracing::info!("Draining syncers");
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    loop {
        let busy = state.syncers().iter().any(Syncer::is_syncing);
        if !busy || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Locks held by this process must not outlive it.
    for syncer in state.syncers() {
        let _ = state.cache.release_lock(&syncer.account.email).await;
    }

    let _ = std::fs::remove_file(paths.socket_path());
    pidfile::remove_pid_file(&paths.pid_path());
    tracing::info!("Server stopped");
}
