use clap::{Parser, Subcommand};
use maild::error::ErrorKind;
use maild::paths::Paths;
use maild::rpc::client::Client;
use maild::rpc::Command;
use maild::{accounts, logger, pidfile, server};
use std::time::Duration;

// Exit codes shared with scripts driving the CLI.
const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_NO_SERVER: i32 = 3;

#[derive(Parser)]
#[command(name = "maild", version, about = "Background mail sync server")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Manage the sync server process.
    #[command(subcommand)]
    Server(ServerCommand),
    /// Trigger a sync for matching accounts on the running server.
    Sync {
        /// Provider tags to match (gmail, yahoo, qq, imap_generic). Empty
        /// matches every account.
        providers: Vec<String>,
        /// Re-run detached in the background and return immediately.
        #[arg(long)]
        detach: bool,
    },
}

#[derive(Subcommand)]
enum ServerCommand {
    /// Run the server in the foreground.
    Start,
    /// Print accounts, PID, and version of the running server.
    Status,
    /// Gracefully stop the running server.
    Stop,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("maild: {}", e);
            match e.kind {
                ErrorKind::BadAccounts => EXIT_CONFIG,
                _ => EXIT_ERROR,
            }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> maild::Result<i32> {
    let paths = Paths::resolve()?;

    match cli.command {
        CliCommand::Server(ServerCommand::Start) => {
            let _log_guard = match logger::init(&paths) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    eprintln!("maild: logging unavailable: {}", e);
                    None
                }
            };
            match server::run(paths).await? {
                server::RunOutcome::Ran => Ok(EXIT_OK),
                server::RunOutcome::AlreadyRunning => {
                    println!("maild server is already running");
                    Ok(EXIT_OK)
                }
            }
        }

        CliCommand::Server(ServerCommand::Status) => server_status(&paths).await,

        CliCommand::Server(ServerCommand::Stop) => server_stop(&paths).await,

        CliCommand::Sync { providers, detach } => sync_command(&paths, providers, detach).await,
    }
}

async fn server_status(paths: &Paths) -> maild::Result<i32> {
    let mut client = match Client::connect(paths).await {
        Ok(client) => client,
        Err(_) => {
            println!("maild server is not running");
            return Ok(EXIT_ERROR);
        }
    };

    let accounts = client.request(Command::GetAccounts).await?;

    if let Ok((pid, version)) = pidfile::read_pid_file(&paths.pid_path()) {
        println!("maild server: pid {}, version {}", pid, version);
    }

    match accounts.as_array() {
        Some(list) if !list.is_empty() => {
            for entry in list {
                let email = entry["email"].as_str().unwrap_or("?");
                let provider = entry["provider"].as_str().unwrap_or("?");
                let count = entry["emailCount"].as_u64().unwrap_or(0);
                let syncing = entry["syncing"].as_bool().unwrap_or(false);
                println!(
                    "  {} ({}) - {} emails cached{}",
                    email,
                    provider,
                    count,
                    if syncing { ", syncing" } else { "" }
                );
            }
        }
        _ => println!("  no accounts configured"),
    }
    Ok(EXIT_OK)
}

async fn server_stop(paths: &Paths) -> maild::Result<i32> {
    let held = pidfile::read_pid_file(&paths.pid_path()).ok();

    match Client::connect(paths).await {
        Ok(mut client) => {
            let _ = client.request(Command::Shutdown).await;
        }
        Err(_) => {
            println!("maild server is not running");
            // Clear leftovers from a crashed server.
            let _ = std::fs::remove_file(paths.socket_path());
            pidfile::remove_pid_file(&paths.pid_path());
            return Ok(EXIT_OK);
        }
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    if let Some((pid, _)) = held {
        if pidfile::is_our_process(pid) {
            eprintln!("server pid {} still alive, sending SIGTERM", pid);
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    let _ = std::fs::remove_file(paths.socket_path());
    pidfile::remove_pid_file(&paths.pid_path());
    println!("maild server stopped");
    Ok(EXIT_OK)
}

async fn sync_command(paths: &Paths, providers: Vec<String>, detach: bool) -> maild::Result<i32> {
    // Config problems are reported before touching the server.
    let stored = accounts::load_accounts(&paths.accounts_path())?;
    if stored.is_empty() {
        eprintln!("no accounts configured in {}", paths.accounts_path().display());
        return Ok(EXIT_CONFIG);
    }

    let matching: Vec<_> = stored
        .into_iter()
        .filter(|a| providers.is_empty() || providers.iter().any(|p| p == a.provider.as_str()))
        .collect();
    if matching.is_empty() {
        eprintln!("no accounts match providers: {}", providers.join(", "));
        return Ok(EXIT_CONFIG);
    }

    if detach {
        return detach_sync(&providers);
    }

    let mut client = match Client::connect_or_start(paths).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("cannot reach maild server: {}", e);
            return Ok(EXIT_NO_SERVER);
        }
    };

    let mut failed = false;
    for account in matching {
        print!("syncing {} ... ", account.email);
        let result = client
            .request(Command::Sync {
                account: account.email.clone(),
                mailbox: "INBOX".to_string(),
            })
            .await;
        match result {
            Ok(outcome) => {
                let added = outcome["added"].as_u64().unwrap_or(0);
                let removed = outcome["removed"].as_u64().unwrap_or(0);
                println!("ok ({} new, {} removed)", added, removed);
            }
            Err(e) => {
                println!("failed: {}", e);
                failed = true;
            }
        }
    }

    Ok(if failed { EXIT_ERROR } else { EXIT_OK })
}

/// Re-execute `maild sync` without --detach in a detached child.
fn detach_sync(providers: &[String]) -> maild::Result<i32> {
    let exe = std::env::current_exe()
        .map_err(|e| maild::Error::net(format!("cannot locate own binary: {}", e)))?;

    let mut command = std::process::Command::new(exe);
    command
        .arg("sync")
        .args(providers)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command
        .spawn()
        .map_err(|e| maild::Error::net(format!("failed to detach: {}", e)))?;
    println!("sync running in background (pid {})", child.id());
    Ok(EXIT_OK)
}
