// Client side of the protocol, used by every short-lived process (CLI
// subcommands, status checks, external tooling). Auto-starts the server when
// the socket is absent by re-executing this binary in its own session.

use super::{codec, Command, Event, EventFrame, Request, Response};
use crate::error::{Error, ErrorKind, Result};
use crate::paths::Paths;
use std::time::Duration;
use tokio::net::UnixStream;

pub struct Client {
    stream: UnixStream,
    next_id: u64,
}

impl Client {
    /// Connect to a running server.
    pub async fn connect(paths: &Paths) -> Result<Self> {
        let stream = UnixStream::connect(paths.socket_path())
            .await
            .map_err(|e| Error::net(format!("cannot connect to server socket: {}", e)))?;
        Ok(Client { stream, next_id: 1 })
    }

    /// Connect, starting the server first when the socket is absent. Waits up
    /// to 5 seconds for the socket to appear.
    pub async fn connect_or_start(paths: &Paths) -> Result<Self> {
        if let Ok(client) = Self::connect(paths).await {
            return Ok(client);
        }

        spawn_server()?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = Self::connect(paths).await {
                return Ok(client);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::net(
                    "server did not come up within 5 seconds of auto-start",
                ));
            }
        }
    }

    /// Issue one request and wait for its response. Responses arrive in
    /// request order on a connection, so the next frame is ours.
    pub async fn request(&mut self, command: Command) -> Result<serde_json::Value> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request { id, command };
        codec::write_json(&mut self.stream, &request).await?;

        let body = codec::read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| Error::shutdown("server closed the connection"))?;
        let response: Response = serde_json::from_slice(&body)
            .map_err(|e| Error::proto(format!("malformed response: {}", e)))?;

        if response.id != id {
            return Err(Error::proto(format!(
                "response id {} does not match request id {}",
                response.id, id
            )));
        }
        if response.ok {
            Ok(response.result.unwrap_or(serde_json::Value::Null))
        } else {
            let error = response.error.unwrap_or(super::ErrorBody {
                kind: ErrorKind::Proto,
                message: "server reported failure without detail".to_string(),
            });
            Err(Error::new(error.kind, error.message))
        }
    }

    /// Switch this connection into event-stream mode. The server answers the
    /// Subscribe with event frames until either side hangs up.
    pub async fn subscribe(mut self) -> Result<EventStream> {
        let id = self.next_id;
        self.next_id += 1;
        let request = Request {
            id,
            command: Command::Subscribe,
        };
        codec::write_json(&mut self.stream, &request).await?;
        Ok(EventStream {
            stream: self.stream,
        })
    }
}

pub struct EventStream {
    stream: UnixStream,
}

impl EventStream {
    /// Next event, or `None` when the server closed the stream.
    pub async fn next(&mut self) -> Result<Option<Event>> {
        match codec::read_frame(&mut self.stream).await? {
            Some(body) => {
                let frame: EventFrame = serde_json::from_slice(&body)
                    .map_err(|e| Error::proto(format!("malformed event frame: {}", e)))?;
                Ok(Some(frame.event))
            }
            None => Ok(None),
        }
    }
}

/// Start `maild server start` detached in its own session so it outlives the
/// calling process.
fn spawn_server() -> Result<()> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::net(format!("cannot locate own binary: {}", e)))?;

    let mut command = std::process::Command::new(exe);
    command
        .args(["server", "start"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New process group, setsid-style: the server must not die with our
        // terminal.
        command.process_group(0);
    }

    command
        .spawn()
        .map_err(|e| Error::net(format!("failed to start server: {}", e)))?;
    tracing::debug!("Spawned background server process");
    Ok(())
}
