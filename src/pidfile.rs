// Singleton control. The pidfile holds "<pid>:<version>" and is written with
// exclusive-create semantics; a losing writer reads the existing file back to
// decide between attaching, superseding, or giving up. Liveness checks pair
// the PID with a start token so a recycled PID is never mistaken for a live
// server.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Outcome of a pidfile write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidFileStatus {
    Acquired,
    HeldBy { pid: u32, version: String },
}

/// Try to create the pidfile. "File exists" is not an error: the holder's
/// pid and version are read back so the caller can decide what to do.
pub fn try_write_pid_file(path: &Path, pid: u32, version: &str) -> Result<PidFileStatus> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            write!(file, "{}:{}", pid, version)
                .map_err(|e| Error::net(format!("failed to write pidfile: {}", e)))?;
            Ok(PidFileStatus::Acquired)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let (pid, version) = read_pid_file(path)?;
            Ok(PidFileStatus::HeldBy { pid, version })
        }
        Err(e) => Err(Error::net(format!("failed to create pidfile: {}", e))),
    }
}

/// Read "<pid>:<version>" from the pidfile. A trailing newline is accepted.
pub fn read_pid_file(path: &Path) -> Result<(u32, String)> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::net(format!("failed to read pidfile: {}", e)))?;
    let contents = contents.trim();
    let (pid_str, version) = contents
        .split_once(':')
        .ok_or_else(|| Error::proto(format!("malformed pidfile contents: {:?}", contents)))?;
    let pid = pid_str
        .parse::<u32>()
        .map_err(|_| Error::proto(format!("malformed pid in pidfile: {:?}", pid_str)))?;
    Ok((pid, version.to_string()))
}

pub fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Does any process with this PID exist? kill(pid, 0) probes without
/// signalling.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    false
}

/// A string that changes whenever the OS reuses the PID. On Linux this is the
/// process start time in clock ticks, field 22 of /proc/<pid>/stat.
#[cfg(target_os = "linux")]
pub fn process_start_token(pid: u32) -> Result<String> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .map_err(|_| Error::process_gone(format!("no process with pid {}", pid)))?;
    // comm (field 2) may contain spaces and parens; skip past the last
    // closing paren before splitting the remaining fields.
    let rest = stat
        .rfind(')')
        .map(|i| &stat[i + 2..])
        .ok_or_else(|| Error::proto("malformed /proc stat line".to_string()))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state); starttime is field 22 overall.
    let start_time = fields
        .get(19)
        .ok_or_else(|| Error::proto("short /proc stat line".to_string()))?;
    Ok((*start_time).to_string())
}

/// Fallback for Unixes without /proc: no token, just a liveness probe.
#[cfg(not(target_os = "linux"))]
pub fn process_start_token(pid: u32) -> Result<String> {
    if process_exists(pid) {
        Ok(String::new())
    } else {
        Err(Error::process_gone(format!("no process with pid {}", pid)))
    }
}

/// True only if the process exists and runs the same binary as us, matched by
/// basename (arg0 / comm).
pub fn is_our_process(pid: u32) -> bool {
    if !process_exists(pid) {
        return false;
    }
    let Some(own_name) = current_binary_name() else {
        return false;
    };
    match process_name(pid) {
        Some(name) => name == own_name,
        None => false,
    }
}

fn current_binary_name() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.file_name()?.to_string_lossy().into_owned())
}

#[cfg(target_os = "linux")]
fn process_name(pid: u32) -> Option<String> {
    // comm is truncated to 15 chars by the kernel; compare prefixes when the
    // binary name is longer.
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
    let comm = comm.trim().to_string();
    let own = current_binary_name()?;
    if own.len() > 15 && comm.len() == 15 && own.starts_with(&comm) {
        return Some(own);
    }
    Some(comm)
}

#[cfg(not(target_os = "linux"))]
fn process_name(_pid: u32) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_held_by() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.pid");

        let status = try_write_pid_file(&path, 4242, "1.0.0").unwrap();
        assert_eq!(status, PidFileStatus::Acquired);

        let status = try_write_pid_file(&path, 4343, "1.1.0").unwrap();
        assert_eq!(
            status,
            PidFileStatus::HeldBy {
                pid: 4242,
                version: "1.0.0".to_string()
            }
        );
    }

    #[test]
    fn read_accepts_trailing_newline() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.pid");
        std::fs::write(&path, "77:0.9.1\n").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), (77, "0.9.1".to_string()));
    }

    #[test]
    fn malformed_pidfile_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.pid");
        std::fs::write(&path, "not-a-pidfile").unwrap();
        assert!(read_pid_file(&path).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_process_exists_and_has_a_token() {
        let pid = std::process::id();
        assert!(process_exists(pid));
        let token = process_start_token(pid).unwrap();
        // The token must be stable for a live process.
        assert_eq!(token, process_start_token(pid).unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dead_pid_has_no_token() {
        // PIDs this large are rejected by the kernel (pid_max caps far lower).
        let err = process_start_token(u32::MAX - 1).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ProcessGone);
    }
}
