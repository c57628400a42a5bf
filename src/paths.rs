// Per-user filesystem layout. Everything the server owns lives under one
// state directory: the socket, the pidfile, the account store, the cache
// database, and log files.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    /// Resolve the per-user state directory: `$XDG_CONFIG_HOME/maild` when
    /// set, else `~/.config/maild`. Created with mode 0700 on first use.
    pub fn resolve() -> Result<Self> {
        let config_home = match std::env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let base_dirs = directories::BaseDirs::new().ok_or_else(|| {
                    Error::bad_request("could not determine home directory".to_string())
                })?;
                base_dirs.home_dir().join(".config")
            }
        };
        Self::from_base(config_home.join("maild"))
    }

    /// Use an explicit base directory. Tests point this at a scratch dir.
    pub fn from_base(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)
            .map_err(|e| Error::net(format!("failed to create state dir {:?}: {}", base, e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&base, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| Error::net(format!("failed to chmod state dir: {}", e)))?;
        }
        Ok(Paths { base })
    }

    pub fn state_dir(&self) -> &Path {
        &self.base
    }

    pub fn socket_path(&self) -> PathBuf {
        self.base.join("server.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.base.join("server.pid")
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.base.join("accounts.yml")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base.join("cache")
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.cache_dir().join("cache.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_children_of_base() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::from_base(tmp.path().join("maild")).unwrap();
        assert!(paths.socket_path().starts_with(paths.state_dir()));
        assert!(paths.pid_path().ends_with("server.pid"));
        assert!(paths.cache_db_path().ends_with("cache/cache.db"));
    }

    #[cfg(unix)]
    #[test]
    fn state_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::from_base(tmp.path().join("maild")).unwrap();
        let mode = std::fs::metadata(paths.state_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
