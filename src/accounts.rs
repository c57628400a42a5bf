// Account store reader. The store is a YAML file the server only reads;
// writing it (credential input flows) belongs to the setup tooling.

use crate::error::{Error, Result};
use crate::models::{Account, Provider};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: Vec<AccountEntry>,
}

/// Raw store entry. Host/port/username carry provider-derived defaults so a
/// Gmail entry only needs email + password.
#[derive(Debug, Deserialize)]
struct AccountEntry {
    email: String,
    provider: Provider,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    /// TLS stays on unless a local test server explicitly turns it off.
    #[serde(default = "default_true")]
    tls: bool,
    #[serde(default)]
    username: Option<String>,
    password: String,
}

fn default_true() -> bool {
    true
}

/// Read the ordered account list. A missing file is an empty list, not an
/// error; anything malformed is `bad_accounts`.
pub fn load_accounts(path: &Path) -> Result<Vec<Account>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::bad_accounts(format!("failed to read account store: {}", e)))?;
    let file: AccountsFile = serde_yaml::from_str(&contents)
        .map_err(|e| Error::bad_accounts(format!("malformed account store: {}", e)))?;

    let mut accounts = Vec::with_capacity(file.accounts.len());
    for entry in file.accounts {
        accounts.push(resolve_entry(entry)?);
    }
    Ok(accounts)
}

fn resolve_entry(entry: AccountEntry) -> Result<Account> {
    if entry.email.is_empty() {
        return Err(Error::bad_accounts("account entry without email"));
    }
    let host = match entry.host {
        Some(host) if !host.is_empty() => host,
        _ => entry
            .provider
            .default_host()
            .ok_or_else(|| {
                Error::bad_accounts(format!(
                    "account {} has provider {} and no host",
                    entry.email,
                    entry.provider.as_str()
                ))
            })?
            .to_string(),
    };
    let username = entry.username.unwrap_or_else(|| entry.email.clone());
    Ok(Account {
        email: entry.email,
        provider: entry.provider,
        host,
        port: entry.port.unwrap_or(993),
        tls: entry.tls,
        username,
        password: entry.password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn write_store(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("accounts.yml");
        std::fs::write(&path, contents).unwrap();
        (tmp, path)
    }

    #[test]
    fn missing_file_is_empty_list() {
        let tmp = tempfile::tempdir().unwrap();
        let accounts = load_accounts(&tmp.path().join("accounts.yml")).unwrap();
        assert!(accounts.is_empty());
    }

    #[test]
    fn gmail_entry_gets_defaults() {
        let (_tmp, path) = write_store(
            "accounts:\n  - email: a@gmail.com\n    provider: gmail\n    password: app-pass\n",
        );
        let accounts = load_accounts(&path).unwrap();
        assert_eq!(accounts.len(), 1);
        let a = &accounts[0];
        assert_eq!(a.host, "imap.gmail.com");
        assert_eq!(a.port, 993);
        assert!(a.tls);
        assert_eq!(a.username, "a@gmail.com");
    }

    #[test]
    fn generic_provider_requires_host() {
        let (_tmp, path) = write_store(
            "accounts:\n  - email: me@corp.example\n    provider: imap_generic\n    password: x\n",
        );
        let err = load_accounts(&path).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadAccounts);
    }

    #[test]
    fn malformed_yaml_is_bad_accounts() {
        let (_tmp, path) = write_store("accounts: [not, {closed");
        let err = load_accounts(&path).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadAccounts);
    }

    #[test]
    fn order_is_preserved() {
        let (_tmp, path) = write_store(
            "accounts:\n  - email: one@qq.com\n    provider: qq\n    password: a\n  - email: two@yahoo.com\n    provider: yahoo\n    password: b\n",
        );
        let accounts = load_accounts(&path).unwrap();
        assert_eq!(accounts[0].email, "one@qq.com");
        assert_eq!(accounts[1].email, "two@yahoo.com");
        assert_eq!(accounts[0].host, "imap.qq.com");
    }
}
