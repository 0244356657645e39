//! Player accounts checked in key-auth mode.

use blockhost_net::MAX_USERNAME_LEN;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// One login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique name.
    pub username: String,
    /// Shared secret.
    pub password: String,
}

impl Account {
    /// Build an account.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn validate(&self) -> Result<(), AccountError> {
        let invalid = |reason| AccountError::Invalid {
            username: self.username.clone(),
            reason,
        };
        if self.username.is_empty() {
            return Err(invalid("empty username"));
        }
        if self.username.len() > MAX_USERNAME_LEN {
            return Err(invalid("username too long"));
        }
        if self.password.is_empty() || self.password.len() > 0xff {
            return Err(invalid("password must be 1 to 255 bytes"));
        }
        Ok(())
    }
}

/// Account store failures.
#[derive(Debug, Error)]
pub enum AccountError {
    /// Username already taken.
    #[error("account {0} already exists")]
    Duplicate(String),
    /// No such username.
    #[error("no account named {0}")]
    NotFound(String),
    /// Fields violate login limits.
    #[error("account {username} is invalid: {reason}")]
    Invalid {
        /// Offending account.
        username: String,
        /// What is wrong.
        reason: &'static str,
    },
    /// File or directory could not be read.
    #[error("failed to read {}", path.display())]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// Account file is not valid TOML.
    #[error("failed to parse {}", path.display())]
    Parse {
        /// Path being parsed.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: toml::de::Error,
    },
    /// An account file failed its checks.
    #[error("{}: {source}", path.display())]
    File {
        /// Offending file.
        path: PathBuf,
        /// What went wrong.
        source: Box<AccountError>,
    },
}

/// What to do when one account file cannot be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Log the failure and keep loading the rest.
    SkipFailures,
    /// Stop and leave the store untouched.
    CancelOnFailure,
}

/// Outcome of a directory load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Accounts now in the store.
    pub loaded: usize,
    /// Files skipped because they failed.
    pub skipped: usize,
}

/// Accounts keyed by username.
#[derive(Debug, Default, Clone)]
pub struct AccountStore {
    accounts: HashMap<String, Account>,
}

impl AccountStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `username`.
    pub fn find_account(&self, username: &str) -> Option<&Account> {
        self.accounts.get(username)
    }

    /// Add a new account.
    pub fn add_account(&mut self, account: Account) -> Result<(), AccountError> {
        account.validate()?;
        if self.accounts.contains_key(&account.username) {
            return Err(AccountError::Duplicate(account.username));
        }
        self.accounts.insert(account.username.clone(), account);
        Ok(())
    }

    /// Replace an existing account.
    pub fn update_account(&mut self, account: Account) -> Result<(), AccountError> {
        account.validate()?;
        match self.accounts.get_mut(&account.username) {
            Some(slot) => {
                *slot = account;
                Ok(())
            }
            None => Err(AccountError::NotFound(account.username)),
        }
    }

    /// Delete `username`.
    pub fn remove_account(&mut self, username: &str) -> Result<Account, AccountError> {
        self.accounts
            .remove(username)
            .ok_or_else(|| AccountError::NotFound(username.to_owned()))
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Whether `username` exists with `password`.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.find_account(username)
            .is_some_and(|account| account.password == password)
    }

    /// Replace the store with every `*.toml` account file in `dir`.
    ///
    /// Files are read in name order. With [`LoadStrategy::CancelOnFailure`]
    /// the first failure is returned and the store is left as it was.
    pub fn load_from_directory(
        &mut self,
        dir: &Path,
        strategy: LoadStrategy,
    ) -> Result<LoadReport, AccountError> {
        let io_err = |source| AccountError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut fresh = AccountStore::new();
        let mut report = LoadReport::default();
        for path in paths {
            match read_account(&path).and_then(|account| fresh.add_account(account)) {
                Ok(()) => {}
                Err(err) => match strategy {
                    LoadStrategy::SkipFailures => {
                        warn!("Skipping account file {}: {err}", path.display());
                        report.skipped += 1;
                    }
                    LoadStrategy::CancelOnFailure => {
                        return Err(AccountError::File {
                            path,
                            source: Box::new(err),
                        });
                    }
                },
            }
        }

        report.loaded = fresh.len();
        *self = fresh;
        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            "Loaded accounts from {}",
            dir.display()
        );
        Ok(report)
    }
}

fn read_account(path: &Path) -> Result<Account, AccountError> {
    let contents = fs::read_to_string(path).map_err(|source| AccountError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| AccountError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
