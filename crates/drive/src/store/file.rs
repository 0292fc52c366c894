//! Filesystem credential store
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── accounts/
//! │   └── <account-id>.json     # AcmeAccount, including key material
//! └── domains/
//!     └── example.com/
//!         ├── pubcert.pem       # Certificate chain, leaf first
//!         ├── privkey.pem       # Private key
//!         └── meta.json         # Names, expiry, commit time
//! ```
//!
//! A commit writes a staging directory next to the live one and swaps it in
//! with renames. The live directory is moved aside to `<name>.previous`
//! first and only deleted once the new one is in place; a load that finds
//! no live directory falls back to the previous one.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn};

use super::{CredentialMeta, CredentialStore, StoredCredentials};
use crate::credentials::Credentials;
use crate::domain::AcmeAccount;
use crate::error::StoreError;

const CERT_FILE: &str = "pubcert.pem";
const KEY_FILE: &str = "privkey.pem";
const META_FILE: &str = "meta.json";
const PREVIOUS_SUFFIX: &str = ".previous";
const STAGING_PREFIX: &str = ".staging-";

/// Credential store rooted at a directory with restrictive permissions
#[derive(Debug)]
pub struct FileCredentialStore {
    base_path: PathBuf,
}

impl FileCredentialStore {
    /// Open the store, creating its directories
    ///
    /// The base, `accounts/` and `domains/` directories are created if
    /// missing and restricted to the owner (0700 on Unix).
    ///
    /// # Arguments
    ///
    /// * `base_path` - Root directory of the store
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if a directory cannot be created or its
    /// permissions cannot be set.
    pub fn new(base_path: &Path) -> Result<Self, StoreError> {
        let accounts = base_path.join("accounts");
        let domains = base_path.join("domains");
        fs::create_dir_all(&accounts)?;
        fs::create_dir_all(&domains)?;

        for dir in [base_path, accounts.as_path(), domains.as_path()] {
            restrict_dir(dir)?;
        }

        info!(storage_path = %base_path.display(), "Opened credential store");

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Root directory of the store
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn domains_path(&self) -> PathBuf {
        self.base_path.join("domains")
    }

    fn domain_path(&self, primary: &str) -> Result<PathBuf, StoreError> {
        let safe = !primary.is_empty()
            && !primary.starts_with('.')
            && !primary.contains(['/', '\\'])
            && !primary.ends_with(PREVIOUS_SUFFIX);
        if !safe {
            return Err(StoreError::Corrupt {
                path: primary.to_string(),
                reason: "not a usable domain directory name".into(),
            });
        }
        Ok(self.domains_path().join(primary))
    }

    fn previous_path(live: &Path) -> PathBuf {
        let mut name = live.as_os_str().to_os_string();
        name.push(PREVIOUS_SUFFIX);
        PathBuf::from(name)
    }

    fn account_path(&self, account: &AcmeAccount) -> PathBuf {
        self.base_path
            .join("accounts")
            .join(format!("{}.json", account_file_stem(&account.url)))
    }

    fn read_dir_set(dir: &Path) -> Result<StoredCredentials, StoreError> {
        let cert_pem = fs::read_to_string(dir.join(CERT_FILE))?;
        let key_pem = fs::read_to_string(dir.join(KEY_FILE))?;
        let meta_path = dir.join(META_FILE);
        let meta: CredentialMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)
            .map_err(|e| StoreError::Corrupt {
                path: meta_path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(StoredCredentials {
            cert_pem,
            key_pem,
            meta,
        })
    }

    fn write_staging(&self, staging: &Path, stored: &StoredCredentials) -> Result<(), StoreError> {
        fs::create_dir_all(staging)?;
        restrict_dir(staging)?;
        write_private(&staging.join(CERT_FILE), stored.cert_pem.as_bytes())?;
        write_private(&staging.join(KEY_FILE), stored.key_pem.as_bytes())?;
        write_private(
            &staging.join(META_FILE),
            serde_json::to_string_pretty(&stored.meta)?.as_bytes(),
        )?;
        Ok(())
    }

    /// Move `staging` into place as `live`, keeping the old set until done
    fn swap_in(live: &Path, staging: &Path) -> Result<(), StoreError> {
        let previous = Self::previous_path(live);
        if previous.exists() {
            if live.exists() {
                fs::remove_dir_all(&previous)?;
            } else {
                // an interrupted swap left only the previous set; keep it live
                fs::rename(&previous, live)?;
            }
        }

        let had_live = live.exists();
        if had_live {
            fs::rename(live, &previous)?;
        }

        if let Err(e) = fs::rename(staging, live) {
            if had_live {
                if let Err(restore) = fs::rename(&previous, live) {
                    warn!(
                        path = %live.display(),
                        error = %restore,
                        "Failed to restore previous credentials"
                    );
                }
            }
            return Err(e.into());
        }

        if had_live {
            if let Err(e) = fs::remove_dir_all(&previous) {
                warn!(path = %previous.display(), error = %e, "Failed to remove previous credentials");
            }
        }
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    /// Read the credential set stored for `primary`
    ///
    /// Falls back to `<primary>.previous` when a commit was interrupted
    /// after the live set was moved aside. Returns `Ok(None)` if neither
    /// exists.
    fn load_credentials(&self, primary: &str) -> Result<Option<StoredCredentials>, StoreError> {
        let live = self.domain_path(primary)?;
        let dir = if live.exists() {
            live
        } else {
            let previous = Self::previous_path(&live);
            if !previous.exists() {
                trace!(domain = %primary, "No stored credentials found");
                return Ok(None);
            }
            warn!(domain = %primary, "Loading credentials from interrupted commit");
            previous
        };

        let stored = Self::read_dir_set(&dir)?;
        debug!(
            domain = %primary,
            not_after = %stored.meta.not_after,
            "Loaded stored credentials"
        );
        Ok(Some(stored))
    }

    /// Atomically replace the credential set of `primary`
    ///
    /// Writes a staging directory and swaps it in with renames. On any
    /// failure the staging directory is removed and the live set is left
    /// as it was.
    ///
    /// # Arguments
    ///
    /// * `primary` - Primary name of the managed domain, used as directory name
    /// * `credentials` - Validated key and chain to persist
    fn commit_credentials(
        &self,
        primary: &str,
        credentials: &Credentials,
    ) -> Result<(), StoreError> {
        let live = self.domain_path(primary)?;
        let stored = StoredCredentials::from_credentials(credentials);
        let staging = self.domains_path().join(format!(
            "{STAGING_PREFIX}{primary}-{}",
            std::process::id()
        ));

        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        if let Err(e) = self
            .write_staging(&staging, &stored)
            .and_then(|()| Self::swap_in(&live, &staging))
        {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        info!(
            domain = %primary,
            not_after = %stored.meta.not_after,
            chain_len = credentials.chain().len(),
            "Committed credentials to storage"
        );
        Ok(())
    }

    /// Sorted primary names with a live or interrupted credential set
    fn list_domains(&self) -> Result<Vec<String>, StoreError> {
        let mut domains = Vec::new();
        for entry in fs::read_dir(self.domains_path())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let name = match name.strip_suffix(PREVIOUS_SUFFIX) {
                Some(stem) => stem.to_string(),
                None => name,
            };
            if !domains.contains(&name) {
                domains.push(name);
            }
        }
        domains.sort();
        Ok(domains)
    }

    /// Write `accounts/<id>.json` through a temporary file and rename
    fn save_account(&self, account: &AcmeAccount) -> Result<(), StoreError> {
        let path = self.account_path(account);
        let tmp = path.with_extension("json.tmp");
        write_private(&tmp, serde_json::to_string_pretty(account)?.as_bytes())?;
        fs::rename(&tmp, &path)?;
        info!(account = %account.url, "Saved ACME account");
        Ok(())
    }

    /// Every readable account; unreadable files are skipped with a warning
    fn load_accounts(&self) -> Result<Vec<AcmeAccount>, StoreError> {
        let mut accounts = Vec::new();
        for entry in fs::read_dir(self.base_path.join("accounts"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<AcmeAccount>(&content) {
                Ok(account) => accounts.push(account),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable account"),
            }
        }
        debug!(count = accounts.len(), "Loaded ACME accounts");
        Ok(accounts)
    }
}

/// File name for an account, derived from its URL
fn account_file_stem(url: &str) -> String {
    let stem = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn write_private(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn restrict_dir(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
