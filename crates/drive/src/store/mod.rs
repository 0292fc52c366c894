//! Persistent store collaborator
//!
//! The driver hands validated credentials to a [`CredentialStore`] and
//! never reads from it during a cycle. Hosts read from it at startup to
//! seed [`ManagedDomain::credentials`](crate::ManagedDomain) and to find
//! existing accounts.

mod file;
mod memory;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::{CertificateChain, Credentials, KeySpec, PrivateKey};
use crate::domain::AcmeAccount;
use crate::error::{DriveError, StoreError};

/// Metadata stored alongside a credential set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialMeta {
    /// Names on the leaf certificate
    pub names: Vec<String>,
    pub not_after: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
    #[serde(default)]
    pub key_spec: KeySpec,
}

/// A credential set as persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredentials {
    /// PEM chain, leaf first
    pub cert_pem: String,
    pub key_pem: String,
    pub meta: CredentialMeta,
}

impl StoredCredentials {
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            cert_pem: credentials.chain().to_pem(),
            key_pem: credentials.key().pem().to_string(),
            meta: CredentialMeta {
                names: credentials.names().to_vec(),
                not_after: credentials.not_after(),
                committed_at: Utc::now(),
                key_spec: credentials.key().spec(),
            },
        }
    }

    /// Re-validate the stored set against `names` at `now`
    pub fn into_credentials(
        self,
        names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Credentials, DriveError> {
        let chain = CertificateChain::from_pem(&self.cert_pem)?;
        let key = PrivateKey::from_pem(self.meta.key_spec, self.key_pem);
        Credentials::new(key, chain, names, now)
    }
}

/// Storage for accounts and committed credential sets
///
/// A commit must be atomic: a reader sees either the previous set or the
/// new one, never a mix.
pub trait CredentialStore: Send + Sync {
    /// Credentials last committed for the domain keyed by `primary`
    fn load_credentials(&self, primary: &str) -> Result<Option<StoredCredentials>, StoreError>;

    /// Replace the credentials of the domain keyed by `primary`
    fn commit_credentials(
        &self,
        primary: &str,
        credentials: &Credentials,
    ) -> Result<(), StoreError>;

    /// Primary names with committed credentials
    fn list_domains(&self) -> Result<Vec<String>, StoreError>;

    fn save_account(&self, account: &AcmeAccount) -> Result<(), StoreError>;

    fn load_accounts(&self) -> Result<Vec<AcmeAccount>, StoreError>;
}
