//! In-process credential store

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CredentialStore, StoredCredentials};
use crate::credentials::Credentials;
use crate::domain::AcmeAccount;
use crate::error::StoreError;

/// Credential store held in memory, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<String, StoredCredentials>>,
    accounts: RwLock<Vec<AcmeAccount>>,
    commits: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful commits since creation
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_credentials(&self, primary: &str) -> Result<Option<StoredCredentials>, StoreError> {
        Ok(self.credentials.read().get(primary).cloned())
    }

    fn commit_credentials(
        &self,
        primary: &str,
        credentials: &Credentials,
    ) -> Result<(), StoreError> {
        let stored = StoredCredentials::from_credentials(credentials);
        self.credentials.write().insert(primary.to_string(), stored);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_domains(&self) -> Result<Vec<String>, StoreError> {
        let mut domains: Vec<String> = self.credentials.read().keys().cloned().collect();
        domains.sort();
        Ok(domains)
    }

    fn save_account(&self, account: &AcmeAccount) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write();
        accounts.retain(|a| a.url != account.url);
        accounts.push(account.clone());
        Ok(())
    }

    fn load_accounts(&self) -> Result<Vec<AcmeAccount>, StoreError> {
        Ok(self.accounts.read().clone())
    }
}
