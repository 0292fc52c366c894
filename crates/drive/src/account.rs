//! Account registration and reuse
//!
//! Accounts are created once per ACME server and shared read-only by every
//! drive cycle against that server. [`AccountBook`] finds a stored account
//! matching a request before registering a new one, so managed domains that
//! share a directory and EAB key id share one account.

use std::sync::Arc;

use tracing::{debug, info};

use crate::client::AcmeClient;
use crate::config::DriveConfig;
use crate::domain::{AccountRequest, AcmeAccount};
use crate::drive::Phase;
use crate::error::{AcmeProblem, DriveError};
use crate::poll::retry_transient;
use crate::store::CredentialStore;

/// Check a request locally; nothing here is ever sent to the server
fn check_request(request: &AccountRequest) -> Result<(), DriveError> {
    if !request.agree_tos {
        return Err(DriveError::Local(AcmeProblem::local(
            "tos-not-accepted",
            "the CA's terms of service must be accepted before registering",
        )));
    }
    if let Some(eab) = &request.eab {
        if eab.kid.trim().is_empty() {
            return Err(DriveError::Local(AcmeProblem::local(
                "eab-kid-missing",
                "external account binding needs a key id",
            )));
        }
        if eab.hmac_bytes().is_none() {
            return Err(DriveError::Local(AcmeProblem::local(
                "eab-hmac-invalid",
                "external account binding HMAC is not base64 or base64url",
            )));
        }
    }
    Ok(())
}

/// Register a new account with the server behind `client`
pub async fn register_account(
    client: &dyn AcmeClient,
    request: &AccountRequest,
    config: &DriveConfig,
) -> Result<AcmeAccount, DriveError> {
    check_request(request)?;

    let account = retry_transient(config, "new-account", || client.new_account(request))
        .await
        .map_err(|e| DriveError::from_client(Phase::AccountSetup, e))?;

    info!(
        account = %account.url,
        directory = %account.directory,
        eab = account.eab_kid.is_some(),
        "Account registered"
    );
    Ok(account)
}

/// Stored accounts, reused across domains and restarts
pub struct AccountBook {
    client: Arc<dyn AcmeClient>,
    store: Arc<dyn CredentialStore>,
    config: DriveConfig,
}

impl AccountBook {
    pub fn new(
        client: Arc<dyn AcmeClient>,
        store: Arc<dyn CredentialStore>,
        config: DriveConfig,
    ) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    /// Whether a stored account can serve `request` on this client's server
    fn matches(&self, account: &AcmeAccount, request: &AccountRequest) -> bool {
        account.directory == self.client.directory_url()
            && account.tos_agreed
            && account.eab_kid.as_deref() == request.eab.as_ref().map(|eab| eab.kid.as_str())
    }

    /// A stored account matching `request`, registering one if none does
    pub async fn obtain(&self, request: &AccountRequest) -> Result<AcmeAccount, DriveError> {
        check_request(request)?;

        let stored = self.store.load_accounts()?;
        if let Some(account) = stored.into_iter().find(|a| self.matches(a, request)) {
            debug!(account = %account.url, "Reusing stored account");
            return Ok(account);
        }

        let account = register_account(self.client.as_ref(), request, &self.config).await?;
        self.store.save_account(&account)?;
        Ok(account)
    }
}

impl std::fmt::Debug for AccountBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountBook")
            .field("directory", &self.client.directory_url())
            .finish()
    }
}
