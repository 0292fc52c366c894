//! certdrive: ACME certificate issuance driver
//!
//! certdrive keeps X.509 certificates for server-managed domains current
//! through the ACME protocol. The center is the drive cycle: for one
//! managed domain it binds an account, creates an order, gets every
//! authorization validated, finalizes with a fresh key, waits for
//! issuance, assembles the chain and commits the validated credentials.
//!
//! # Collaborators
//!
//! The driver does not speak ACME on the wire, serve challenge proofs or
//! persist anything itself. It works through three seams:
//!
//! - [`AcmeClient`]: calls to the ACME server ([`InstantAcmeClient`] wraps
//!   `instant-acme`)
//! - [`ChallengeProvisioner`]: publishes and withdraws challenge proofs
//!   ([`Http01Responder`], [`WebrootProvisioner`])
//! - [`CredentialStore`]: receives committed credentials and holds accounts
//!   ([`FileCredentialStore`], [`MemoryCredentialStore`])
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certdrive::{
//!     AccountBook, AccountRequest, DriveConfig, DriveController, FileCredentialStore,
//!     Http01Responder, InstantAcmeClient, ManagedDomain,
//! };
//!
//! let client = Arc::new(InstantAcmeClient::new(certdrive::client::LETS_ENCRYPT_STAGING));
//! let store = Arc::new(FileCredentialStore::new("/var/lib/certdrive".as_ref())?);
//! let responder = Arc::new(Http01Responder::new());
//!
//! let book = AccountBook::new(client.clone(), store.clone(), DriveConfig::default());
//! let account = book
//!     .obtain(&AccountRequest {
//!         contacts: vec!["mailto:ops@example.org".into()],
//!         agree_tos: true,
//!         eab: None,
//!     })
//!     .await?;
//!
//! let controller = DriveController::new(client, responder, store, DriveConfig::default());
//! let mut domain = ManagedDomain::new("example.org").with_aliases(["www.example.org"]);
//! let credentials = controller.drive(&mut domain, &account).await?;
//! ```

pub mod account;
pub mod authz;
pub mod chain;
pub mod client;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod drive;
pub mod error;
pub mod order;
pub mod poll;
pub mod provision;
pub mod resources;
pub mod store;

#[cfg(test)]
mod testing;

pub use account::{register_account, AccountBook};
pub use authz::{AuthorizationMonitor, AuthzOutcome, ProofLedger, Resolution};
pub use chain::{fetch_chain, ChainFetch};
pub use client::{AcmeClient, InstantAcmeClient};
pub use config::{DriveConfig, MIN_POLL_INTERVAL};
pub use credentials::{
    CertificateChain, CertificateSummary, Credentials, CsrMaterial, FreshKeys, KeySource,
    KeySpec, PrivateKey,
};
pub use domain::{
    AccountRequest, AcmeAccount, ExternalAccountBinding, LastError, ManagedDomain, RenewalStatus,
};
pub use drive::{DriveContext, DriveController, DriveProgress, Phase};
pub use error::{
    AcmeProblem, ClientError, ConfigError, DriveError, ErrorClass, ProvisionError, StoreError,
};
pub use order::OrderDriver;
pub use provision::{ChallengeProof, ChallengeProvisioner, Http01Responder, WebrootProvisioner};
pub use resources::{
    Authorization, AuthorizationStatus, CertificateDownload, Challenge, ChallengeKind,
    ChallengeStatus, Order, OrderStatus,
};
pub use store::{
    CredentialMeta, CredentialStore, FileCredentialStore, MemoryCredentialStore,
    StoredCredentials,
};
