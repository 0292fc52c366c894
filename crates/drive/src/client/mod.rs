//! ACME client facade
//!
//! The driver talks to the ACME server only through [`AcmeClient`]. Wire
//! encoding, nonces and request signing belong to the implementation;
//! the driver sees the abstract resources in [`crate::resources`].
//!
//! No call carries an implicit timeout. Callers bound every call with
//! their own budget (see [`crate::poll`]).

mod instant;

pub use instant::{InstantAcmeClient, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};

use async_trait::async_trait;

use crate::domain::{AccountRequest, AcmeAccount};
use crate::error::ClientError;
use crate::provision::ChallengeProof;
use crate::resources::{Authorization, CertificateDownload, Challenge, Order};

/// Call interface to one ACME server
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Directory URL of the server this client talks to
    fn directory_url(&self) -> &str;

    /// Register a new account
    async fn new_account(&self, request: &AccountRequest) -> Result<AcmeAccount, ClientError>;

    /// Check that the server still accepts `account`
    async fn verify_account(&self, account: &AcmeAccount) -> Result<(), ClientError>;

    /// Create an order for exactly `names`
    async fn new_order(&self, account: &AcmeAccount, names: &[String])
        -> Result<Order, ClientError>;

    /// Fetch the current state of an order
    async fn get_order(&self, account: &AcmeAccount, url: &str) -> Result<Order, ClientError>;

    /// Fetch the current state of an authorization
    async fn get_authorization(
        &self,
        account: &AcmeAccount,
        url: &str,
    ) -> Result<Authorization, ClientError>;

    /// Compute the proof the provisioner must publish for `challenge`
    async fn challenge_proof(
        &self,
        account: &AcmeAccount,
        authorization: &Authorization,
        challenge: &Challenge,
    ) -> Result<ChallengeProof, ClientError>;

    /// Tell the server the proof is published and validation may begin
    async fn trigger_challenge(
        &self,
        account: &AcmeAccount,
        challenge_url: &str,
    ) -> Result<(), ClientError>;

    /// Submit the DER encoded CSR to the order's finalize URL
    async fn finalize_order(
        &self,
        account: &AcmeAccount,
        order: &Order,
        csr_der: &[u8],
    ) -> Result<Order, ClientError>;

    /// Download a certificate or a chain link
    async fn download_certificate(
        &self,
        account: &AcmeAccount,
        url: &str,
    ) -> Result<CertificateDownload, ClientError>;

    /// Forget any client side state held for an order
    ///
    /// Called when a drive cycle ends with the order, success or failure.
    async fn release_order(&self, _order_url: &str) {}
}
