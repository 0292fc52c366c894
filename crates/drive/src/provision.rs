//! Challenge proof provisioning
//!
//! The driver never serves proofs itself. It hands a [`ChallengeProof`] to a
//! [`ChallengeProvisioner`] before triggering validation and asks for
//! cleanup once the authorization has resolved, whatever the outcome.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::error::ProvisionError;
use crate::resources::ChallengeKind;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Everything a provisioner needs to publish one proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeProof {
    /// Domain name being validated
    pub domain: String,
    pub kind: ChallengeKind,
    pub token: String,
    /// `token.thumbprint`, served verbatim for HTTP-01
    pub key_authorization: String,
    /// Digest of the key authorization, published as a DNS-01 TXT record
    pub dns_value: String,
}

impl ChallengeProof {
    /// Name of the TXT record a DNS-01 proof is published under
    pub fn dns_record_name(&self) -> String {
        format!("_acme-challenge.{}", self.domain.trim_start_matches("*."))
    }
}

/// Publishes and withdraws challenge proofs
#[async_trait]
pub trait ChallengeProvisioner: Send + Sync {
    /// Whether this provisioner can publish proofs of `kind`
    ///
    /// Challenge selection only considers kinds this returns `true` for.
    fn supports(&self, kind: &ChallengeKind) -> bool;

    /// Publish a proof so the ACME server can validate it
    ///
    /// Returns once the proof is ready to be validated. The driver bounds
    /// this call by the authorization timeout and withdraws the proof if it
    /// does not complete in time.
    ///
    /// # Arguments
    ///
    /// * `proof` - Token, key authorization and DNS digest for one challenge
    async fn publish(&self, proof: &ChallengeProof) -> Result<(), ProvisionError>;

    /// Withdraw a published proof
    ///
    /// Called once the authorization has resolved, whatever the outcome,
    /// and for proofs left behind by abandoned monitors. Withdrawing a proof
    /// that is already gone must succeed.
    ///
    /// # Arguments
    ///
    /// * `proof` - The proof previously handed to [`publish`](Self::publish)
    async fn cleanup(&self, proof: &ChallengeProof) -> Result<(), ProvisionError>;
}

/// In-memory HTTP-01 responder
///
/// Stores the token -> key authorization mapping so an embedding HTTP
/// server can answer `/.well-known/acme-challenge/<token>` requests.
///
/// # Thread Safety
///
/// Uses `DashMap` for lock-free concurrent access from request handlers.
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct Http01Responder {
    challenges: Arc<DashMap<String, String>>,
}

impl Http01Responder {
    /// Create a responder with no pending challenges
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the key authorization response for a challenge token
    ///
    /// Returns `Some(key_authorization)` if the token is pending,
    /// `None` otherwise.
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    /// Answer an HTTP request path
    ///
    /// Returns the body to serve when `path` is a challenge path for a
    /// pending token, `None` for every other path.
    ///
    /// # Arguments
    ///
    /// * `path` - Request path, e.g. `/.well-known/acme-challenge/<token>`
    pub fn respond(&self, path: &str) -> Option<String> {
        Self::extract_token(path).and_then(|token| self.get_response(token))
    }

    /// Check if this is an ACME challenge request path
    ///
    /// Returns `Some(token)` if the path matches the challenge prefix,
    /// `None` otherwise.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    /// Get the number of pending challenges
    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }
}

#[async_trait]
impl ChallengeProvisioner for Http01Responder {
    fn supports(&self, kind: &ChallengeKind) -> bool {
        *kind == ChallengeKind::Http01
    }

    async fn publish(&self, proof: &ChallengeProof) -> Result<(), ProvisionError> {
        if !self.supports(&proof.kind) {
            return Err(ProvisionError::Unsupported(proof.kind.to_string()));
        }
        debug!(domain = %proof.domain, token = %proof.token, "Registering HTTP-01 challenge");
        self.challenges
            .insert(proof.token.clone(), proof.key_authorization.clone());
        Ok(())
    }

    async fn cleanup(&self, proof: &ChallengeProof) -> Result<(), ProvisionError> {
        if self.challenges.remove(&proof.token).is_some() {
            debug!(domain = %proof.domain, token = %proof.token, "Removed HTTP-01 challenge");
        }
        Ok(())
    }
}

/// Writes HTTP-01 proofs below a directory served by an existing web server
///
/// Each proof becomes `<webroot>/.well-known/acme-challenge/<token>`
/// holding the key authorization. Tokens outside the base64url alphabet
/// are refused so a proof can never be written outside that directory.
#[derive(Debug, Clone)]
pub struct WebrootProvisioner {
    webroot: PathBuf,
}

impl WebrootProvisioner {
    /// Create a provisioner writing below `webroot`
    ///
    /// The challenge directory is created on first publish.
    ///
    /// # Arguments
    ///
    /// * `webroot` - Document root of the web server answering port 80
    pub fn new(webroot: impl Into<PathBuf>) -> Self {
        Self {
            webroot: webroot.into(),
        }
    }

    fn challenge_dir(&self) -> PathBuf {
        self.webroot.join(".well-known").join("acme-challenge")
    }

    fn token_path(&self, token: &str) -> Result<PathBuf, ProvisionError> {
        // tokens are base64url; anything else could escape the directory
        let safe = !token.is_empty()
            && token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !safe {
            return Err(ProvisionError::Publish(format!(
                "refusing unsafe challenge token {token:?}"
            )));
        }
        Ok(self.challenge_dir().join(token))
    }

    /// Document root proofs are written below
    pub fn webroot(&self) -> &Path {
        &self.webroot
    }
}

#[async_trait]
impl ChallengeProvisioner for WebrootProvisioner {
    fn supports(&self, kind: &ChallengeKind) -> bool {
        *kind == ChallengeKind::Http01
    }

    async fn publish(&self, proof: &ChallengeProof) -> Result<(), ProvisionError> {
        if !self.supports(&proof.kind) {
            return Err(ProvisionError::Unsupported(proof.kind.to_string()));
        }
        let path = self.token_path(&proof.token)?;
        tokio::fs::create_dir_all(self.challenge_dir()).await?;
        tokio::fs::write(&path, proof.key_authorization.as_bytes()).await?;
        debug!(domain = %proof.domain, path = %path.display(), "Wrote HTTP-01 proof");
        Ok(())
    }

    async fn cleanup(&self, proof: &ChallengeProof) -> Result<(), ProvisionError> {
        let path = self.token_path(&proof.token)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove HTTP-01 proof");
                Err(e.into())
            }
        }
    }
}
