//! Managed domains and ACME accounts.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::credentials::Credentials;
use crate::error::{ConfigError, DriveError};
use crate::resources::{normalized, ChallengeKind};

/// Operator configured unit for which a certificate is kept current
///
/// Identity is the set of names regardless of order; the SAN list in the
/// CSR follows [`ManagedDomain::names`] order (primary first).
#[derive(Debug, Clone)]
pub struct ManagedDomain {
    /// Primary name, also the store key
    pub name: String,
    /// Additional names covered by the same certificate
    pub aliases: Vec<String>,
    /// Per-domain challenge preference, overriding the drive config
    pub challenge_types: Option<Vec<ChallengeKind>>,
    /// Current valid credentials, replaced only by a successful commit
    pub credentials: Option<Arc<Credentials>>,
    /// Outcome tracking across drive cycles
    pub renewal: RenewalStatus,
}

impl ManagedDomain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            challenge_types: None,
            credentials: None,
            renewal: RenewalStatus::default(),
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_challenge_types(mut self, types: Vec<ChallengeKind>) -> Self {
        self.challenge_types = Some(types);
        self
    }

    /// All names in SAN order: primary first, duplicates dropped
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(1 + self.aliases.len());
        for name in std::iter::once(&self.name).chain(self.aliases.iter()) {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Whether `names` is this domain's name set, ignoring order
    pub fn same_names(&self, names: &[String]) -> bool {
        normalized(&self.names()) == normalized(names)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.names().is_empty() {
            return Err(ConfigError::NoNames);
        }
        Ok(())
    }
}

/// Renewal bookkeeping surfaced to operators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenewalStatus {
    /// Consecutive failed cycles since the last success
    pub errors: u32,
    pub last_error: Option<LastError>,
    pub last_success: Option<DateTime<Utc>>,
}

/// The most recent failure of a drive cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    /// ACME problem URN or local `certdrive:` tag
    pub problem: String,
    pub detail: String,
    /// Phase tag the cycle was in
    pub phase: String,
    pub retryable: bool,
    pub at: DateTime<Utc>,
}

impl RenewalStatus {
    pub fn record_failure(&mut self, phase: &str, err: &DriveError) {
        self.errors = self.errors.saturating_add(1);
        self.last_error = Some(LastError {
            problem: err.problem_type(),
            detail: err.to_string(),
            phase: phase.to_string(),
            retryable: err.is_retryable(),
            at: Utc::now(),
        });
    }

    pub fn record_success(&mut self) {
        self.errors = 0;
        self.last_error = None;
        self.last_success = Some(Utc::now());
    }
}

/// External Account Binding credentials issued by the CA out of band
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccountBinding {
    /// Key identifier
    pub kid: String,
    /// Base64 or base64url encoded HMAC key
    pub hmac: String,
}

impl ExternalAccountBinding {
    /// Decoded HMAC key; accepts base64url or standard base64, padded or not
    pub fn hmac_bytes(&self) -> Option<Vec<u8>> {
        let raw = self.hmac.trim().trim_end_matches('=');
        if raw.is_empty() {
            return None;
        }
        URL_SAFE_NO_PAD
            .decode(raw)
            .or_else(|_| STANDARD_NO_PAD.decode(raw))
            .ok()
            .filter(|bytes| !bytes.is_empty())
    }
}

/// Parameters for registering an account
#[derive(Debug, Clone, Default)]
pub struct AccountRequest {
    /// Contact URIs, e.g. `mailto:admin@example.org`
    pub contacts: Vec<String>,
    pub agree_tos: bool,
    pub eab: Option<ExternalAccountBinding>,
}

/// A registered ACME account
///
/// Shared read-only across all drive cycles against the same server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeAccount {
    /// Account URL assigned by the server
    pub url: String,
    /// Directory URL of the server the account lives on
    pub directory: String,
    pub contacts: Vec<String>,
    pub tos_agreed: bool,
    /// EAB key id the account was bound with
    #[serde(default)]
    pub eab_kid: Option<String>,
    /// Serialized account key material, opaque to the driver
    pub key_material: String,
}
