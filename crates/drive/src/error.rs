//! Error types for certificate drive cycles.
//!
//! Errors fall into two classes. Retryable errors mean a later drive cycle
//! may succeed without operator action (transport trouble, rate limits,
//! timeouts, cancellation). Fatal errors mean the cycle cannot succeed as
//! configured (an authorization the CA rejected, a broken chain, a local
//! validation failure).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::drive::Phase;

/// ACME problem type prefix (RFC 8555 section 6.7)
pub const ACME_PROBLEM_PREFIX: &str = "urn:ietf:params:acme:error:";

/// Prefix for problems detected locally, never reported by a server
pub const LOCAL_PROBLEM_PREFIX: &str = "certdrive:";

/// A structured problem document returned by the ACME server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeProblem {
    /// Problem type URN, e.g. `urn:ietf:params:acme:error:rateLimited`
    pub problem_type: String,
    /// Human readable detail text
    pub detail: String,
}

impl AcmeProblem {
    pub fn new(problem_type: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            problem_type: problem_type.into(),
            detail: detail.into(),
        }
    }

    /// Build a problem in the ACME namespace from its short name
    pub fn acme(short: &str, detail: impl Into<String>) -> Self {
        Self::new(format!("{ACME_PROBLEM_PREFIX}{short}"), detail)
    }

    /// Build a locally detected problem
    pub fn local(short: &str, detail: impl Into<String>) -> Self {
        Self::new(format!("{LOCAL_PROBLEM_PREFIX}{short}"), detail)
    }

    /// Short name of the problem type with the ACME prefix stripped
    pub fn short_type(&self) -> &str {
        self.problem_type
            .strip_prefix(ACME_PROBLEM_PREFIX)
            .unwrap_or(&self.problem_type)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.short_type() == "rateLimited"
    }

    /// Problems a server may return for a request that can simply be sent again
    pub fn is_transient(&self) -> bool {
        matches!(self.short_type(), "badNonce" | "serverInternal")
    }

    /// Problems that mean the account itself is not usable
    pub fn is_account_failure(&self) -> bool {
        matches!(
            self.short_type(),
            "unauthorized"
                | "accountDoesNotExist"
                | "externalAccountRequired"
                | "userActionRequired"
                | "badPublicKey"
        )
    }
}

impl fmt::Display for AcmeProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.problem_type)
        } else {
            write!(f, "{}: {}", self.problem_type, self.detail)
        }
    }
}

/// Errors reported by an [`AcmeClient`](crate::client::AcmeClient) call
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Connection failure, 5xx, or a timed out request
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a problem document
    #[error("ACME problem: {0}")]
    Problem(AcmeProblem),

    /// The server answered with something the facade could not interpret
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl ClientError {
    /// Whether the call may be repeated within the current polling budget
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Problem(problem) => problem.is_transient(),
            ClientError::Unexpected(_) => false,
        }
    }
}

/// Errors reported by a challenge provisioning collaborator
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("challenge type {0} is not supported by this provisioner")]
    Unsupported(String),

    #[error("failed to publish challenge proof: {0}")]
    Publish(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a credential store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt store entry {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Invalid drive configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("no challenge types configured")]
    NoChallengeTypes,

    #[error("managed domain has no names")]
    NoNames,
}

/// How a failed drive cycle should be treated by its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A later drive cycle may succeed; schedule another attempt
    Retryable,
    /// The cycle cannot succeed as configured
    Fatal,
}

/// Why a drive cycle failed
#[derive(Debug, Error)]
pub enum DriveError {
    /// The account could not be bound (bad key, missing EAB, revoked)
    #[error("account rejected: {0}")]
    AccountRejected(AcmeProblem),

    /// Transient network failures persisted past the phase budget
    #[error("transport failure during {phase}: {message}")]
    Transport { phase: Phase, message: String },

    /// The server rate limited us; retry in a later cycle
    #[error("rate limited: {0}")]
    RateLimited(AcmeProblem),

    /// The server reported a problem not covered by a more specific variant
    #[error("server problem during {phase}: {problem}")]
    Protocol { phase: Phase, problem: AcmeProblem },

    /// The server returned something the driver cannot work with
    #[error("unexpected server response during {phase}: {message}")]
    Unexpected { phase: Phase, message: String },

    /// An order's identifiers do not match the managed domain's names
    #[error("order {url} covers {actual:?}, expected {expected:?}")]
    OrderMismatch {
        url: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// None of the offered challenges is of a configured type
    #[error("no supported challenge for {domain}, offered: {offered:?}")]
    NoSupportedChallenge { domain: String, offered: Vec<String> },

    /// The provisioning collaborator could not publish the proof
    #[error("failed to provision {challenge_type} proof for {domain}: {reason}")]
    ProvisioningFailed {
        domain: String,
        challenge_type: String,
        reason: String,
    },

    /// An authorization terminally resolved invalid
    #[error("authorization for {domain} invalid: {reason}")]
    AuthorizationInvalid {
        domain: String,
        reason: String,
        problem: Option<AcmeProblem>,
    },

    /// An authorization did not resolve within the monitor timeout
    #[error("authorization for {domain} not resolved after {after:?}")]
    AuthorizationTimeout { domain: String, after: Duration },

    /// The order became invalid
    #[error("order invalid: {reason}")]
    OrderInvalid {
        reason: String,
        problem: Option<AcmeProblem>,
    },

    /// The server refused the CSR
    #[error("finalize rejected: {0}")]
    FinalizeRejected(AcmeProblem),

    /// The order did not become valid within the certificate poll timeout
    #[error("certificate not issued after {0:?}")]
    CertificateTimeout(Duration),

    /// A certificate or chain link could not be fetched
    #[error("certificate chain fetch failed: {0}")]
    ChainFetch(String),

    /// The chain kept supplying links past the hop cap
    #[error("certificate chain exceeds {max_hops} hops")]
    ChainTooLong { max_hops: usize },

    /// Key, CSR or chain failed local checks
    #[error("validation failed: {0}")]
    Validation(String),

    /// A local precondition failed before contacting the server
    #[error("{0}")]
    Local(AcmeProblem),

    /// The persistence collaborator refused the credentials
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The cycle was cancelled at a phase boundary
    #[error("drive cancelled before {phase}")]
    Cancelled { phase: Phase },
}

impl DriveError {
    /// Map a facade error raised during `phase` to a cycle error
    pub fn from_client(phase: Phase, err: ClientError) -> Self {
        match err {
            ClientError::Transport(message) => DriveError::Transport { phase, message },
            ClientError::Problem(problem) if problem.is_rate_limited() => {
                DriveError::RateLimited(problem)
            }
            ClientError::Problem(problem) if problem.is_transient() => DriveError::Transport {
                phase,
                message: problem.to_string(),
            },
            ClientError::Problem(problem) => match phase {
                Phase::AccountSetup if problem.is_account_failure() => {
                    DriveError::AccountRejected(problem)
                }
                Phase::Finalizing => DriveError::FinalizeRejected(problem),
                _ => DriveError::Protocol { phase, problem },
            },
            ClientError::Unexpected(message) => DriveError::Unexpected { phase, message },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DriveError::Transport { .. }
            | DriveError::RateLimited(_)
            | DriveError::AuthorizationTimeout { .. }
            | DriveError::CertificateTimeout(_)
            | DriveError::Cancelled { .. }
            | DriveError::Store(_) => ErrorClass::Retryable,
            DriveError::Protocol { problem, .. } if problem.is_transient() => {
                ErrorClass::Retryable
            }
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Server problem behind this error, if the server supplied one
    pub fn problem(&self) -> Option<&AcmeProblem> {
        match self {
            DriveError::AccountRejected(p)
            | DriveError::RateLimited(p)
            | DriveError::FinalizeRejected(p)
            | DriveError::Local(p)
            | DriveError::Protocol { problem: p, .. } => Some(p),
            DriveError::AuthorizationInvalid { problem, .. }
            | DriveError::OrderInvalid { problem, .. } => problem.as_ref(),
            _ => None,
        }
    }

    /// Problem type identifier for status reporting
    ///
    /// Server problems keep their URN; everything else gets a stable
    /// `certdrive:` tag.
    pub fn problem_type(&self) -> String {
        if let Some(problem) = self.problem() {
            return problem.problem_type.clone();
        }
        let tag = match self {
            DriveError::Transport { .. } => "transport",
            DriveError::Unexpected { .. } => "unexpected-response",
            DriveError::OrderMismatch { .. } => "order-mismatch",
            DriveError::NoSupportedChallenge { .. } => "challenge-mismatch",
            DriveError::ProvisioningFailed { .. } => "challenge-setup-failed",
            DriveError::AuthorizationInvalid { .. } => "authz-invalid",
            DriveError::AuthorizationTimeout { .. } => "authz-timeout",
            DriveError::OrderInvalid { .. } => "order-invalid",
            DriveError::CertificateTimeout(_) => "cert-timeout",
            DriveError::ChainFetch(_) => "chain-fetch-failed",
            DriveError::ChainTooLong { .. } => "chain-too-long",
            DriveError::Validation(_) => "validation-failed",
            DriveError::Store(_) => "store-failed",
            DriveError::Config(_) => "config-invalid",
            DriveError::Cancelled { .. } => "cancelled",
            _ => "error",
        };
        format!("{LOCAL_PROBLEM_PREFIX}{tag}")
    }
}
