//! Configuration for drive cycles.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::credentials::KeySpec;
use crate::error::ConfigError;
use crate::resources::ChallengeKind;

/// Floor for any status polling interval.
///
/// ACME servers rate limit aggressive pollers; no status check for the same
/// resource is ever issued closer than this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timing and policy knobs for one drive cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Budget for each authorization monitor
    #[serde(default = "default_authz_timeout_secs")]
    pub authz_timeout_secs: u64,

    /// Budget for waiting on the order to become ready, then valid
    #[serde(default = "default_cert_poll_timeout_secs")]
    pub cert_poll_timeout_secs: u64,

    /// First delay between status checks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound for the backoff delay
    #[serde(default = "default_max_poll_interval_secs")]
    pub max_poll_interval_secs: u64,

    /// Multiplier applied to the delay after each unresolved check
    #[serde(default = "default_poll_backoff_factor")]
    pub poll_backoff_factor: u32,

    /// Cap for single calls made outside a polling loop
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Budget for retrying transient failures of a single call
    #[serde(default = "default_call_budget_secs")]
    pub call_budget_secs: u64,

    /// Maximum number of chain links followed after the leaf download
    #[serde(default = "default_max_chain_hops")]
    pub max_chain_hops: usize,

    /// Challenge types in order of preference
    #[serde(default = "default_challenge_types")]
    pub challenge_types: Vec<ChallengeKind>,

    /// Algorithm of the fresh certificate key
    #[serde(default)]
    pub key_spec: KeySpec,
}

fn default_authz_timeout_secs() -> u64 { 600 }
fn default_cert_poll_timeout_secs() -> u64 { 600 }
fn default_poll_interval_secs() -> u64 { 2 }
fn default_max_poll_interval_secs() -> u64 { 30 }
fn default_poll_backoff_factor() -> u32 { 2 }
fn default_request_timeout_secs() -> u64 { 60 }
fn default_call_budget_secs() -> u64 { 180 }
fn default_max_chain_hops() -> usize { 10 }
fn default_challenge_types() -> Vec<ChallengeKind> {
    vec![ChallengeKind::Http01, ChallengeKind::TlsAlpn01, ChallengeKind::Dns01]
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            authz_timeout_secs: default_authz_timeout_secs(),
            cert_poll_timeout_secs: default_cert_poll_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_interval_secs: default_max_poll_interval_secs(),
            poll_backoff_factor: default_poll_backoff_factor(),
            request_timeout_secs: default_request_timeout_secs(),
            call_budget_secs: default_call_budget_secs(),
            max_chain_hops: default_max_chain_hops(),
            challenge_types: default_challenge_types(),
            key_spec: KeySpec::default(),
        }
    }
}

impl DriveConfig {
    pub fn authz_timeout(&self) -> Duration {
        Duration::from_secs(self.authz_timeout_secs)
    }

    pub fn cert_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.cert_poll_timeout_secs)
    }

    /// First poll delay, never below [`MIN_POLL_INTERVAL`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs).max(MIN_POLL_INTERVAL)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs(self.max_poll_interval_secs).max(self.poll_interval())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Never shorter than a single request
    pub fn call_budget(&self) -> Duration {
        Duration::from_secs(self.call_budget_secs).max(self.request_timeout())
    }

    /// Check the configuration for values that would make a cycle unable to finish
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.authz_timeout_secs == 0 {
            return Err(ConfigError::Zero { field: "authz_timeout_secs" });
        }
        if self.cert_poll_timeout_secs == 0 {
            return Err(ConfigError::Zero { field: "cert_poll_timeout_secs" });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Zero { field: "request_timeout_secs" });
        }
        if self.poll_backoff_factor == 0 {
            return Err(ConfigError::Zero { field: "poll_backoff_factor" });
        }
        if self.max_chain_hops == 0 {
            return Err(ConfigError::Zero { field: "max_chain_hops" });
        }
        if self.challenge_types.is_empty() {
            return Err(ConfigError::NoChallengeTypes);
        }
        Ok(())
    }
}
