//! Authorization monitoring
//!
//! One [`AuthorizationMonitor`] drives a single authorization: pick a
//! challenge, have its proof published, trigger validation and poll until
//! the authorization is terminal or the monitor's deadline passes.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::client::AcmeClient;
use crate::config::DriveConfig;
use crate::domain::AcmeAccount;
use crate::drive::Phase;
use crate::error::{AcmeProblem, DriveError};
use crate::poll::{bounded, Backoff, Deadline, Poller};
use crate::provision::{ChallengeProof, ChallengeProvisioner};
use crate::resources::{Authorization, AuthorizationStatus, Challenge, ChallengeKind, ChallengeStatus};

/// How an authorization resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzOutcome {
    Valid,
    Invalid {
        reason: String,
        problem: Option<AcmeProblem>,
    },
    Timeout,
}

/// Outcome of one monitor, tagged with the domain it was for
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Target domain, or the authorization URL if it was never fetched
    pub domain: String,
    pub outcome: AuthzOutcome,
}

/// Proofs published and not yet cleaned up
///
/// Monitors abandoned mid-flight never reach their own cleanup; whoever
/// owns the ledger withdraws what is left.
#[derive(Debug, Clone, Default)]
pub struct ProofLedger {
    live: Arc<Mutex<Vec<ChallengeProof>>>,
}

impl ProofLedger {
    fn record(&self, proof: &ChallengeProof) {
        self.live.lock().push(proof.clone());
    }

    fn forget(&self, proof: &ChallengeProof) {
        self.live.lock().retain(|p| p != proof);
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Withdraw every proof still recorded, each cleanup bounded by `limit`
    pub async fn cleanup_all(&self, provisioner: &dyn ChallengeProvisioner, limit: Duration) {
        let leftover = std::mem::take(&mut *self.live.lock());
        for proof in leftover {
            withdraw(provisioner, &proof, limit).await;
        }
    }
}

async fn withdraw(provisioner: &dyn ChallengeProvisioner, proof: &ChallengeProof, limit: Duration) {
    match tokio::time::timeout(limit, provisioner.cleanup(proof)).await {
        Ok(Ok(())) => trace!(domain = %proof.domain, token = %proof.token, "Proof withdrawn"),
        Ok(Err(e)) => warn!(
            domain = %proof.domain,
            challenge_type = %proof.kind,
            error = %e,
            "Failed to clean up challenge proof"
        ),
        Err(_) => warn!(
            domain = %proof.domain,
            challenge_type = %proof.kind,
            timeout_ms = limit.as_millis() as u64,
            "Challenge proof cleanup timed out"
        ),
    }
}

/// Pick the first preferred challenge type that is offered and publishable
pub fn select_challenge<'a>(
    authz: &'a Authorization,
    preference: &[ChallengeKind],
    provisioner: &dyn ChallengeProvisioner,
) -> Option<&'a Challenge> {
    preference
        .iter()
        .filter(|kind| provisioner.supports(kind))
        .find_map(|kind| authz.challenges.iter().find(|c| &c.kind == kind))
}

/// Drives single authorizations to a terminal state
pub struct AuthorizationMonitor<'a> {
    pub(crate) client: &'a dyn AcmeClient,
    pub(crate) provisioner: &'a dyn ChallengeProvisioner,
    pub(crate) account: &'a AcmeAccount,
    pub(crate) config: &'a DriveConfig,
    pub(crate) preference: &'a [ChallengeKind],
    /// Names of the cycle; an authorization for anything else is refused
    pub(crate) names: &'a [String],
    pub(crate) ledger: &'a ProofLedger,
}

impl AuthorizationMonitor<'_> {
    /// Resolve the authorization at `url` within `timeout`
    ///
    /// Everything the monitor waits on, publishing the proof included,
    /// counts against `timeout`. Errors are reserved for failures that are
    /// not a verdict on the authorization itself: an authorization for a
    /// name outside the cycle, no usable challenge, a proof that could not
    /// be published, or a non-transient server problem.
    pub async fn resolve(&self, url: &str, timeout: Duration) -> Result<Resolution, DriveError> {
        let deadline = Deadline::after(timeout);
        let mut status_checks = Poller::new(Backoff::from_config(self.config), deadline);

        let Some(authz) = self.fetch(url, &mut status_checks).await? else {
            return Ok(Resolution {
                domain: url.to_string(),
                outcome: AuthzOutcome::Timeout,
            });
        };
        let domain = authz.domain.clone();

        if !self.names.iter().any(|name| name.eq_ignore_ascii_case(&domain)) {
            return Err(DriveError::Unexpected {
                phase: Phase::Authorizing,
                message: format!("authorization {url} is for {domain}, which was not requested"),
            });
        }

        if authz.status.is_terminal() {
            debug!(domain = %domain, status = authz.status.as_str(), "Authorization already terminal");
            return Ok(Resolution {
                outcome: verdict(&authz),
                domain,
            });
        }

        let challenge = select_challenge(&authz, self.preference, self.provisioner)
            .ok_or_else(|| DriveError::NoSupportedChallenge {
                domain: domain.clone(),
                offered: authz.challenges.iter().map(|c| c.kind.to_string()).collect(),
            })?
            .clone();

        let Some(proof) = self.publish(&authz, &challenge, deadline).await? else {
            warn!(
                domain = %domain,
                challenge_type = %challenge.kind,
                timeout_secs = timeout.as_secs(),
                "Challenge proof not published in time"
            );
            return Ok(Resolution {
                domain,
                outcome: AuthzOutcome::Timeout,
            });
        };

        let outcome = self
            .validate(url, &challenge, deadline, &mut status_checks)
            .await;

        withdraw(self.provisioner, &proof, self.config.request_timeout()).await;
        self.ledger.forget(&proof);

        let outcome = outcome?;
        match &outcome {
            AuthzOutcome::Valid => info!(
                domain = %domain,
                challenge_type = %challenge.kind,
                checks = status_checks.checks(),
                elapsed_ms = deadline.elapsed().as_millis() as u64,
                "Authorization valid"
            ),
            AuthzOutcome::Invalid { reason, .. } => warn!(
                domain = %domain,
                challenge_type = %challenge.kind,
                reason = %reason,
                "Authorization invalid"
            ),
            AuthzOutcome::Timeout => warn!(
                domain = %domain,
                timeout_secs = timeout.as_secs(),
                "Authorization not resolved in time"
            ),
        }
        Ok(Resolution { domain, outcome })
    }

    /// Fetch the authorization at the next due status check, riding out
    /// transient failures. `None` once the deadline has passed.
    async fn fetch(
        &self,
        url: &str,
        poller: &mut Poller,
    ) -> Result<Option<Authorization>, DriveError> {
        while poller.tick().await {
            let limit = poller.call_timeout(self.config.request_timeout());
            match bounded(limit, self.client.get_authorization(self.account, url)).await {
                Ok(authz) => return Ok(Some(authz)),
                Err(e) if e.is_transient() => {
                    debug!(authorization = %url, error = %e, "Transient failure polling authorization");
                }
                Err(e) => return Err(DriveError::from_client(Phase::Authorizing, e)),
            }
        }
        Ok(None)
    }

    /// Derive and publish the proof for `challenge`
    ///
    /// `None` when the provisioner is still busy at the deadline; whatever
    /// it managed to put in place is withdrawn before returning.
    async fn publish(
        &self,
        authz: &Authorization,
        challenge: &Challenge,
        deadline: Deadline,
    ) -> Result<Option<ChallengeProof>, DriveError> {
        let limit = self.config.request_timeout().min(deadline.remaining());
        let proof = bounded(limit, self.client.challenge_proof(self.account, authz, challenge))
            .await
            .map_err(|e| DriveError::from_client(Phase::Authorizing, e))?;

        match tokio::time::timeout(deadline.remaining(), self.provisioner.publish(&proof)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(DriveError::ProvisioningFailed {
                    domain: authz.domain.clone(),
                    challenge_type: challenge.kind.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                withdraw(self.provisioner, &proof, self.config.request_timeout()).await;
                return Ok(None);
            }
        }
        self.ledger.record(&proof);
        debug!(domain = %authz.domain, challenge_type = %challenge.kind, "Challenge proof published");
        Ok(Some(proof))
    }

    /// Trigger the challenge if needed, then poll until terminal
    async fn validate(
        &self,
        url: &str,
        challenge: &Challenge,
        deadline: Deadline,
        status_checks: &mut Poller,
    ) -> Result<AuthzOutcome, DriveError> {
        if challenge.status == ChallengeStatus::Pending {
            let mut attempts = Poller::new(Backoff::from_config(self.config), deadline);
            loop {
                if !attempts.tick().await {
                    return Ok(AuthzOutcome::Timeout);
                }
                let limit = attempts.call_timeout(self.config.request_timeout());
                match bounded(limit, self.client.trigger_challenge(self.account, &challenge.url)).await {
                    Ok(()) => break,
                    Err(e) if e.is_transient() => {
                        debug!(challenge = %challenge.url, error = %e, "Transient failure triggering challenge");
                    }
                    Err(e) => return Err(DriveError::from_client(Phase::Authorizing, e)),
                }
            }
            debug!(challenge = %challenge.url, challenge_type = %challenge.kind, "Challenge triggered");
        }

        loop {
            let Some(authz) = self.fetch(url, status_checks).await? else {
                return Ok(AuthzOutcome::Timeout);
            };
            trace!(
                domain = %authz.domain,
                status = authz.status.as_str(),
                checks = status_checks.checks(),
                "Polled authorization"
            );
            if authz.status.is_terminal() {
                return Ok(verdict(&authz));
            }
        }
    }
}

fn verdict(authz: &Authorization) -> AuthzOutcome {
    match authz.status {
        AuthorizationStatus::Valid => AuthzOutcome::Valid,
        _ => {
            let (reason, problem) = authz.failure_reason();
            AuthzOutcome::Invalid { reason, problem }
        }
    }
}
