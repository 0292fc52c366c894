//! Order authorization
//!
//! [`OrderDriver::authorize`] runs one [`AuthorizationMonitor`] per
//! authorization of an order concurrently. The first invalid or timed out
//! authorization ends the step; monitors still in flight are dropped and
//! their published proofs withdrawn through the shared [`ProofLedger`].

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info};

use crate::authz::{AuthorizationMonitor, AuthzOutcome, ProofLedger};
use crate::client::AcmeClient;
use crate::config::DriveConfig;
use crate::domain::AcmeAccount;
use crate::error::DriveError;
use crate::provision::ChallengeProvisioner;
use crate::resources::{ChallengeKind, Order};

pub struct OrderDriver<'a> {
    pub(crate) client: &'a dyn AcmeClient,
    pub(crate) provisioner: &'a dyn ChallengeProvisioner,
    pub(crate) account: &'a AcmeAccount,
    pub(crate) config: &'a DriveConfig,
    pub(crate) preference: &'a [ChallengeKind],
    /// Names the cycle asked for
    pub(crate) names: &'a [String],
}

impl OrderDriver<'_> {
    /// Succeeds once every authorization of `order` is valid
    pub async fn authorize(&self, order: &Order) -> Result<(), DriveError> {
        let ledger = ProofLedger::default();
        let monitor = AuthorizationMonitor {
            client: self.client,
            provisioner: self.provisioner,
            account: self.account,
            config: self.config,
            preference: self.preference,
            names: self.names,
            ledger: &ledger,
        };
        let timeout = self.config.authz_timeout();

        debug!(
            order = %order.url,
            authorizations = order.authorizations.len(),
            "Starting authorization monitors"
        );

        let result = {
            let monitor = &monitor;
            let mut in_flight: FuturesUnordered<_> = order
                .authorizations
                .iter()
                .map(|url| async move { monitor.resolve(url, timeout).await })
                .collect();

            let mut result = Ok(());
            while let Some(resolved) = in_flight.next().await {
                let failure = match resolved {
                    Ok(resolution) => match resolution.outcome {
                        AuthzOutcome::Valid => continue,
                        AuthzOutcome::Invalid { reason, problem } => {
                            DriveError::AuthorizationInvalid {
                                domain: resolution.domain,
                                reason,
                                problem,
                            }
                        }
                        AuthzOutcome::Timeout => DriveError::AuthorizationTimeout {
                            domain: resolution.domain,
                            after: timeout,
                        },
                    },
                    Err(e) => e,
                };
                if !in_flight.is_empty() {
                    debug!(abandoned = in_flight.len(), "Abandoning in-flight monitors");
                }
                result = Err(failure);
                break;
            }
            result
        };

        ledger
            .cleanup_all(self.provisioner, self.config.request_timeout())
            .await;

        if result.is_ok() {
            info!(
                order = %order.url,
                names = ?order.identifiers,
                "All authorizations valid"
            );
        }
        result
    }
}
