//! Drive controller
//!
//! A drive cycle takes one managed domain from nothing to committed
//! credentials. The per-cycle state lives in a [`DriveContext`] that is
//! passed by value through the phases: [`DriveController::advance`] runs
//! the context's current phase and hands back the context at the next one.
//! Only the commit phase writes anything outside the context, so a cycle
//! that fails or is cancelled leaves the domain's credentials untouched.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::chain::fetch_chain;
use crate::client::AcmeClient;
use crate::config::DriveConfig;
use crate::credentials::{CertificateChain, Credentials, CsrMaterial, FreshKeys, KeySource};
use crate::domain::{AcmeAccount, ManagedDomain};
use crate::error::{AcmeProblem, DriveError};
use crate::order::OrderDriver;
use crate::poll::{bounded, retry_transient, Backoff, Deadline, Poller};
use crate::provision::ChallengeProvisioner;
use crate::resources::{ChallengeKind, Order, OrderStatus};
use crate::store::CredentialStore;

/// Orders created per cycle before an unusable one fails the cycle
const ORDER_ATTEMPTS: u32 = 2;

/// Drive cycle phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    AccountSetup,
    OrderSetup,
    Authorizing,
    Finalizing,
    PollingCert,
    ChainFetch,
    Commit,
    Done,
}

impl Phase {
    /// Stable tag used in progress reports and status records
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::AccountSetup => "account-setup",
            Phase::OrderSetup => "order-setup",
            Phase::Authorizing => "authorizing",
            Phase::Finalizing => "finalizing",
            Phase::PollingCert => "polling-cert",
            Phase::ChainFetch => "chain-fetch",
            Phase::Commit => "commit",
            Phase::Done => "done",
        }
    }

    pub fn next(self) -> Phase {
        match self {
            Phase::AccountSetup => Phase::OrderSetup,
            Phase::OrderSetup => Phase::Authorizing,
            Phase::Authorizing => Phase::Finalizing,
            Phase::Finalizing => Phase::PollingCert,
            Phase::PollingCert => Phase::ChainFetch,
            Phase::ChainFetch => Phase::Commit,
            Phase::Commit | Phase::Done => Phase::Done,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible progress of the current cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveProgress {
    pub domain: String,
    pub phase: Phase,
    pub complete: bool,
}

/// State of one drive cycle
///
/// Owned by exactly one cycle; the fresh key and the chain in progress
/// never leave it before commit.
#[derive(Debug)]
pub struct DriveContext {
    domain: String,
    names: Vec<String>,
    preference: Vec<ChallengeKind>,
    phase: Phase,
    order: Option<Order>,
    cert_polls: Option<Poller>,
    csr: Option<CsrMaterial>,
    chain: Option<CertificateChain>,
    credentials: Option<Arc<Credentials>>,
    started: Instant,
}

impl DriveContext {
    pub fn new(domain: &ManagedDomain, config: &DriveConfig) -> Self {
        let names = domain.names();
        Self {
            domain: names.first().cloned().unwrap_or_default(),
            preference: domain
                .challenge_types
                .clone()
                .unwrap_or_else(|| config.challenge_types.clone()),
            names,
            phase: Phase::AccountSetup,
            order: None,
            cert_polls: None,
            csr: None,
            chain: None,
            credentials: None,
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Names in SAN order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn order(&self) -> Option<&Order> {
        self.order.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Done
    }
}

/// State an earlier phase should have left in the context
fn missing(phase: Phase, what: &str) -> DriveError {
    DriveError::Unexpected {
        phase,
        message: format!("{what} missing from drive context"),
    }
}

fn invalid_order(order: &Order) -> DriveError {
    DriveError::OrderInvalid {
        reason: order
            .error
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| format!("order {} is invalid", order.url)),
        problem: order.error.clone(),
    }
}

/// Runs drive cycles against one ACME server
///
/// The controller assumes at most one cycle per managed domain is in
/// flight; callers serialize cycles for the same domain.
pub struct DriveController {
    client: Arc<dyn AcmeClient>,
    provisioner: Arc<dyn ChallengeProvisioner>,
    store: Arc<dyn CredentialStore>,
    keys: Arc<dyn KeySource>,
    config: DriveConfig,
    cancel: CancellationToken,
    progress: watch::Sender<DriveProgress>,
}

impl DriveController {
    pub fn new(
        client: Arc<dyn AcmeClient>,
        provisioner: Arc<dyn ChallengeProvisioner>,
        store: Arc<dyn CredentialStore>,
        config: DriveConfig,
    ) -> Self {
        let (progress, _) = watch::channel(DriveProgress {
            domain: String::new(),
            phase: Phase::AccountSetup,
            complete: false,
        });
        Self {
            client,
            provisioner,
            store,
            keys: Arc::new(FreshKeys),
            config,
            cancel: CancellationToken::new(),
            progress,
        }
    }

    /// Generate per-cycle keys with `keys` instead of fresh software keys
    pub fn with_key_source(mut self, keys: Arc<dyn KeySource>) -> Self {
        self.keys = keys;
        self
    }

    /// Cancel cycles when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Phase and completion flag of the current cycle
    pub fn progress(&self) -> watch::Receiver<DriveProgress> {
        self.progress.subscribe()
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    /// Run one full drive cycle for `domain`
    ///
    /// On success the new credentials are committed to the store and
    /// installed on `domain`. On failure `domain.credentials` is left as
    /// it was and the failure is recorded in `domain.renewal`.
    pub async fn drive(
        &self,
        domain: &mut ManagedDomain,
        account: &AcmeAccount,
    ) -> Result<Arc<Credentials>, DriveError> {
        domain.validate()?;
        self.config.validate()?;

        let mut ctx = DriveContext::new(domain, &self.config);
        let primary = ctx.domain.clone();
        let started = ctx.started;
        info!(domain = %primary, names = ?ctx.names, "Starting drive cycle");

        let mut order_url: Option<String> = None;
        let result = loop {
            self.report(&ctx);
            if ctx.is_complete() {
                break ctx
                    .credentials
                    .take()
                    .ok_or_else(|| missing(Phase::Done, "credentials"))
                    .map_err(|e| (Phase::Done, e));
            }

            let phase = ctx.phase;
            match self.advance(account, ctx).await {
                Ok(next) => {
                    ctx = next;
                    if let Some(order) = &ctx.order {
                        order_url = Some(order.url.clone());
                    }
                }
                Err(e) => break Err((phase, e)),
            }
        };

        // The order never outlives the cycle
        if let Some(url) = &order_url {
            self.client.release_order(url).await;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(credentials) => {
                domain.credentials = Some(Arc::clone(&credentials));
                domain.renewal.record_success();
                info!(
                    domain = %primary,
                    not_after = %credentials.not_after(),
                    chain_len = credentials.chain().len(),
                    elapsed_ms = elapsed_ms,
                    "Drive cycle complete"
                );
                Ok(credentials)
            }
            Err((phase, err)) => {
                domain.renewal.record_failure(phase.as_str(), &err);
                if err.is_retryable() {
                    warn!(
                        domain = %primary,
                        phase = %phase,
                        problem = %err.problem_type(),
                        error = %err,
                        elapsed_ms = elapsed_ms,
                        "Drive cycle failed, a later cycle may succeed"
                    );
                } else {
                    error!(
                        domain = %primary,
                        phase = %phase,
                        problem = %err.problem_type(),
                        error = %err,
                        elapsed_ms = elapsed_ms,
                        "Drive cycle failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Run the context's current phase and return the context at the next
    pub async fn advance(
        &self,
        account: &AcmeAccount,
        mut ctx: DriveContext,
    ) -> Result<DriveContext, DriveError> {
        if ctx.phase == Phase::Done {
            return Ok(ctx);
        }
        if self.cancel.is_cancelled() {
            info!(domain = %ctx.domain, phase = %ctx.phase, "Drive cycle cancelled");
            return Err(DriveError::Cancelled { phase: ctx.phase });
        }

        let started = Instant::now();
        debug!(domain = %ctx.domain, phase = %ctx.phase, "Entering phase");

        match ctx.phase {
            Phase::AccountSetup => self.bind_account(account).await?,
            Phase::OrderSetup => {
                let order = self.setup_order(account, &ctx).await?;
                ctx.order = Some(order);
            }
            Phase::Authorizing => self.authorize(account, &ctx).await?,
            Phase::Finalizing => self.finalize(account, &mut ctx).await?,
            Phase::PollingCert => self.await_certificate(account, &mut ctx).await?,
            Phase::ChainFetch => self.build_chain(account, &mut ctx).await?,
            Phase::Commit => self.commit(&mut ctx)?,
            Phase::Done => {}
        }

        debug!(
            domain = %ctx.domain,
            phase = %ctx.phase,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Phase complete"
        );
        ctx.phase = ctx.phase.next();
        Ok(ctx)
    }

    fn report(&self, ctx: &DriveContext) {
        self.progress.send_replace(DriveProgress {
            domain: ctx.domain.clone(),
            phase: ctx.phase,
            complete: ctx.is_complete(),
        });
    }

    async fn bind_account(&self, account: &AcmeAccount) -> Result<(), DriveError> {
        if !account.tos_agreed {
            return Err(DriveError::Local(AcmeProblem::local(
                "tos-not-accepted",
                "account has not accepted the terms of service",
            )));
        }
        retry_transient(&self.config, "verify-account", || {
            self.client.verify_account(account)
        })
        .await
        .map_err(|e| DriveError::from_client(Phase::AccountSetup, e))?;
        trace!(account = %account.url, "Account bound");
        Ok(())
    }

    /// Create an order covering exactly the context's names
    ///
    /// An order that does not match, or that the server hands back in a
    /// state a fresh key cannot finalize, is abandoned and replaced once.
    async fn setup_order(
        &self,
        account: &AcmeAccount,
        ctx: &DriveContext,
    ) -> Result<Order, DriveError> {
        let mut attempt = 1;
        loop {
            let order = retry_transient(&self.config, "new-order", || {
                self.client.new_order(account, &ctx.names)
            })
            .await
            .map_err(|e| DriveError::from_client(Phase::OrderSetup, e))?;

            let unusable = if !order.covers_exactly(&ctx.names) {
                DriveError::OrderMismatch {
                    url: order.url.clone(),
                    expected: ctx.names.clone(),
                    actual: order.identifiers.clone(),
                }
            } else {
                match order.status {
                    OrderStatus::Pending | OrderStatus::Ready => {
                        info!(
                            domain = %ctx.domain,
                            order = %order.url,
                            status = order.status.as_str(),
                            authorizations = order.authorizations.len(),
                            "Order created"
                        );
                        return Ok(order);
                    }
                    OrderStatus::Invalid => invalid_order(&order),
                    status => DriveError::Unexpected {
                        phase: Phase::OrderSetup,
                        message: format!("new order {} is already {}", order.url, status.as_str()),
                    },
                }
            };

            warn!(
                domain = %ctx.domain,
                order = %order.url,
                attempt = attempt,
                reason = %unusable,
                "Abandoning unusable order"
            );
            self.client.release_order(&order.url).await;

            if attempt >= ORDER_ATTEMPTS {
                return Err(unusable);
            }
            attempt += 1;
        }
    }

    async fn authorize(&self, account: &AcmeAccount, ctx: &DriveContext) -> Result<(), DriveError> {
        let order = ctx
            .order
            .as_ref()
            .ok_or_else(|| missing(Phase::Authorizing, "order"))?;
        let driver = OrderDriver {
            client: self.client.as_ref(),
            provisioner: self.provisioner.as_ref(),
            account,
            config: &self.config,
            preference: &ctx.preference,
            names: &ctx.names,
        };
        driver.authorize(order).await
    }

    /// Wait for the order to be ready, then submit a CSR over a fresh key
    ///
    /// The certificate poll budget starts here and carries into
    /// [`Phase::PollingCert`].
    async fn finalize(&self, account: &AcmeAccount, ctx: &mut DriveContext) -> Result<(), DriveError> {
        let url = ctx
            .order
            .as_ref()
            .map(|o| o.url.clone())
            .ok_or_else(|| missing(Phase::Finalizing, "order"))?;

        let mut polls = Poller::new(
            Backoff::from_config(&self.config),
            Deadline::after(self.config.cert_poll_timeout()),
        );
        let ready = self
            .poll_order(account, &url, &mut polls, Phase::Finalizing, OrderStatus::Ready)
            .await?;

        let csr = CsrMaterial::generate(self.keys.as_ref(), self.config.key_spec, &ctx.names)?;
        let limit = polls.call_timeout(self.config.request_timeout());
        let order = bounded(limit, self.client.finalize_order(account, &ready, csr.der()))
            .await
            .map_err(|e| DriveError::from_client(Phase::Finalizing, e))?;
        if order.status == OrderStatus::Invalid {
            return Err(invalid_order(&order));
        }

        info!(
            domain = %ctx.domain,
            order = %order.url,
            status = order.status.as_str(),
            key_spec = self.config.key_spec.as_str(),
            "Order finalized"
        );
        ctx.order = Some(order);
        ctx.csr = Some(csr);
        ctx.cert_polls = Some(polls);
        Ok(())
    }

    async fn await_certificate(
        &self,
        account: &AcmeAccount,
        ctx: &mut DriveContext,
    ) -> Result<(), DriveError> {
        let (url, status) = ctx
            .order
            .as_ref()
            .map(|o| (o.url.clone(), o.status))
            .ok_or_else(|| missing(Phase::PollingCert, "order"))?;
        if status == OrderStatus::Valid {
            return Ok(());
        }

        let mut polls = ctx
            .cert_polls
            .take()
            .ok_or_else(|| missing(Phase::PollingCert, "certificate poll budget"))?;
        let order = self
            .poll_order(account, &url, &mut polls, Phase::PollingCert, OrderStatus::Valid)
            .await?;
        debug!(domain = %ctx.domain, checks = polls.checks(), "Certificate issued");
        ctx.order = Some(order);
        Ok(())
    }

    /// Poll the order at `url` until it reaches `target` or the budget runs out
    async fn poll_order(
        &self,
        account: &AcmeAccount,
        url: &str,
        polls: &mut Poller,
        phase: Phase,
        target: OrderStatus,
    ) -> Result<Order, DriveError> {
        while polls.tick().await {
            let limit = polls.call_timeout(self.config.request_timeout());
            match bounded(limit, self.client.get_order(account, url)).await {
                Ok(order) => {
                    trace!(
                        order = %url,
                        status = order.status.as_str(),
                        checks = polls.checks(),
                        "Polled order"
                    );
                    if order.status == target {
                        return Ok(order);
                    }
                    match order.status {
                        OrderStatus::Invalid => return Err(invalid_order(&order)),
                        OrderStatus::Processing | OrderStatus::Valid
                            if target == OrderStatus::Ready =>
                        {
                            return Err(DriveError::Unexpected {
                                phase,
                                message: format!(
                                    "order {url} is {} before finalize",
                                    order.status.as_str()
                                ),
                            });
                        }
                        _ => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!(order = %url, error = %e, "Transient failure polling order");
                }
                Err(e) => return Err(DriveError::from_client(phase, e)),
            }
        }
        Err(DriveError::CertificateTimeout(polls.deadline().budget()))
    }

    async fn build_chain(
        &self,
        account: &AcmeAccount,
        ctx: &mut DriveContext,
    ) -> Result<(), DriveError> {
        let url = ctx
            .order
            .as_ref()
            .and_then(|o| o.certificate_url.clone())
            .ok_or_else(|| DriveError::Unexpected {
                phase: Phase::ChainFetch,
                message: "valid order carries no certificate URL".into(),
            })?;

        let initial = retry_transient(&self.config, "download-certificate", || {
            self.client.download_certificate(account, &url)
        })
        .await
        .map_err(|e| DriveError::ChainFetch(format!("{url}: {e}")))?;

        let chain = fetch_chain(self.client.as_ref(), account, &self.config, initial).await?;
        ctx.chain = Some(chain);
        Ok(())
    }

    /// Pair the cycle's key with the chain and hand the result to the store
    fn commit(&self, ctx: &mut DriveContext) -> Result<(), DriveError> {
        let csr = ctx.csr.take().ok_or_else(|| missing(Phase::Commit, "CSR key"))?;
        let chain = ctx
            .chain
            .take()
            .ok_or_else(|| missing(Phase::Commit, "certificate chain"))?;

        let credentials = Credentials::new(csr.into_key(), chain, &ctx.names, Utc::now())?;
        self.store.commit_credentials(&ctx.domain, &credentials)?;

        info!(
            domain = %ctx.domain,
            names = ?credentials.names(),
            not_after = %credentials.not_after(),
            "Credentials committed"
        );
        ctx.credentials = Some(Arc::new(credentials));
        Ok(())
    }
}

impl fmt::Debug for DriveController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveController")
            .field("directory", &self.client.directory_url())
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
