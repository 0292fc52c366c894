//! Test support: a scripted in-memory ACME server, a key source that
//! remembers what it generated, an rcgen test CA and a recording
//! challenge provisioner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use tokio::time::Instant;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

use crate::client::AcmeClient;
use crate::credentials::{
    CertificateChain, Credentials, CsrMaterial, FreshKeys, KeySource, KeySpec, PrivateKey,
};
use crate::domain::{AccountRequest, AcmeAccount};
use crate::error::{AcmeProblem, ClientError, DriveError, ProvisionError};
use crate::provision::{ChallengeProof, ChallengeProvisioner};
use crate::resources::{
    Authorization, AuthorizationStatus, CertificateDownload, Challenge, ChallengeKind,
    ChallengeStatus, Order, OrderStatus,
};

pub(crate) const FAKE_DIRECTORY: &str = "https://fake.acme/directory";

// ============================================================================
// Test CA
// ============================================================================

pub(crate) struct TestCa {
    issuer: Issuer<'static, KeyPair>,
    der: Vec<u8>,
}

impl TestCa {
    pub(crate) fn new() -> Self {
        Self::named("certdrive test CA")
    }

    /// A self-signed CA whose subject is `CN=<common_name>`
    pub(crate) fn named(common_name: &str) -> Self {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let cert = params.self_signed(&key).unwrap();
        let der = cert.der().to_vec();
        Self {
            issuer: Issuer::new(params, key),
            der,
        }
    }

    pub(crate) fn der(&self) -> &[u8] {
        &self.der
    }

    /// Issue a leaf for `key` carrying `names`, valid until 2060
    pub(crate) fn issue(&self, key: &KeyPair, names: &[String]) -> Vec<u8> {
        let mut params = CertificateParams::new(names.to_vec()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2060, 1, 1);
        params.signed_by(key, &self.issuer).unwrap().der().to_vec()
    }
}

/// Valid credentials for `names`, issued by a throwaway CA
pub(crate) fn issue_credentials(names: &[String]) -> Credentials {
    let ca = TestCa::new();
    let csr = CsrMaterial::generate(&FreshKeys, KeySpec::P256, names).unwrap();
    let key = KeyPair::from_pem(csr.key().pem()).unwrap();
    let chain = CertificateChain::new(vec![ca.issue(&key, names), ca.der().to_vec()]);
    Credentials::new(csr.into_key(), chain, names, Utc::now()).unwrap()
}

// ============================================================================
// Recording key source
// ============================================================================

/// Generates fresh keys and remembers them so the fake CA can issue for them
#[derive(Default)]
pub(crate) struct RecordingKeys {
    generated: Mutex<Vec<(KeySpec, String)>>,
}

impl RecordingKeys {
    pub(crate) fn count(&self) -> usize {
        self.generated.lock().len()
    }

    /// The generated key whose public key is `spki`
    fn find(&self, spki: &[u8]) -> Option<KeyPair> {
        self.generated
            .lock()
            .iter()
            .find(|(spec, pem)| {
                PrivateKey::from_pem(*spec, pem.clone())
                    .public_key_info()
                    .map(|info| info == spki)
                    .unwrap_or(false)
            })
            .and_then(|(_, pem)| KeyPair::from_pem(pem).ok())
    }
}

impl KeySource for RecordingKeys {
    fn generate(&self, spec: KeySpec) -> Result<KeyPair, DriveError> {
        let key = FreshKeys.generate(spec)?;
        self.generated.lock().push((spec, key.serialize_pem()));
        Ok(key)
    }
}

// ============================================================================
// Recording provisioner
// ============================================================================

#[derive(Default)]
pub(crate) struct RecordingProvisioner {
    published: Mutex<Vec<ChallengeProof>>,
    cleaned: Mutex<Vec<ChallengeProof>>,
    fail_for: Mutex<Option<String>>,
    publish_delay: Mutex<Option<Duration>>,
    cleanup_delay: Mutex<Option<Duration>>,
}

impl RecordingProvisioner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make publishing fail for `domain`
    pub(crate) fn fail_for(&self, domain: &str) {
        *self.fail_for.lock() = Some(domain.to_string());
    }

    /// Make every publish take `delay` before it completes
    pub(crate) fn stall_publish(&self, delay: Duration) {
        *self.publish_delay.lock() = Some(delay);
    }

    /// Make every cleanup take `delay` before it completes
    pub(crate) fn stall_cleanup(&self, delay: Duration) {
        *self.cleanup_delay.lock() = Some(delay);
    }

    pub(crate) fn published(&self) -> Vec<ChallengeProof> {
        self.published.lock().clone()
    }

    pub(crate) fn cleaned(&self) -> Vec<ChallengeProof> {
        self.cleaned.lock().clone()
    }

    /// Proofs published and not cleaned up
    pub(crate) fn live(&self) -> usize {
        let cleaned = self.cleaned.lock();
        self.published
            .lock()
            .iter()
            .filter(|p| !cleaned.contains(p))
            .count()
    }
}

#[async_trait]
impl ChallengeProvisioner for RecordingProvisioner {
    fn supports(&self, _kind: &ChallengeKind) -> bool {
        true
    }

    async fn publish(&self, proof: &ChallengeProof) -> Result<(), ProvisionError> {
        if self.fail_for.lock().as_deref() == Some(proof.domain.as_str()) {
            return Err(ProvisionError::Publish("DNS API unavailable".into()));
        }
        let delay = *self.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.published.lock().push(proof.clone());
        Ok(())
    }

    async fn cleanup(&self, proof: &ChallengeProof) -> Result<(), ProvisionError> {
        let delay = *self.cleanup_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.cleaned.lock().push(proof.clone());
        Ok(())
    }
}

// ============================================================================
// Scripted ACME server
// ============================================================================

/// How an authorization for one domain behaves
#[derive(Debug, Clone)]
pub(crate) enum AuthzScript {
    /// Valid on the n-th status check after the trigger
    ValidAfter(u32),
    /// Invalid with the given detail on the n-th check after the trigger
    InvalidAfter(u32, String),
    /// Stays pending
    Never,
    /// Valid before anything is triggered
    AlreadyValid,
}

/// Server behavior knobs
#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub(crate) account_problem: Option<AcmeProblem>,
    pub(crate) authz: HashMap<String, AuthzScript>,
    pub(crate) offered: Vec<ChallengeKind>,
    /// Order status checks, once all authorizations are valid, until ready
    pub(crate) ready_after_polls: u32,
    /// Order status checks after finalize until valid; `None` never
    pub(crate) valid_after_polls: Option<u32>,
    /// Links following the leaf download
    pub(crate) chain_links: usize,
    /// Every link carries another link
    pub(crate) endless_chain: bool,
    /// The final link fails
    pub(crate) broken_link: bool,
    /// New orders that come back with drifted identifiers first
    pub(crate) mismatched_orders: u32,
    /// Order status checks that fail with a transport error first
    pub(crate) transient_order_failures: u32,
    /// Names put on the leaf instead of the order's
    pub(crate) san_override: Option<Vec<String>>,
    pub(crate) finalize_problem: Option<AcmeProblem>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            account_problem: None,
            authz: HashMap::new(),
            offered: vec![ChallengeKind::Http01, ChallengeKind::Dns01],
            ready_after_polls: 1,
            valid_after_polls: Some(1),
            chain_links: 1,
            endless_chain: false,
            broken_link: false,
            mismatched_orders: 0,
            transient_order_failures: 0,
            san_override: None,
            finalize_problem: None,
        }
    }
}

/// Call counters
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeStats {
    pub(crate) accounts_created: u32,
    pub(crate) orders_created: u32,
    pub(crate) order_polls: u32,
    pub(crate) finalize_calls: u32,
    pub(crate) triggers: u32,
    pub(crate) downloads: u32,
    pub(crate) released: Vec<String>,
}

struct FakeAuthz {
    domain: String,
    script: AuthzScript,
    challenges: Vec<(ChallengeKind, String, String)>,
    triggered: Option<String>,
    polls_after_trigger: u32,
    status: AuthorizationStatus,
}

struct FakeOrder {
    names: Vec<String>,
    authz_urls: Vec<String>,
    ready_polls: u32,
    finalized: bool,
    valid_polls: u32,
    status: OrderStatus,
    leaf: Option<Vec<u8>>,
    error: Option<AcmeProblem>,
}

#[derive(Default)]
struct FakeState {
    script: Script,
    next_id: u32,
    orders: HashMap<String, FakeOrder>,
    authzs: HashMap<String, FakeAuthz>,
    authz_checks: HashMap<String, Vec<Instant>>,
    stats: FakeStats,
}

pub(crate) struct FakeAcme {
    ca: TestCa,
    keys: Arc<RecordingKeys>,
    state: Mutex<FakeState>,
}

impl FakeAcme {
    pub(crate) fn new() -> Self {
        Self {
            ca: TestCa::new(),
            keys: Arc::new(RecordingKeys::default()),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub(crate) fn configure(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.state.lock().script);
    }

    pub(crate) fn reject_accounts(&self, problem: AcmeProblem) {
        self.configure(|s| s.account_problem = Some(problem));
    }

    /// Key source whose keys this server can issue for
    pub(crate) fn keys(&self) -> Arc<RecordingKeys> {
        Arc::clone(&self.keys)
    }

    pub(crate) fn ca_der(&self) -> &[u8] {
        self.ca.der()
    }

    pub(crate) fn stats(&self) -> FakeStats {
        self.state.lock().stats.clone()
    }

    /// Times of every status check of one authorization
    pub(crate) fn authz_checks(&self, url: &str) -> Vec<Instant> {
        self.state
            .lock()
            .authz_checks
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn test_account(&self) -> AcmeAccount {
        AcmeAccount {
            url: format!("{FAKE_DIRECTORY}/acct/test"),
            directory: FAKE_DIRECTORY.into(),
            contacts: vec!["mailto:ops@example.org".into()],
            tos_agreed: true,
            eab_kid: None,
            key_material: "{}".into(),
        }
    }

    /// Create an order and push it straight to valid
    pub(crate) async fn issue_for_test(&self, account: &AcmeAccount, names: &[String]) -> Order {
        let order = self.new_order(account, names).await.unwrap();
        {
            let mut state = self.state.lock();
            for url in &order.authorizations {
                if let Some(authz) = state.authzs.get_mut(url) {
                    authz.status = AuthorizationStatus::Valid;
                }
            }
            if let Some(fake) = state.orders.get_mut(&order.url) {
                fake.status = OrderStatus::Ready;
            }
        }
        let csr = CsrMaterial::generate(self.keys.as_ref(), KeySpec::P256, names).unwrap();
        self.configure(|s| s.valid_after_polls = Some(0));
        self.finalize_order(account, &order, csr.der()).await.unwrap()
    }

    fn next_id(state: &mut FakeState) -> u32 {
        state.next_id += 1;
        state.next_id
    }

    fn snapshot(url: &str, order: &FakeOrder) -> Order {
        Order {
            url: url.to_string(),
            status: order.status,
            identifiers: order.names.clone(),
            authorizations: order.authz_urls.clone(),
            finalize_url: format!("{url}/finalize"),
            certificate_url: (order.status == OrderStatus::Valid).then(|| format!("{url}/cert")),
            error: order.error.clone(),
        }
    }

    fn authz_view(url: &str, authz: &FakeAuthz) -> Authorization {
        let challenges = authz
            .challenges
            .iter()
            .map(|(kind, chall_url, token)| {
                let chosen = authz.triggered.as_deref() == Some(chall_url.as_str());
                let (status, error) = match (chosen, authz.status) {
                    (_, AuthorizationStatus::Valid) if chosen => (ChallengeStatus::Valid, None),
                    (true, AuthorizationStatus::Invalid) => {
                        let detail = match &authz.script {
                            AuthzScript::InvalidAfter(_, detail) => detail.clone(),
                            _ => String::new(),
                        };
                        (ChallengeStatus::Invalid, Some(AcmeProblem::acme("dns", detail)))
                    }
                    (true, _) => (ChallengeStatus::Processing, None),
                    (false, _) => (ChallengeStatus::Pending, None),
                };
                Challenge {
                    url: chall_url.clone(),
                    kind: kind.clone(),
                    token: token.clone(),
                    status,
                    error,
                }
            })
            .collect();
        Authorization {
            url: url.to_string(),
            domain: authz.domain.clone(),
            status: authz.status,
            challenges,
        }
    }

    /// Advance an order by one status check
    fn poll_order(state: &mut FakeState, url: &str) {
        let script = state.script.clone();
        let authz_states: Vec<AuthorizationStatus> = match state.orders.get(url) {
            Some(order) => order
                .authz_urls
                .iter()
                .filter_map(|u| state.authzs.get(u).map(|a| a.status))
                .collect(),
            None => return,
        };
        let invalid_problem = state.orders.get(url).and_then(|order| {
            order.authz_urls.iter().find_map(|u| {
                let authz = state.authzs.get(u)?;
                (authz.status == AuthorizationStatus::Invalid)
                    .then(|| Self::authz_view(u, authz).failure_reason().1)
                    .flatten()
            })
        });
        let Some(order) = state.orders.get_mut(url) else {
            return;
        };

        match order.status {
            OrderStatus::Pending | OrderStatus::Ready => {
                if authz_states.iter().any(|s| *s == AuthorizationStatus::Invalid) {
                    order.status = OrderStatus::Invalid;
                    order.error = invalid_problem;
                } else if authz_states.iter().all(|s| *s == AuthorizationStatus::Valid) {
                    order.ready_polls += 1;
                    if order.ready_polls >= script.ready_after_polls {
                        order.status = OrderStatus::Ready;
                    }
                }
            }
            OrderStatus::Processing => {
                order.valid_polls += 1;
                if script.valid_after_polls.is_some_and(|n| order.valid_polls >= n) {
                    order.status = OrderStatus::Valid;
                }
            }
            OrderStatus::Valid | OrderStatus::Invalid => {}
        }
    }
}

fn problem(short: &str, detail: &str) -> ClientError {
    ClientError::Problem(AcmeProblem::acme(short, detail))
}

#[async_trait]
impl AcmeClient for FakeAcme {
    fn directory_url(&self) -> &str {
        FAKE_DIRECTORY
    }

    async fn new_account(&self, request: &AccountRequest) -> Result<AcmeAccount, ClientError> {
        let mut state = self.state.lock();
        if let Some(p) = &state.script.account_problem {
            return Err(ClientError::Problem(p.clone()));
        }
        state.stats.accounts_created += 1;
        let id = Self::next_id(&mut state);
        Ok(AcmeAccount {
            url: format!("{FAKE_DIRECTORY}/acct/{id}"),
            directory: FAKE_DIRECTORY.into(),
            contacts: request.contacts.clone(),
            tos_agreed: request.agree_tos,
            eab_kid: request.eab.as_ref().map(|e| e.kid.clone()),
            key_material: "{}".into(),
        })
    }

    async fn verify_account(&self, account: &AcmeAccount) -> Result<(), ClientError> {
        let state = self.state.lock();
        if let Some(p) = &state.script.account_problem {
            return Err(ClientError::Problem(p.clone()));
        }
        if account.directory != FAKE_DIRECTORY {
            return Err(problem("accountDoesNotExist", "unknown account"));
        }
        Ok(())
    }

    async fn new_order(
        &self,
        _account: &AcmeAccount,
        names: &[String],
    ) -> Result<Order, ClientError> {
        let mut state = self.state.lock();
        state.stats.orders_created += 1;

        let mut names = names.to_vec();
        if state.script.mismatched_orders > 0 {
            state.script.mismatched_orders -= 1;
            names.push("stale.example".into());
        }

        let id = Self::next_id(&mut state);
        let url = format!("https://fake.acme/order/{id}");
        let mut authz_urls = Vec::new();
        for name in &names {
            let authz_id = Self::next_id(&mut state);
            let authz_url = format!("https://fake.acme/authz/{authz_id}");
            let script = state
                .script
                .authz
                .get(name)
                .cloned()
                .unwrap_or(AuthzScript::ValidAfter(1));
            let status = match script {
                AuthzScript::AlreadyValid => AuthorizationStatus::Valid,
                _ => AuthorizationStatus::Pending,
            };
            let challenges = state
                .script
                .offered
                .iter()
                .enumerate()
                .map(|(i, kind)| {
                    (
                        kind.clone(),
                        format!("{authz_url}/chall/{i}"),
                        format!("token-{authz_id}-{i}"),
                    )
                })
                .collect();
            state.authzs.insert(
                authz_url.clone(),
                FakeAuthz {
                    domain: name.clone(),
                    script,
                    challenges,
                    triggered: None,
                    polls_after_trigger: 0,
                    status,
                },
            );
            authz_urls.push(authz_url);
        }

        let order = FakeOrder {
            names,
            authz_urls,
            ready_polls: 0,
            finalized: false,
            valid_polls: 0,
            status: OrderStatus::Pending,
            leaf: None,
            error: None,
        };
        let snapshot = Self::snapshot(&url, &order);
        state.orders.insert(url, order);
        Ok(snapshot)
    }

    async fn get_order(&self, _account: &AcmeAccount, url: &str) -> Result<Order, ClientError> {
        let mut state = self.state.lock();
        if state.script.transient_order_failures > 0 {
            state.script.transient_order_failures -= 1;
            return Err(ClientError::Transport("connection reset by peer".into()));
        }
        state.stats.order_polls += 1;
        Self::poll_order(&mut state, url);
        state
            .orders
            .get(url)
            .map(|order| Self::snapshot(url, order))
            .ok_or_else(|| problem("malformed", "no such order"))
    }

    async fn get_authorization(
        &self,
        _account: &AcmeAccount,
        url: &str,
    ) -> Result<Authorization, ClientError> {
        let mut state = self.state.lock();
        state
            .authz_checks
            .entry(url.to_string())
            .or_default()
            .push(Instant::now());

        let authz = state
            .authzs
            .get_mut(url)
            .ok_or_else(|| problem("malformed", "no such authorization"))?;

        if authz.triggered.is_some() && authz.status == AuthorizationStatus::Pending {
            authz.polls_after_trigger += 1;
            match &authz.script {
                AuthzScript::ValidAfter(n) if authz.polls_after_trigger >= *n => {
                    authz.status = AuthorizationStatus::Valid;
                }
                AuthzScript::InvalidAfter(n, _) if authz.polls_after_trigger >= *n => {
                    authz.status = AuthorizationStatus::Invalid;
                }
                _ => {}
            }
        }
        Ok(Self::authz_view(url, authz))
    }

    async fn challenge_proof(
        &self,
        _account: &AcmeAccount,
        authorization: &Authorization,
        challenge: &Challenge,
    ) -> Result<ChallengeProof, ClientError> {
        Ok(ChallengeProof {
            domain: authorization.domain.clone(),
            kind: challenge.kind.clone(),
            token: challenge.token.clone(),
            key_authorization: format!("{}.fake-thumbprint", challenge.token),
            dns_value: format!("dns-{}", challenge.token),
        })
    }

    async fn trigger_challenge(
        &self,
        _account: &AcmeAccount,
        challenge_url: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        state.stats.triggers += 1;
        let authz = state
            .authzs
            .values_mut()
            .find(|a| a.challenges.iter().any(|(_, url, _)| url == challenge_url))
            .ok_or_else(|| problem("malformed", "no such challenge"))?;
        authz.triggered = Some(challenge_url.to_string());
        Ok(())
    }

    async fn finalize_order(
        &self,
        _account: &AcmeAccount,
        order: &Order,
        csr_der: &[u8],
    ) -> Result<Order, ClientError> {
        let mut state = self.state.lock();
        state.stats.finalize_calls += 1;
        if let Some(p) = &state.script.finalize_problem {
            return Err(ClientError::Problem(p.clone()));
        }

        let (_, request) = X509CertificationRequest::from_der(csr_der)
            .map_err(|_| problem("badCSR", "unparseable CSR"))?;
        let spki = request.certification_request_info.subject_pki.raw.to_vec();
        let key = self
            .keys
            .find(&spki)
            .ok_or_else(|| problem("badCSR", "unknown key"))?;

        let script = state.script.clone();
        let fake = state
            .orders
            .get_mut(&order.url)
            .ok_or_else(|| problem("malformed", "no such order"))?;
        if fake.status != OrderStatus::Ready || fake.finalized {
            return Err(problem("orderNotReady", "order is not ready"));
        }

        let names = script.san_override.unwrap_or_else(|| fake.names.clone());
        fake.leaf = Some(self.ca.issue(&key, &names));
        fake.finalized = true;
        fake.status = if script.valid_after_polls == Some(0) {
            OrderStatus::Valid
        } else {
            OrderStatus::Processing
        };
        Ok(Self::snapshot(&order.url, fake))
    }

    async fn download_certificate(
        &self,
        _account: &AcmeAccount,
        url: &str,
    ) -> Result<CertificateDownload, ClientError> {
        let mut state = self.state.lock();
        state.stats.downloads += 1;
        let script = &state.script;
        let has_link = |index: usize| script.endless_chain || index < script.chain_links;

        if let Some(order_url) = url.strip_suffix("/cert") {
            let leaf = state
                .orders
                .get(order_url)
                .and_then(|o| o.leaf.clone())
                .ok_or_else(|| problem("malformed", "no certificate"))?;
            return Ok(CertificateDownload {
                certificates: vec![leaf],
                next: has_link(0).then(|| format!("{order_url}/chain/0")),
            });
        }

        let (order_url, index) = url
            .rsplit_once("/chain/")
            .and_then(|(order, i)| i.parse::<usize>().ok().map(|i| (order, i)))
            .ok_or_else(|| problem("malformed", "unknown certificate URL"))?;
        if script.broken_link && !script.endless_chain && index + 1 == script.chain_links {
            return Err(ClientError::Unexpected("link target gone".into()));
        }
        Ok(CertificateDownload {
            certificates: vec![self.ca.der().to_vec()],
            next: has_link(index + 1).then(|| format!("{order_url}/chain/{}", index + 1)),
        })
    }

    async fn release_order(&self, order_url: &str) {
        self.state.lock().stats.released.push(order_url.to_string());
    }
}
