//! [`AcmeClient`] over `instant-acme`
//!
//! `instant-acme` works with stateful `Order` handles rather than URLs, so
//! this adapter keeps the handles of live orders keyed by order URL and
//! remembers which order every authorization, challenge and certificate
//! URL belongs to. Handles are dropped by [`AcmeClient::release_order`].

use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus as AcmeAuthzStatus, ChallengeType,
    ExternalAccountKey, Identifier, NewAccount, NewOrder, OrderStatus as AcmeOrderStatus, Problem,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::AcmeClient;
use crate::credentials::CertificateChain;
use crate::domain::{AccountRequest, AcmeAccount};
use crate::error::{AcmeProblem, ClientError};
use crate::provision::ChallengeProof;
use crate::resources::{
    Authorization, AuthorizationStatus, CertificateDownload, Challenge, ChallengeKind,
    ChallengeStatus, Order, OrderStatus,
};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

struct OrderEntry {
    order: instant_acme::Order,
    /// Names the server attached to the order, from its authorizations
    identifiers: Vec<String>,
}

type OrderHandle = Arc<Mutex<OrderEntry>>;

/// ACME client backed by `instant-acme`
pub struct InstantAcmeClient {
    directory_url: String,
    /// Loaded accounts by account URL
    accounts: DashMap<String, Arc<Account>>,
    /// Live orders by order URL
    orders: DashMap<String, OrderHandle>,
    /// Authorization, challenge and certificate URLs to their order URL
    owners: DashMap<String, String>,
}

impl InstantAcmeClient {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            accounts: DashMap::new(),
            orders: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    async fn account(&self, account: &AcmeAccount) -> Result<Arc<Account>, ClientError> {
        if let Some(loaded) = self.accounts.get(&account.url) {
            return Ok(Arc::clone(loaded.value()));
        }
        let credentials: AccountCredentials = serde_json::from_str(&account.key_material)
            .map_err(|e| ClientError::Unexpected(format!("unreadable account credentials: {e}")))?;
        let loaded = Arc::new(Account::from_credentials(credentials).await?);
        self.accounts.insert(account.url.clone(), Arc::clone(&loaded));
        debug!(account = %account.url, "Loaded ACME account");
        Ok(loaded)
    }

    fn handle(&self, url: &str) -> Result<OrderHandle, ClientError> {
        let order_url = self
            .owners
            .get(url)
            .map(|owner| owner.value().clone())
            .unwrap_or_else(|| url.to_string());
        self.orders
            .get(&order_url)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ClientError::Unexpected(format!("no live order for {url}")))
    }

    /// Snapshot an order and record ownership of the URLs it references
    fn snapshot(&self, entry: &mut OrderEntry) -> Order {
        let url = entry.order.url().to_string();
        let identifiers = entry.identifiers.clone();
        let state = entry.order.state();

        let status = match state.status {
            AcmeOrderStatus::Pending => OrderStatus::Pending,
            AcmeOrderStatus::Ready => OrderStatus::Ready,
            AcmeOrderStatus::Processing => OrderStatus::Processing,
            AcmeOrderStatus::Valid => OrderStatus::Valid,
            _ => OrderStatus::Invalid,
        };

        // the download goes through the order handle, so a valid order
        // always gets a certificate URL even before the server lists one
        let certificate_url = match (&state.certificate, status) {
            (Some(cert), _) => Some(cert.clone()),
            (None, OrderStatus::Valid) => Some(url.clone()),
            (None, _) => None,
        };

        for authz in &state.authorizations {
            self.owners.insert(authz.clone(), url.clone());
        }
        if let Some(cert) = &certificate_url {
            self.owners.insert(cert.clone(), url.clone());
        }

        Order {
            url,
            status,
            identifiers,
            authorizations: state.authorizations.clone(),
            finalize_url: state.finalize.clone(),
            certificate_url,
            error: state.error.as_ref().map(to_problem),
        }
    }

    async fn find_authorization(
        &self,
        url: &str,
    ) -> Result<(OrderHandle, instant_acme::Authorization), ClientError> {
        let handle = self.handle(url)?;
        let mut entry = handle.lock().await;
        let index = entry
            .order
            .state()
            .authorizations
            .iter()
            .position(|u| u == url)
            .ok_or_else(|| ClientError::Unexpected(format!("unknown authorization {url}")))?;
        let mut authorizations = entry.order.authorizations().await?;
        if index >= authorizations.len() {
            return Err(ClientError::Unexpected(format!(
                "authorization {url} missing from order"
            )));
        }
        let authz = authorizations.swap_remove(index);
        drop(entry);
        Ok((handle, authz))
    }
}

fn dns_name(identifier: &Identifier) -> String {
    match identifier {
        Identifier::Dns(name) => name.clone(),
    }
}

/// Names covered by an order, as the server lists them in its authorizations
fn order_identifiers(authorizations: &[instant_acme::Authorization]) -> Vec<String> {
    authorizations
        .iter()
        .map(|authz| dns_name(&authz.identifier))
        .collect()
}

fn authorization_status(status: &AcmeAuthzStatus) -> AuthorizationStatus {
    match status {
        AcmeAuthzStatus::Pending => AuthorizationStatus::Pending,
        AcmeAuthzStatus::Valid => AuthorizationStatus::Valid,
        AcmeAuthzStatus::Invalid => AuthorizationStatus::Invalid,
        AcmeAuthzStatus::Expired => AuthorizationStatus::Expired,
        AcmeAuthzStatus::Revoked => AuthorizationStatus::Revoked,
        #[allow(unreachable_patterns)]
        _ => AuthorizationStatus::Deactivated,
    }
}

/// Challenge state as far as the authorization tells it
///
/// A challenge carrying an error failed; otherwise it follows its
/// authorization. A pending authorization reports its challenges pending,
/// so a challenge already processing is triggered again, which servers
/// answer with its current state.
fn challenge_status(authz: AuthorizationStatus, has_error: bool) -> ChallengeStatus {
    match (authz, has_error) {
        (_, true) => ChallengeStatus::Invalid,
        (AuthorizationStatus::Pending, false) => ChallengeStatus::Pending,
        (AuthorizationStatus::Valid, false) => ChallengeStatus::Valid,
        (_, false) => ChallengeStatus::Invalid,
    }
}

fn to_authorization(url: &str, authz: &instant_acme::Authorization) -> Authorization {
    let status = authorization_status(&authz.status);
    let challenges = authz
        .challenges
        .iter()
        .map(|c| Challenge {
            url: c.url.clone(),
            kind: challenge_kind(&c.r#type),
            token: c.token.clone(),
            status: challenge_status(status, c.error.is_some()),
            error: c.error.as_ref().map(to_problem),
        })
        .collect();

    Authorization {
        url: url.to_string(),
        domain: dns_name(&authz.identifier),
        status,
        challenges,
    }
}

impl std::fmt::Debug for InstantAcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeClient")
            .field("directory_url", &self.directory_url)
            .field("live_orders", &self.orders.len())
            .finish()
    }
}

fn to_problem(problem: &Problem) -> AcmeProblem {
    AcmeProblem::new(
        problem.r#type.clone().unwrap_or_default(),
        problem.detail.clone().unwrap_or_default(),
    )
}

impl From<instant_acme::Error> for ClientError {
    fn from(err: instant_acme::Error) -> Self {
        match err {
            instant_acme::Error::Api(problem) => ClientError::Problem(to_problem(&problem)),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

fn challenge_kind(kind: &ChallengeType) -> ChallengeKind {
    match kind {
        ChallengeType::Http01 => ChallengeKind::Http01,
        ChallengeType::Dns01 => ChallengeKind::Dns01,
        ChallengeType::TlsAlpn01 => ChallengeKind::TlsAlpn01,
        #[allow(unreachable_patterns)]
        other => ChallengeKind::Other(format!("{other:?}")),
    }
}

/// Account URL recorded in serialized account credentials
fn account_id(credentials_json: &str) -> Result<String, ClientError> {
    let value: serde_json::Value = serde_json::from_str(credentials_json)
        .map_err(|e| ClientError::Unexpected(format!("unreadable account credentials: {e}")))?;
    value
        .get("id")
        .and_then(|id| id.as_str())
        .map(str::to_string)
        .ok_or_else(|| ClientError::Unexpected("account credentials carry no id".into()))
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    fn directory_url(&self) -> &str {
        &self.directory_url
    }

    async fn new_account(&self, request: &AccountRequest) -> Result<AcmeAccount, ClientError> {
        let contacts: Vec<&str> = request.contacts.iter().map(String::as_str).collect();

        let eab = match &request.eab {
            Some(eab) => {
                let key = eab.hmac_bytes().ok_or_else(|| {
                    ClientError::Problem(AcmeProblem::local("eab-hmac-invalid", "EAB HMAC is not base64"))
                })?;
                Some(ExternalAccountKey::new(eab.kid.clone(), &key))
            }
            None => None,
        };

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contacts,
                terms_of_service_agreed: request.agree_tos,
                only_return_existing: false,
            },
            &self.directory_url,
            eab.as_ref(),
        )
        .await?;

        let key_material = serde_json::to_string(&credentials)
            .map_err(|e| ClientError::Unexpected(format!("failed to serialize account: {e}")))?;
        let url = account_id(&key_material)?;
        self.accounts.insert(url.clone(), Arc::new(account));

        info!(account = %url, directory = %self.directory_url, "Registered ACME account");

        Ok(AcmeAccount {
            url,
            directory: self.directory_url.clone(),
            contacts: request.contacts.clone(),
            tos_agreed: request.agree_tos,
            eab_kid: request.eab.as_ref().map(|eab| eab.kid.clone()),
            key_material,
        })
    }

    async fn verify_account(&self, account: &AcmeAccount) -> Result<(), ClientError> {
        if account.directory != self.directory_url {
            return Err(ClientError::Problem(AcmeProblem::acme(
                "accountDoesNotExist",
                format!("account belongs to {}", account.directory),
            )));
        }
        self.account(account).await.map(|_| ())
    }

    async fn new_order(
        &self,
        account: &AcmeAccount,
        names: &[String],
    ) -> Result<Order, ClientError> {
        let acme_account = self.account(account).await?;
        let identifiers: Vec<Identifier> =
            names.iter().map(|n| Identifier::Dns(n.clone())).collect();

        let mut order = acme_account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;
        let authorizations = order.authorizations().await?;

        let mut entry = OrderEntry {
            order,
            identifiers: order_identifiers(&authorizations),
        };
        let snapshot = self.snapshot(&mut entry);
        debug!(
            order = %snapshot.url,
            requested = ?names,
            identifiers = ?snapshot.identifiers,
            "Created ACME order"
        );
        self.orders
            .insert(snapshot.url.clone(), Arc::new(Mutex::new(entry)));
        Ok(snapshot)
    }

    async fn get_order(&self, _account: &AcmeAccount, url: &str) -> Result<Order, ClientError> {
        let handle = self.handle(url)?;
        let mut entry = handle.lock().await;
        entry.order.refresh().await?;
        Ok(self.snapshot(&mut entry))
    }

    async fn get_authorization(
        &self,
        _account: &AcmeAccount,
        url: &str,
    ) -> Result<Authorization, ClientError> {
        let (handle, authz) = self.find_authorization(url).await?;
        let order_url = handle.lock().await.order.url().to_string();

        for challenge in &authz.challenges {
            self.owners.insert(challenge.url.clone(), order_url.clone());
        }
        Ok(to_authorization(url, &authz))
    }

    async fn challenge_proof(
        &self,
        _account: &AcmeAccount,
        authorization: &Authorization,
        challenge: &Challenge,
    ) -> Result<ChallengeProof, ClientError> {
        let (handle, authz) = self.find_authorization(&authorization.url).await?;
        let acme_challenge = authz
            .challenges
            .iter()
            .find(|c| c.url == challenge.url)
            .ok_or_else(|| {
                ClientError::Unexpected(format!("challenge {} not offered", challenge.url))
            })?;

        let entry = handle.lock().await;
        let key_auth = entry.order.key_authorization(acme_challenge);
        Ok(ChallengeProof {
            domain: authorization.domain.clone(),
            kind: challenge.kind.clone(),
            token: challenge.token.clone(),
            key_authorization: key_auth.as_str().to_string(),
            dns_value: key_auth.dns_value(),
        })
    }

    async fn trigger_challenge(
        &self,
        _account: &AcmeAccount,
        challenge_url: &str,
    ) -> Result<(), ClientError> {
        let handle = self.handle(challenge_url)?;
        let mut entry = handle.lock().await;
        entry.order.set_challenge_ready(challenge_url).await?;
        Ok(())
    }

    async fn finalize_order(
        &self,
        _account: &AcmeAccount,
        order: &Order,
        csr_der: &[u8],
    ) -> Result<Order, ClientError> {
        let handle = self.handle(&order.url)?;
        let mut entry = handle.lock().await;
        entry.order.finalize(csr_der).await?;
        Ok(self.snapshot(&mut entry))
    }

    async fn download_certificate(
        &self,
        _account: &AcmeAccount,
        url: &str,
    ) -> Result<CertificateDownload, ClientError> {
        let handle = self.handle(url)?;
        let mut entry = handle.lock().await;
        let pem = entry
            .order
            .certificate()
            .await?
            .ok_or_else(|| ClientError::Unexpected("certificate not yet available".into()))?;

        let chain = CertificateChain::from_pem(&pem)
            .map_err(|e| ClientError::Unexpected(e.to_string()))?;
        Ok(CertificateDownload {
            certificates: chain.iter().map(<[u8]>::to_vec).collect(),
            next: None,
        })
    }

    async fn release_order(&self, order_url: &str) {
        if self.orders.remove(order_url).is_some() {
            self.owners.retain(|_, owner| owner != order_url);
            debug!(order = %order_url, "Released order handle");
        }
    }
}
