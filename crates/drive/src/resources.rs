//! Abstract views of the ACME resources the driver works with.
//!
//! These carry only the status and identifier fields the driver needs.
//! The JSON shapes belong to the facade implementation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AcmeProblem;

/// Order status (RFC 8555 section 7.1.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        }
    }
}

/// An ACME order as seen by the driver
#[derive(Debug, Clone)]
pub struct Order {
    /// Server assigned order URL
    pub url: String,
    pub status: OrderStatus,
    /// Domain names the order covers
    pub identifiers: Vec<String>,
    /// One authorization URL per identifier
    pub authorizations: Vec<String>,
    pub finalize_url: String,
    /// Present once the order is valid
    pub certificate_url: Option<String>,
    /// Error the server attached to an invalid order
    pub error: Option<AcmeProblem>,
}

impl Order {
    /// Whether the order covers exactly `names`, ignoring order and case
    pub fn covers_exactly(&self, names: &[String]) -> bool {
        normalized(&self.identifiers) == normalized(names)
    }
}

pub(crate) fn normalized(names: &[String]) -> std::collections::BTreeSet<String> {
    names.iter().map(|n| n.trim().to_ascii_lowercase()).collect()
}

/// Authorization status (RFC 8555 section 7.1.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Expired,
    Deactivated,
    Revoked,
}

impl AuthorizationStatus {
    /// Terminal statuses end polling
    pub fn is_terminal(self) -> bool {
        !matches!(self, AuthorizationStatus::Pending)
    }
}

/// Proof-of-control record for one domain name in an order
#[derive(Debug, Clone)]
pub struct Authorization {
    pub url: String,
    /// Target domain name
    pub domain: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    /// Best available explanation for an invalid authorization
    pub fn failure_reason(&self) -> (String, Option<AcmeProblem>) {
        let problem = self.challenges.iter().find_map(|c| c.error.clone());
        let reason = match &problem {
            Some(p) if !p.detail.is_empty() => p.detail.clone(),
            Some(p) => p.problem_type.clone(),
            None => format!("authorization {}", self.status.as_str()),
        };
        (reason, problem)
    }
}

impl AuthorizationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Valid => "valid",
            AuthorizationStatus::Invalid => "invalid",
            AuthorizationStatus::Expired => "expired",
            AuthorizationStatus::Deactivated => "deactivated",
            AuthorizationStatus::Revoked => "revoked",
        }
    }
}

/// Challenge type tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChallengeKind {
    Http01,
    Dns01,
    TlsAlpn01,
    Other(String),
}

impl ChallengeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 => "dns-01",
            ChallengeKind::TlsAlpn01 => "tls-alpn-01",
            ChallengeKind::Other(s) => s,
        }
    }
}

impl From<String> for ChallengeKind {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "http-01" => ChallengeKind::Http01,
            "dns-01" => ChallengeKind::Dns01,
            "tls-alpn-01" => ChallengeKind::TlsAlpn01,
            _ => ChallengeKind::Other(s),
        }
    }
}

impl From<&str> for ChallengeKind {
    fn from(s: &str) -> Self {
        ChallengeKind::from(s.to_string())
    }
}

impl From<ChallengeKind> for String {
    fn from(kind: ChallengeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// One method of proving control offered within an authorization
#[derive(Debug, Clone)]
pub struct Challenge {
    pub url: String,
    pub kind: ChallengeKind,
    pub token: String,
    pub status: ChallengeStatus,
    pub error: Option<AcmeProblem>,
}

/// Result of downloading a certificate or a chain link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDownload {
    /// DER certificates in the order the server supplied them
    pub certificates: Vec<Vec<u8>>,
    /// Link to the next part of the chain, if the server supplied one
    pub next: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_kind_round_trip_names() {
        assert_eq!(ChallengeKind::from("HTTP-01"), ChallengeKind::Http01);
        assert_eq!(ChallengeKind::from("tls-alpn-01").as_str(), "tls-alpn-01");
        assert_eq!(
            ChallengeKind::from("email-reply-00"),
            ChallengeKind::Other("email-reply-00".into())
        );
    }

    #[test]
    fn test_order_covers_exactly_ignores_order_and_case() {
        let order = Order {
            url: "https://ca/order/1".into(),
            status: OrderStatus::Pending,
            identifiers: vec!["B.example".into(), "a.example".into()],
            authorizations: vec![],
            finalize_url: "https://ca/order/1/finalize".into(),
            certificate_url: None,
            error: None,
        };
        assert!(order.covers_exactly(&["a.example".into(), "b.example".into()]));
        assert!(!order.covers_exactly(&["a.example".into()]));
        assert!(!order.covers_exactly(&[
            "a.example".into(),
            "b.example".into(),
            "c.example".into()
        ]));
    }

    #[test]
    fn test_failure_reason_prefers_challenge_detail() {
        let authz = Authorization {
            url: "https://ca/authz/1".into(),
            domain: "b.example".into(),
            status: AuthorizationStatus::Invalid,
            challenges: vec![Challenge {
                url: "https://ca/chall/1".into(),
                kind: ChallengeKind::Dns01,
                token: "tok".into(),
                status: ChallengeStatus::Invalid,
                error: Some(AcmeProblem::acme("dns", "dns record not found")),
            }],
        };
        let (reason, problem) = authz.failure_reason();
        assert_eq!(reason, "dns record not found");
        assert!(problem.is_some());

        let bare = Authorization {
            challenges: vec![],
            status: AuthorizationStatus::Expired,
            ..authz
        };
        assert_eq!(bare.failure_reason().0, "authorization expired");
    }
}
