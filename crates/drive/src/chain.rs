//! Certificate chain assembly
//!
//! A certificate download may carry a link to the next part of the chain.
//! [`ChainFetch`] follows those links as a lazy, finite sequence of
//! certificates: it yields each certificate once, stops after the last
//! link or at the hop cap, and cannot be restarted.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::client::AcmeClient;
use crate::config::DriveConfig;
use crate::credentials::CertificateChain;
use crate::domain::AcmeAccount;
use crate::error::DriveError;
use crate::poll::retry_transient;
use crate::resources::CertificateDownload;

/// Lazily fetched chain, leaf first
pub struct ChainFetch<'a> {
    client: &'a dyn AcmeClient,
    account: &'a AcmeAccount,
    config: &'a DriveConfig,
    buffered: VecDeque<Vec<u8>>,
    next_link: Option<String>,
    hops: usize,
    finished: bool,
}

impl<'a> ChainFetch<'a> {
    /// Start from the initial download, which holds the leaf
    pub fn new(
        client: &'a dyn AcmeClient,
        account: &'a AcmeAccount,
        config: &'a DriveConfig,
        initial: CertificateDownload,
    ) -> Self {
        Self {
            client,
            account,
            config,
            buffered: initial.certificates.into(),
            next_link: initial.next,
            hops: 0,
            finished: false,
        }
    }

    /// Links followed so far
    pub fn hops(&self) -> usize {
        self.hops
    }

    /// The next certificate, `None` once the chain is exhausted
    ///
    /// After an error the sequence is finished.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, DriveError>> {
        loop {
            if let Some(cert) = self.buffered.pop_front() {
                return Some(Ok(cert));
            }
            if self.finished {
                return None;
            }
            let Some(link) = self.next_link.take() else {
                self.finished = true;
                return None;
            };
            if self.hops >= self.config.max_chain_hops {
                self.finished = true;
                return Some(Err(DriveError::ChainTooLong {
                    max_hops: self.config.max_chain_hops,
                }));
            }
            self.hops += 1;

            trace!(link = %link, hop = self.hops, "Following chain link");
            let download = retry_transient(self.config, "chain-link", || {
                self.client.download_certificate(self.account, &link)
            })
            .await;

            match download {
                Ok(download) if download.certificates.is_empty() => {
                    self.finished = true;
                    return Some(Err(DriveError::ChainFetch(format!(
                        "{link} returned no certificates"
                    ))));
                }
                Ok(download) => {
                    self.buffered.extend(download.certificates);
                    self.next_link = download.next;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(DriveError::ChainFetch(format!("{link}: {e}"))));
                }
            }
        }
    }
}

/// Assemble the full chain from the initial certificate download
///
/// Any failure is fatal: a leaf without its chain is never returned.
pub async fn fetch_chain(
    client: &dyn AcmeClient,
    account: &AcmeAccount,
    config: &DriveConfig,
    initial: CertificateDownload,
) -> Result<CertificateChain, DriveError> {
    if initial.certificates.is_empty() {
        return Err(DriveError::ChainFetch(
            "certificate download returned no certificates".into(),
        ));
    }

    let mut fetch = ChainFetch::new(client, account, config, initial);
    let mut chain = CertificateChain::default();
    while let Some(cert) = fetch.next().await {
        chain.push(cert?);
    }

    debug!(chain_len = chain.len(), hops = fetch.hops(), "Certificate chain assembled");
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::OrderStatus;
    use crate::testing::{FakeAcme, Script};
    use proptest::prelude::*;

    /// Run a single-name order on `fake` to a downloadable certificate
    async fn issued_download(fake: &FakeAcme, account: &AcmeAccount) -> CertificateDownload {
        let order = fake.issue_for_test(account, &["example.org".to_string()]).await;
        assert_eq!(order.status, OrderStatus::Valid);
        let url = order.certificate_url.unwrap();
        fake.download_certificate(account, &url).await.unwrap()
    }

    fn fake_with(configure: impl FnOnce(&mut Script)) -> (FakeAcme, AcmeAccount) {
        let fake = FakeAcme::new();
        fake.configure(configure);
        let account = fake.test_account();
        (fake, account)
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_next_link() {
        let (fake, account) = fake_with(|s| s.chain_links = 1);
        let config = DriveConfig::default();
        let initial = issued_download(&fake, &account).await;
        assert!(initial.next.is_some());

        let chain = fetch_chain(&fake, &account, &config, initial).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.iter().nth(1), Some(fake.ca_der()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_is_byte_identical() {
        let (fake, account) = fake_with(|s| s.chain_links = 1);
        let config = DriveConfig::default();
        let initial = issued_download(&fake, &account).await;

        let first = fetch_chain(&fake, &account, &config, initial.clone())
            .await
            .unwrap();
        let second = fetch_chain(&fake, &account, &config, initial).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_link_is_fatal() {
        let (fake, account) = fake_with(|s| {
            s.chain_links = 2;
            s.broken_link = true;
        });
        let config = DriveConfig::default();
        let initial = issued_download(&fake, &account).await;

        let err = fetch_chain(&fake, &account, &config, initial).await.unwrap_err();
        assert!(matches!(err, DriveError::ChainFetch(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_is_not_restartable() {
        let (fake, account) = fake_with(|s| s.chain_links = 1);
        let config = DriveConfig::default();
        let initial = issued_download(&fake, &account).await;

        let mut fetch = ChainFetch::new(&fake, &account, &config, initial);
        let mut count = 0;
        while let Some(cert) = fetch.next().await {
            cert.unwrap();
            count += 1;
        }
        assert_eq!(count, 2);
        assert!(fetch.next().await.is_none());
        assert_eq!(fetch.hops(), 1);
    }

    #[test]
    fn test_empty_initial_download_is_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (fake, account) = fake_with(|_| {});
        let config = DriveConfig::default();
        let initial = CertificateDownload {
            certificates: vec![],
            next: None,
        };
        let err = rt
            .block_on(fetch_chain(&fake, &account, &config, initial))
            .unwrap_err();
        assert!(matches!(err, DriveError::ChainFetch(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn hop_cap_bounds_chain(links in 0usize..14, max_hops in 1usize..10, endless in any::<bool>()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let (fake, account) = fake_with(|s| {
                s.chain_links = links;
                s.endless_chain = endless;
            });
            let config = DriveConfig { max_chain_hops: max_hops, ..Default::default() };

            let result = rt.block_on(async {
                let initial = issued_download(&fake, &account).await;
                fetch_chain(&fake, &account, &config, initial).await
            });

            if endless || links > max_hops {
                let is_too_long = matches!(result, Err(DriveError::ChainTooLong { .. }));
                prop_assert!(is_too_long);
            } else {
                prop_assert_eq!(result.unwrap().len(), links + 1);
            }
        }
    }
}
