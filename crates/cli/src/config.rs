//! Host configuration file
//!
//! ```toml
//! staging = true
//! contacts = ["mailto:ops@example.org"]
//! agree_tos = true
//! storage = "/var/lib/certdrive"
//! webroot = "/var/www/html"
//!
//! [eab]
//! kid = "kid-1"
//! hmac = "aGVsbG8"
//!
//! [drive]
//! authz_timeout_secs = 300
//!
//! [[domain]]
//! name = "example.org"
//! aliases = ["www.example.org"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use certdrive::client::{LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
use certdrive::{AccountRequest, ChallengeKind, DriveConfig, ExternalAccountBinding, ManagedDomain};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    /// ACME directory URL; overrides `staging`
    #[serde(default)]
    pub directory: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[serde(default)]
    pub staging: bool,

    #[serde(default)]
    pub contacts: Vec<String>,

    #[serde(default)]
    pub agree_tos: bool,

    #[serde(default)]
    pub eab: Option<ExternalAccountBinding>,

    /// Root of the credential store
    pub storage: PathBuf,

    /// Document root served for HTTP-01 challenges
    pub webroot: PathBuf,

    #[serde(default)]
    pub drive: DriveConfig,

    #[serde(default, rename = "domain")]
    pub domains: Vec<DomainEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainEntry {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub challenge_types: Option<Vec<ChallengeKind>>,
}

impl CliConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: CliConfig = toml::from_str(text).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.drive.validate().context("Invalid [drive] section")?;

        if self.domains.is_empty() {
            bail!("no [[domain]] entries configured");
        }
        let mut seen = HashSet::new();
        for domain in self.managed_domains() {
            domain
                .validate()
                .with_context(|| format!("Invalid domain entry '{}'", domain.name))?;
            for name in domain.names() {
                if !seen.insert(name.clone()) {
                    bail!("name '{name}' is configured for more than one domain");
                }
            }
        }
        Ok(())
    }

    pub fn directory_url(&self) -> &str {
        match (&self.directory, self.staging) {
            (Some(url), _) => url,
            (None, true) => LETS_ENCRYPT_STAGING,
            (None, false) => LETS_ENCRYPT_PRODUCTION,
        }
    }

    pub fn account_request(&self) -> AccountRequest {
        AccountRequest {
            contacts: self.contacts.clone(),
            agree_tos: self.agree_tos,
            eab: self.eab.clone(),
        }
    }

    pub fn managed_domains(&self) -> Vec<ManagedDomain> {
        self.domains
            .iter()
            .map(|entry| {
                let domain = ManagedDomain::new(entry.name.clone()).with_aliases(entry.aliases.clone());
                match &entry.challenge_types {
                    Some(types) => domain.with_challenge_types(types.clone()),
                    None => domain,
                }
            })
            .collect()
    }
}
