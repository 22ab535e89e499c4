//! OS-keyring-only credential resolution: never from environment
//! variables or config files.

use keyring::Entry;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ConfigError, Result};

const SERVICE: &str = "shelfsync";

/// A secret that zeroes its backing buffer on drop. Holds the remote
/// backend's API key once resolved from the keyring.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Resolves and stores the remote backend's API key against a single OS
/// keyring entry, scoped per store name so multiple libraries bound to
/// different stores don't collide.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    account: String,
}

impl CredentialStore {
    pub fn for_store(store_name: &str) -> Self {
        Self {
            account: store_name.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE, &self.account).map_err(|source| ConfigError::Keyring {
            entry: self.account.clone(),
            source,
        })
    }

    /// Loads the API key. Fails with `CredentialMissing` rather than
    /// falling back to any other source.
    pub fn get_api_key(&self) -> Result<ApiKey> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(secret) => Ok(ApiKey(secret)),
            Err(keyring::Error::NoEntry) => Err(ConfigError::CredentialMissing {
                entry: self.account.clone(),
            }),
            Err(source) => Err(ConfigError::Keyring {
                entry: self.account.clone(),
                source,
            }),
        }
    }

    pub fn set_api_key(&self, secret: &str) -> Result<()> {
        let entry = self.entry()?;
        entry.set_password(secret).map_err(|source| ConfigError::Keyring {
            entry: self.account.clone(),
            source,
        })
    }

    pub fn clear_api_key(&self) -> Result<()> {
        let entry = self.entry()?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(source) => Err(ConfigError::Keyring {
                entry: self.account.clone(),
                source,
            }),
        }
    }
}
