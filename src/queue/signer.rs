//! Ledger signing identity loaded from a NEAR credentials file.
//!
//! Credentials live at `<dir>/<network>/<account>.json`, the layout written by
//! `near login`:
//!
//! ```json
//! {"account_id": "worker.testnet", "public_key": "ed25519:...", "private_key": "ed25519:..."}
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signer as _, SigningKey};
use serde::Deserialize;

use crate::error::ConfigError;

const ED25519_PREFIX: &str = "ed25519:";

#[derive(Deserialize)]
struct KeyFile {
    account_id: String,
    #[serde(alias = "secret_key")]
    private_key: String,
}

/// An account id paired with its full-access ed25519 key.
pub struct Signer {
    account_id: String,
    key: SigningKey,
}

impl Signer {
    pub fn new(account_id: impl Into<String>, key: SigningKey) -> Self {
        Self {
            account_id: account_id.into(),
            key,
        }
    }

    /// Path of the key file for `account_id` on `network_id`.
    pub fn credentials_path(dir: &Path, network_id: &str, account_id: &str) -> PathBuf {
        dir.join(network_id).join(format!("{account_id}.json"))
    }

    /// Load the signer for `account_id` from a credentials directory.
    pub fn from_credentials(
        dir: &Path,
        network_id: &str,
        account_id: &str,
    ) -> Result<Self, ConfigError> {
        let path = Self::credentials_path(dir, network_id, account_id);
        let credentials_err = |reason: String| ConfigError::Credentials {
            path: path.display().to_string(),
            reason,
        };

        let raw = std::fs::read_to_string(&path).map_err(|e| credentials_err(e.to_string()))?;
        let file: KeyFile = serde_json::from_str(&raw).map_err(|e| credentials_err(e.to_string()))?;
        if file.account_id != account_id {
            return Err(credentials_err(format!(
                "key file belongs to {}, expected {account_id}",
                file.account_id
            )));
        }

        let key = parse_secret_key(&file.private_key).map_err(credentials_err)?;
        Ok(Self::new(file.account_id, key))
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Public key in NEAR text form (`ed25519:<base58>`).
    pub fn public_key(&self) -> String {
        format!(
            "{ED25519_PREFIX}{}",
            bs58::encode(self.public_key_bytes()).into_string()
        )
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("account_id", &self.account_id)
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Parse `ed25519:<base58>` holding either a 32-byte seed or the 64-byte
/// seed‖public keypair form NEAR tooling writes.
pub fn parse_secret_key(text: &str) -> Result<SigningKey, String> {
    let encoded = text
        .strip_prefix(ED25519_PREFIX)
        .ok_or_else(|| "only ed25519 keys are supported".to_string())?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| format!("invalid base58 key: {e}"))?;

    match bytes.len() {
        32 => {
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| "invalid key length".to_string())?;
            Ok(SigningKey::from_bytes(&seed))
        }
        64 => {
            let pair: [u8; 64] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| "invalid key length".to_string())?;
            SigningKey::from_keypair_bytes(&pair).map_err(|e| format!("inconsistent keypair: {e}"))
        }
        n => Err(format!("expected 32 or 64 key bytes, got {n}")),
    }
}
