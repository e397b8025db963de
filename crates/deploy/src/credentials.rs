//! Secrets read once at startup.

use std::fmt;

use serde::Deserialize;

use crate::verify::Explorer;

/// Secret material supplied through the environment or a local config file.
///
/// Held for the duration of a run only; nothing in this crate writes it anywhere.
#[derive(Clone, Default, Deserialize)]
pub struct Secrets {
    /// BIP-39 wallet seed phrase.
    #[serde(default)]
    pub mnemonic: Option<String>,
    /// Account index derived from the mnemonic.
    #[serde(default)]
    pub address_index: u32,
    /// Hex private key, used when no mnemonic is given.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub rpc_api_key: Option<String>,
    #[serde(default)]
    pub rpc_api_secret: Option<String>,
    /// Fallback key for any block explorer.
    #[serde(default)]
    pub verify_api_key: Option<String>,
    #[serde(default)]
    pub etherscan_api_key: Option<String>,
    #[serde(default)]
    pub polygonscan_api_key: Option<String>,
}

/// The key material a signer is derived from.
#[derive(Clone, PartialEq, Eq)]
pub enum SignerCredential {
    Mnemonic { phrase: String, index: u32 },
    PrivateKey(String),
}

impl SignerCredential {
    /// Pick the credential to sign with. A mnemonic always wins over a raw private key.
    pub fn select(mnemonic: Option<&str>, index: u32, private_key: Option<&str>) -> Option<Self> {
        match (non_empty(mnemonic), non_empty(private_key)) {
            (Some(phrase), _) => Some(SignerCredential::Mnemonic {
                phrase: phrase.to_string(),
                index,
            }),
            (None, Some(key)) => Some(SignerCredential::PrivateKey(key.to_string())),
            (None, None) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignerCredential::Mnemonic { .. } => "mnemonic",
            SignerCredential::PrivateKey(_) => "private-key",
        }
    }
}

impl fmt::Debug for SignerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerCredential::Mnemonic { index, .. } => f
                .debug_struct("Mnemonic")
                .field("phrase", &"<redacted>")
                .field("index", index)
                .finish(),
            SignerCredential::PrivateKey(_) => f.write_str("PrivateKey(<redacted>)"),
        }
    }
}

impl Secrets {
    pub fn credential(&self) -> Option<SignerCredential> {
        SignerCredential::select(
            self.mnemonic.as_deref(),
            self.address_index,
            self.private_key.as_deref(),
        )
    }

    pub fn rpc_api_key(&self) -> Option<&str> {
        non_empty(self.rpc_api_key.as_deref())
    }

    pub fn rpc_api_secret(&self) -> Option<&str> {
        non_empty(self.rpc_api_secret.as_deref())
    }

    /// API key for an explorer. Explorer-specific keys take precedence over `VERIFY_API_KEY`.
    pub fn verify_api_key(&self, explorer: Explorer) -> Option<&str> {
        let specific = match explorer {
            Explorer::Etherscan => self.etherscan_api_key.as_deref(),
            Explorer::Polygonscan => self.polygonscan_api_key.as_deref(),
        };
        non_empty(specific).or_else(|| non_empty(self.verify_api_key.as_deref()))
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Secrets")
            .field("mnemonic", &redact(&self.mnemonic))
            .field("address_index", &self.address_index)
            .field("private_key", &redact(&self.private_key))
            .field("rpc_api_key", &redact(&self.rpc_api_key))
            .field("rpc_api_secret", &redact(&self.rpc_api_secret))
            .field("verify_api_key", &redact(&self.verify_api_key))
            .field("etherscan_api_key", &redact(&self.etherscan_api_key))
            .field("polygonscan_api_key", &redact(&self.polygonscan_api_key))
            .finish()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "test test test test test test test test test test test junk";
    const KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    #[test]
    fn test_mnemonic_wins_over_private_key() {
        let both = SignerCredential::select(Some(PHRASE), 3, Some(KEY)).unwrap();
        assert_eq!(
            both,
            SignerCredential::Mnemonic {
                phrase: PHRASE.to_string(),
                index: 3
            }
        );
    }

    #[test]
    fn test_private_key_fallback() {
        let key_only = SignerCredential::select(None, 0, Some(KEY)).unwrap();
        assert_eq!(key_only, SignerCredential::PrivateKey(KEY.to_string()));

        let blank_mnemonic = SignerCredential::select(Some("  "), 0, Some(KEY)).unwrap();
        assert_eq!(blank_mnemonic.kind(), "private-key");

        assert!(SignerCredential::select(None, 0, None).is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let secrets = Secrets {
            mnemonic: Some(PHRASE.to_string()),
            private_key: Some(KEY.to_string()),
            ..Default::default()
        };
        let debug = format!("{:?} {:?}", secrets, secrets.credential().unwrap());
        assert!(!debug.contains("junk"));
        assert!(!debug.contains("59c6995e"));
    }

    #[test]
    fn test_verify_key_precedence() {
        let secrets = Secrets {
            verify_api_key: Some("generic".to_string()),
            polygonscan_api_key: Some("poly".to_string()),
            ..Default::default()
        };
        assert_eq!(secrets.verify_api_key(Explorer::Polygonscan), Some("poly"));
        assert_eq!(secrets.verify_api_key(Explorer::Etherscan), Some("generic"));
        assert_eq!(Secrets::default().verify_api_key(Explorer::Etherscan), None);
    }
}
