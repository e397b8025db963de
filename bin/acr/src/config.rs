//! Secrets loading.

use std::path::Path;

use acr_deploy::Secrets;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};

/// Environment variables read as secrets, named after the [`Secrets`] fields.
const SECRET_VARS: &[&str] = &[
    "MNEMONIC",
    "ADDRESS_INDEX",
    "PRIVATE_KEY",
    "RPC_API_KEY",
    "RPC_API_SECRET",
    "VERIFY_API_KEY",
    "ETHERSCAN_API_KEY",
    "POLYGONSCAN_API_KEY",
];

/// Read the secrets from `path` (if it exists) and the environment.
///
/// `INFURA_API_KEY` and `INFURA_API_SECRET` are accepted as aliases of the RPC credentials,
/// the canonical names win when both are set.
pub fn load_secrets(path: &Path) -> Result<Secrets> {
    let secrets: Secrets = figment(path)
        .extract()
        .with_context(|| format!("Failed to read secrets from {} and the environment", path.display()))?;

    tracing::debug!(?secrets, "Secrets loaded");
    Ok(secrets)
}

fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Toml::file(path))
        .merge(
            Env::raw()
                .only(&["INFURA_API_KEY"])
                .map(|_| "rpc_api_key".into()),
        )
        .merge(
            Env::raw()
                .only(&["INFURA_API_SECRET"])
                .map(|_| "rpc_api_secret".into()),
        )
        .merge(Env::raw().only(SECRET_VARS))
}
