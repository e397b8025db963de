//! Source verification on block explorers.
//!
//! Verification itself is performed by an external tool. A migration run only checks up
//! front that an explorer key is available and, once contracts are deployed, writes a
//! manifest describing what should be verified.

use std::path::Path;

use alloy_core::primitives::{Address, Bytes};
use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    credentials::Secrets,
    error::DeployError,
    fs::FsHandler,
    network::NetworkProfile,
    records::{ContractKind, RecordBook},
    step::{DeploymentStep, ProxyVersion, StepKind, encode_args},
};

/// File name of the manifest written next to the deployment records.
pub const MANIFEST_FILE: &str = "verification.json";

/// Supported block explorers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Explorer {
    Etherscan,
    Polygonscan,
}

impl Explorer {
    /// Environment variable holding the explorer-specific API key.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            Explorer::Etherscan => "ETHERSCAN_API_KEY",
            Explorer::Polygonscan => "POLYGONSCAN_API_KEY",
        }
    }
}

/// Check that verification can run on `profile` before anything is deployed, and return
/// the explorer to verify against.
///
/// Networks without an explorer have nothing to verify against and yield `None`.
pub fn require_api_key(
    profile: &NetworkProfile,
    secrets: &Secrets,
) -> Result<Option<Explorer>, DeployError> {
    let Some(explorer) = profile.explorer else {
        tracing::warn!(network = %profile.name, "No block explorer configured, skipping verification");
        return Ok(None);
    };

    if secrets.verify_api_key(explorer).is_none() {
        return Err(DeployError::MissingVerificationKey {
            explorer: explorer.to_string(),
            var: explorer.api_key_var(),
        });
    }
    tracing::debug!(network = %profile.name, %explorer, "Verification key present");
    Ok(Some(explorer))
}

/// One contract to verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub contract: String,
    pub address: Address,
    /// ABI-encoded constructor arguments.
    pub constructor_arguments: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationManifest {
    pub network: String,
    pub chain_id: u64,
    pub explorer: Explorer,
    pub contracts: Vec<VerificationRequest>,
}

impl VerificationManifest {
    /// Describe every deployed contract of `plan`. Proxied steps contribute the logic
    /// contract, the proxy, and the `ProxyAdmin` deployed for it, if any.
    pub fn build(
        profile: &NetworkProfile,
        explorer: Explorer,
        plan: &[DeploymentStep],
        records: &RecordBook,
    ) -> Result<Self, DeployError> {
        let mut contracts = Vec::new();

        for step in plan {
            let Some(record) = records.get(&step.id) else {
                continue;
            };

            match (&step.kind, record.kind, &record.proxy) {
                (StepKind::Plain, _, _) => {
                    let args = step.resolve_args(records)?;
                    contracts.push(VerificationRequest {
                        contract: record.contract.clone(),
                        address: record.address,
                        constructor_arguments: encode_args(&args),
                    });
                }
                (StepKind::Upgradeable(config), ContractKind::Upgradeable, Some(proxy)) => {
                    contracts.push(VerificationRequest {
                        contract: record.contract.clone(),
                        address: proxy.logic,
                        constructor_arguments: Bytes::new(),
                    });

                    let constructor_admin = match config.version {
                        ProxyVersion::V4 => proxy.admin,
                        ProxyVersion::V5 => proxy.owner.unwrap_or(proxy.admin),
                    };
                    let init_data = config.initializer_calldata(&step.args, &step.resolve_args(records)?);
                    contracts.push(VerificationRequest {
                        contract: config.proxy.name.clone(),
                        address: proxy.proxy,
                        constructor_arguments: encode_args(&config.proxy_constructor_args(
                            proxy.logic,
                            constructor_admin,
                            init_data,
                        )),
                    });

                    if let (ProxyVersion::V4, Some(proxy_admin), Some(_)) =
                        (config.version, &config.proxy_admin, proxy.owner)
                    {
                        contracts.push(VerificationRequest {
                            contract: proxy_admin.name.clone(),
                            address: proxy.admin,
                            constructor_arguments: Bytes::new(),
                        });
                    }
                }
                _ => {
                    tracing::warn!(step = %step.id, "Record does not match the step kind, not verifying");
                }
            }
        }

        Ok(Self {
            network: profile.name.clone(),
            chain_id: profile.chain_id,
            explorer,
            contracts,
        })
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize verification manifest")?;
        FsHandler::write_atomic(path, json.as_bytes())
            .with_context(|| format!("Failed to write verification manifest to {}", path.display()))
    }
}
