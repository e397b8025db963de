//! Network profile registry.
//!
//! Every network the orchestrator can target is described by a [`NetworkProfile`]: its
//! chain id, how to reach it, the gas and confirmation policy to apply, and how risky it is
//! to deploy there. Profiles are plain data loaded from TOML, the built-in table ships in
//! `networks.toml` and can be overlaid with a user file.

use std::{collections::BTreeMap, path::Path, time::Duration};

use alloy_core::primitives::U256;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{credentials::Secrets, error::DeployError, verify::Explorer};

/// The built-in network table.
pub const BUILTIN_NETWORKS: &str = include_str!("../networks.toml");

/// The network used when none is given on the command line.
pub const DEFAULT_NETWORK: &str = "development";

/// Wei per gwei.
const GWEI: u64 = 1_000_000_000;

/// How risky it is to send transactions to a network.
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
pub enum RiskClass {
    /// A development node on the loopback interface.
    Local,
    /// A throwaway test chain on the loopback interface.
    Test,
    /// A public test network.
    Public,
    /// A public network holding real value.
    Production,
}

impl RiskClass {
    /// Public networks require an explicit signing credential and confirmations.
    pub fn is_public(&self) -> bool {
        matches!(self, RiskClass::Public | RiskClass::Production)
    }
}

/// Where the JSON-RPC endpoint of a network lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// A URL usable as-is.
    Fixed { url: Url },
    /// A URL containing `{api_key}` and optionally `{api_secret}` placeholders.
    Templated { template: String },
}

impl Endpoint {
    /// Produce the concrete endpoint URL, filling in provider credentials if needed.
    pub fn resolve(&self, network: &str, secrets: &Secrets) -> Result<Url, DeployError> {
        match self {
            Endpoint::Fixed { url } => Ok(url.clone()),
            Endpoint::Templated { template } => {
                let mut url = template.clone();

                if url.contains("{api_key}") {
                    let key = secrets.rpc_api_key().ok_or_else(|| {
                        DeployError::MissingEndpointCredential {
                            network: network.to_string(),
                            key: "RPC_API_KEY",
                        }
                    })?;
                    url = url.replace("{api_key}", key);
                }

                url = url.replace("{api_secret}", secrets.rpc_api_secret().unwrap_or_default());

                Url::parse(&url).map_err(|e| DeployError::InvalidProfile {
                    network: network.to_string(),
                    reason: format!("endpoint template does not yield a valid URL: {}", e),
                })
            }
        }
    }

    fn is_loopback(&self) -> bool {
        match self {
            Endpoint::Fixed { url } => matches!(
                url.host_str(),
                Some("127.0.0.1") | Some("localhost") | Some("[::1]")
            ),
            Endpoint::Templated { .. } => false,
        }
    }
}

/// EIP-1559 fee caps and gas limit applied to every transaction on a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas_gwei: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas_gwei: Option<u64>,
    /// Gas limit used when a step does not set its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
}

impl GasPolicy {
    pub fn max_fee_per_gas(&self) -> Option<U256> {
        self.max_fee_per_gas_gwei
            .map(|gwei| U256::from(gwei) * U256::from(GWEI))
    }

    pub fn max_priority_fee_per_gas(&self) -> Option<U256> {
        self.max_priority_fee_per_gas_gwei
            .map(|gwei| U256::from(gwei) * U256::from(GWEI))
    }
}

/// How long to wait on a network before giving up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Timeout for a single RPC round trip, including the initial chain id check.
    #[serde(default = "TimeoutPolicy::default_network_check_timeout_ms")]
    pub network_check_timeout_ms: u64,
    /// Number of blocks to wait for a transaction before reporting it as timed out.
    #[serde(default = "TimeoutPolicy::default_timeout_blocks")]
    pub timeout_blocks: u64,
    /// How long the chain head may stand still during a wait before it is reported as
    /// timed out. Block counting alone never ends on a halted node.
    #[serde(default = "TimeoutPolicy::default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

impl TimeoutPolicy {
    fn default_network_check_timeout_ms() -> u64 {
        5_000
    }

    fn default_timeout_blocks() -> u64 {
        50
    }

    fn default_stall_timeout_ms() -> u64 {
        120_000
    }

    pub fn network_check_timeout(&self) -> Duration {
        Duration::from_millis(self.network_check_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            network_check_timeout_ms: Self::default_network_check_timeout_ms(),
            timeout_blocks: Self::default_timeout_blocks(),
            stall_timeout_ms: Self::default_stall_timeout_ms(),
        }
    }
}

/// Whether transactions are simulated before being broadcast.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DryRunPolicy {
    Run,
    #[default]
    Skip,
}

/// Configuration record for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
    /// The network identifier, taken from the table key.
    #[serde(skip)]
    pub name: String,
    pub chain_id: u64,
    pub risk: RiskClass,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub gas: GasPolicy,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub timeouts: TimeoutPolicy,
    #[serde(default)]
    pub dry_run: DryRunPolicy,
    /// Block explorer used for source verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer: Option<Explorer>,
}

impl NetworkProfile {
    /// Fail if the chain reached through the endpoint is not the one this profile describes.
    pub fn check_chain_id(&self, actual: u64) -> Result<(), DeployError> {
        if actual != self.chain_id {
            return Err(DeployError::ChainIdMismatch {
                network: self.name.clone(),
                expected: self.chain_id,
                actual,
            });
        }
        Ok(())
    }

    pub fn requires_credential(&self) -> bool {
        self.risk.is_public()
    }

    pub fn dry_run_required(&self) -> bool {
        self.dry_run == DryRunPolicy::Run
    }

    fn validate(&self) -> Result<(), DeployError> {
        let invalid = |reason: &str| DeployError::InvalidProfile {
            network: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.risk.is_public() && self.confirmations == 0 {
            return Err(invalid("public networks need at least one confirmation"));
        }

        if !self.risk.is_public() && !self.endpoint.is_loopback() {
            return Err(invalid("local and test networks must use a fixed loopback endpoint"));
        }

        if let (Some(max_fee), Some(priority)) = (
            self.gas.max_fee_per_gas_gwei,
            self.gas.max_priority_fee_per_gas_gwei,
        ) {
            if priority > max_fee {
                return Err(invalid("max priority fee exceeds max fee"));
            }
        }

        Ok(())
    }
}

/// Read-only mapping from network identifier to profile.
///
/// The registry is assembled once at startup and only handed out by shared reference
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRegistry {
    profiles: BTreeMap<String, NetworkProfile>,
}

impl NetworkRegistry {
    /// The registry built from the shipped network table.
    pub fn builtin() -> Result<Self, DeployError> {
        Self::from_toml_str(BUILTIN_NETWORKS)
    }

    /// Parse and validate a network table.
    pub fn from_toml_str(content: &str) -> Result<Self, DeployError> {
        let registry = Self {
            profiles: parse_profiles(content)?,
        };
        registry.validate()?;
        Ok(registry)
    }

    /// Overlay profiles from a TOML file. Profiles with the same name replace the existing ones.
    pub fn with_overrides_file(self, path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read network table {}", path.display()))?;
        let overrides = parse_profiles(&content)
            .with_context(|| format!("Failed to parse network table {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            profiles = overrides.len(),
            "Loaded network overrides"
        );

        Ok(self.merge(overrides)?)
    }

    /// Add or replace profiles, then re-check the registry invariants.
    pub fn merge(mut self, overrides: BTreeMap<String, NetworkProfile>) -> Result<Self, DeployError> {
        self.profiles.extend(overrides);
        self.validate()?;
        Ok(self)
    }

    /// Look up the profile for a network.
    pub fn resolve(&self, network: &str) -> Result<&NetworkProfile, DeployError> {
        self.profiles
            .get(network)
            .ok_or_else(|| DeployError::UnknownNetwork {
                network: network.to_string(),
            })
    }

    pub fn by_chain_id(&self, chain_id: u64) -> Option<&NetworkProfile> {
        self.profiles.values().find(|p| p.chain_id == chain_id)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &NetworkProfile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    fn validate(&self) -> Result<(), DeployError> {
        let mut seen: BTreeMap<u64, &str> = BTreeMap::new();

        for profile in self.profiles.values() {
            profile.validate()?;

            if let Some(first) = seen.insert(profile.chain_id, &profile.name) {
                return Err(DeployError::DuplicateChainId {
                    chain_id: profile.chain_id,
                    first: first.to_string(),
                    second: profile.name.clone(),
                });
            }
        }

        Ok(())
    }
}

fn parse_profiles(content: &str) -> Result<BTreeMap<String, NetworkProfile>, DeployError> {
    let mut profiles: BTreeMap<String, NetworkProfile> =
        toml::from_str(content).map_err(|e| DeployError::InvalidProfile {
            network: "<table>".to_string(),
            reason: e.to_string(),
        })?;

    for (name, profile) in profiles.iter_mut() {
        profile.name = name.clone();
    }

    Ok(profiles)
}
