//! Builder module for creating a [`Deployer`] configuration.
//!
//! This module provides the [`DeployerBuilder`] struct which resolves the network registry
//! (built-in table plus optional overrides), checks that the target network exists and
//! fills in defaults for everything else.

use std::path::PathBuf;

use alloy_core::primitives::Address;
use anyhow::{Context, Result};

use crate::{
    Deployer,
    credentials::Secrets,
    executor::ExecutorOptions,
    network::{DEFAULT_NETWORK, NetworkRegistry},
    sequencer::SequenceOptions,
    step::{ProxyVersion, StepId},
};

/// Default directory of compiled contract artifacts.
pub const DEFAULT_ARTIFACTS_DIR: &str = "build/contracts";

/// Builder for creating a [`Deployer`] configuration.
///
/// # Example
///
/// ```no_run
/// use acr_deploy::{DeployerBuilder, Secrets};
///
/// # fn example() -> anyhow::Result<()> {
/// let deployer = DeployerBuilder::new("goerli")
///     .secrets(Secrets::default())
///     .records_path("deployments/goerli.json")
///     .verify(true)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DeployerBuilder {
    /// The network to deploy to.
    network: String,
    /// Extra network table overlaid on the built-in one.
    networks_file: Option<PathBuf>,
    secrets: Secrets,
    artifacts_dir: Option<PathBuf>,
    records_path: Option<PathBuf>,
    verify: bool,
    admin: Option<Address>,
    proxy_version: ProxyVersion,
    executor: ExecutorOptions,
    sequence: SequenceOptions,
}

impl Default for DeployerBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_NETWORK)
    }
}

impl DeployerBuilder {
    /// Create a new [`DeployerBuilder`] targeting `network`.
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            networks_file: None,
            secrets: Secrets::default(),
            artifacts_dir: None,
            records_path: None,
            verify: false,
            admin: None,
            proxy_version: ProxyVersion::default(),
            executor: ExecutorOptions::default(),
            sequence: SequenceOptions::default(),
        }
    }

    /// Overlay the profiles of a TOML network table on the built-in ones.
    pub fn networks_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.networks_file = Some(path.into());
        self
    }

    pub fn secrets(mut self, secrets: Secrets) -> Self {
        self.secrets = secrets;
        self
    }

    /// Set the directory holding compiled artifacts.
    ///
    /// If not set, defaults to `./build/contracts`.
    pub fn artifacts_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(path.into());
        self
    }

    /// Persist deployment records to this file and resume from it.
    pub fn records_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.records_path = Some(path.into());
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Set the proxy admin of upgradeable contracts.
    pub fn admin(mut self, admin: Address) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Set the OpenZeppelin generation of the proxy contracts in the artifacts directory.
    pub fn proxy_version(mut self, version: ProxyVersion) -> Self {
        self.proxy_version = version;
        self
    }

    pub fn skip_dry_run(mut self, skip: bool) -> Self {
        self.executor.skip_dry_run = skip;
        self
    }

    pub fn executor_options(mut self, options: ExecutorOptions) -> Self {
        self.executor = options;
        self
    }

    /// Resume the plan at `step`, skipping the steps declared before it.
    pub fn start_from(mut self, step: impl Into<StepId>) -> Self {
        self.sequence.start_from = Some(step.into());
        self
    }

    pub fn redeploy(mut self, redeploy: bool) -> Self {
        self.sequence.redeploy = redeploy;
        self
    }

    /// Build the [`Deployer`] configuration.
    ///
    /// Fails if the network table is invalid or does not contain the target network.
    pub fn build(self) -> Result<Deployer> {
        let mut registry =
            NetworkRegistry::builtin().context("Built-in network table is invalid")?;
        if let Some(path) = &self.networks_file {
            registry = registry.with_overrides_file(path)?;
        }

        let profile = registry.resolve(&self.network)?;

        tracing::info!(
            network = %profile.name,
            chain_id = profile.chain_id,
            risk = %profile.risk,
            verify = self.verify,
            proxy_version = %self.proxy_version,
            "Building ACR deployer configuration..."
        );

        Ok(Deployer {
            network: self.network,
            registry,
            secrets: self.secrets,
            artifacts_dir: self
                .artifacts_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_DIR)),
            records_path: self.records_path,
            verify: self.verify,
            admin: self.admin,
            proxy_version: self.proxy_version,
            executor: self.executor,
            sequence: self.sequence,
        })
    }
}
