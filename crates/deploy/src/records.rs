//! Deployment records.
//!
//! A [`RecordBook`] holds everything a migration run knows about one network: the
//! contracts committed so far, transactions that were submitted but not yet confirmed,
//! and how far each proxied step has progressed. It is persisted as JSON between runs so
//! an interrupted migration can pick up where it stopped.

use std::{collections::BTreeMap, path::Path};

use alloy_core::primitives::{Address, TxHash};
use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{error::DeployError, fs::FsHandler, step::StepId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContractKind {
    Plain,
    Upgradeable,
}

/// The addresses behind an upgradeable contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAddresses {
    pub logic: Address,
    pub proxy: Address,
    pub admin: Address,
    /// Owner of the admin when the admin is a `ProxyAdmin` contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Address>,
    /// Logic contract replaced by the most recent upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_logic: Option<Address>,
}

/// The result of a completed deployment step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedContractRecord {
    pub step: StepId,
    pub contract: String,
    /// The address users interact with. The proxy address for upgradeable contracts.
    pub address: Address,
    pub kind: ContractKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyAddresses>,
    /// Hash of the step inputs the contract was deployed from.
    #[serde(default)]
    pub fingerprint: String,
    /// Unix timestamp of the commit.
    pub deployed_at: i64,
}

impl DeployedContractRecord {
    pub fn plain(
        step: StepId,
        contract: impl Into<String>,
        address: Address,
        fingerprint: String,
    ) -> Self {
        Self {
            step,
            contract: contract.into(),
            address,
            kind: ContractKind::Plain,
            proxy: None,
            fingerprint,
            deployed_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn upgradeable(
        step: StepId,
        contract: impl Into<String>,
        addresses: ProxyAddresses,
        fingerprint: String,
    ) -> Self {
        Self {
            step,
            contract: contract.into(),
            address: addresses.proxy,
            kind: ContractKind::Upgradeable,
            proxy: Some(addresses),
            fingerprint,
            deployed_at: chrono::Utc::now().timestamp(),
        }
    }

    /// The record after the proxy has been pointed at `new_logic`. The proxy address is unchanged.
    pub fn upgraded(&self, new_logic: Address, fingerprint: String) -> Self {
        let mut record = self.clone();
        if let Some(proxy) = record.proxy.as_mut() {
            proxy.previous_logic = Some(proxy.logic);
            proxy.logic = new_logic;
        }
        record.fingerprint = fingerprint;
        record.deployed_at = chrono::Utc::now().timestamp();
        record
    }
}

/// Lifecycle of an upgradeable deployment.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProxyState {
    #[default]
    NotDeployed,
    LogicDeployed,
    ProxyDeployed,
    Initialized,
    Upgraded,
}

/// Persisted progress of an upgradeable step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyProgress {
    pub state: ProxyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Address>,
    /// Transaction of the current transition, submitted but not yet confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tx: Option<TxHash>,
    /// Replacement logic deployed by an upgrade that has not been applied yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_logic: Option<Address>,
}

/// All deployment state of one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBook {
    pub network: String,
    pub chain_id: u64,
    #[serde(default)]
    records: BTreeMap<StepId, DeployedContractRecord>,
    /// Unconfirmed transactions of plain steps.
    #[serde(default)]
    pending: BTreeMap<StepId, Option<TxHash>>,
    #[serde(default)]
    progress: BTreeMap<StepId, ProxyProgress>,
}

impl RecordBook {
    pub fn new(network: impl Into<String>, chain_id: u64) -> Self {
        Self {
            network: network.into(),
            chain_id,
            records: BTreeMap::new(),
            pending: BTreeMap::new(),
            progress: BTreeMap::new(),
        }
    }

    pub fn get(&self, step: &StepId) -> Option<&DeployedContractRecord> {
        self.records.get(step)
    }

    pub fn address_of(&self, step: &StepId) -> Option<Address> {
        self.records.get(step).map(|record| record.address)
    }

    /// Commit a completed step. A step is committed exactly once.
    pub fn commit(&mut self, record: DeployedContractRecord) -> Result<(), DeployError> {
        if self.records.contains_key(&record.step) {
            return Err(DeployError::InvalidTransition(format!(
                "step '{}' is already recorded",
                record.step
            )));
        }
        self.pending.remove(&record.step);
        self.records.insert(record.step.clone(), record);
        Ok(())
    }

    /// Replace a record after an upgrade or an explicit redeploy.
    pub fn replace(&mut self, record: DeployedContractRecord) -> Option<DeployedContractRecord> {
        self.pending.remove(&record.step);
        self.records.insert(record.step.clone(), record)
    }

    pub fn records(&self) -> impl Iterator<Item = &DeployedContractRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pending(&self, step: &StepId) -> Option<TxHash> {
        self.pending.get(step).copied().flatten()
    }

    /// Where the unconfirmed transaction of a plain step is tracked.
    ///
    /// Written as soon as a transaction is submitted, so it survives an interrupted wait.
    pub fn pending_slot(&mut self, step: &StepId) -> &mut Option<TxHash> {
        self.pending.entry(step.clone()).or_default()
    }

    pub fn progress(&self, step: &StepId) -> Option<&ProxyProgress> {
        self.progress.get(step)
    }

    pub fn progress_mut(&mut self, step: &StepId) -> &mut ProxyProgress {
        self.progress.entry(step.clone()).or_default()
    }

    /// Fail if these records were written for another chain.
    pub fn ensure_network(&self, network: &str, chain_id: u64) -> Result<(), DeployError> {
        if self.chain_id != chain_id {
            return Err(DeployError::ChainIdMismatch {
                network: network.to_string(),
                expected: chain_id,
                actual: self.chain_id,
            });
        }
        Ok(())
    }

    /// Load records from `path`, or start empty if the file does not exist yet.
    pub fn load_or_new(path: &Path, network: &str, chain_id: u64) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No deployment records yet, starting fresh");
            return Ok(Self::new(network, chain_id));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read deployment records {}", path.display()))?;
        let book: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse deployment records {}", path.display()))?;

        book.ensure_network(network, chain_id)?;

        tracing::info!(
            path = %path.display(),
            records = book.len(),
            "Loaded deployment records"
        );
        Ok(book)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize deployment records")?;
        FsHandler::write_atomic(path, json.as_bytes())
    }
}
