use std::path::{Path, PathBuf};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use comfy_table::{Table, presets::UTF8_FULL};

use crate::{
    artifact::ContractArtifact,
    credentials::Secrets,
    error::{DeployError, StepFailure},
    executor::{ExecutorOptions, StepExecutor},
    fs::FsHandler,
    migrations::{AcrArtifacts, acr_plan},
    network::{NetworkProfile, NetworkRegistry},
    proxy::UpgradeProxyManager,
    records::{DeployedContractRecord, RecordBook},
    rpc::{ChainRpc, HttpRpc},
    sequencer::{CancelToken, MigrationSequencer, SequenceOptions},
    signer::{ProviderStrategy, SignerResolver, SigningTransport},
    step::{DeploymentStep, ProxyVersion, StepId},
    verify::{MANIFEST_FILE, VerificationManifest, require_api_key},
};

/// Runs the ACR migrations against one network.
#[derive(Debug, Clone)]
pub struct Deployer {
    /// The network to deploy to.
    pub network: String,
    pub registry: NetworkRegistry,
    pub secrets: Secrets,
    /// Directory holding the compiled contract artifacts.
    pub artifacts_dir: PathBuf,
    /// Record book to resume from and save to. Nothing is persisted when unset.
    pub records_path: Option<PathBuf>,
    /// Check for an explorer key up front and write a verification manifest.
    pub verify: bool,
    /// Proxy admin, the deploying account when unset.
    pub admin: Option<Address>,
    pub proxy_version: ProxyVersion,
    pub executor: ExecutorOptions,
    pub sequence: SequenceOptions,
}

/// Result of a migration run.
#[derive(Debug)]
pub struct MigrationReport {
    pub network: String,
    pub chain_id: u64,
    pub records: Vec<DeployedContractRecord>,
    pub executed: Vec<StepId>,
    pub failure: Option<StepFailure>,
    /// Where the verification manifest was written, if it was.
    pub manifest: Option<PathBuf>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// `step: address` for every completed step.
    pub fn address_lines(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|record| format!("{}: {}", record.step, record.address))
            .collect()
    }

    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL).set_header(vec![
            "Step", "Contract", "Address", "Kind", "Logic", "Admin",
        ]);

        for record in &self.records {
            let (logic, admin) = match &record.proxy {
                Some(proxy) => (proxy.logic.to_string(), proxy.admin.to_string()),
                None => (String::new(), String::new()),
            };
            table.add_row(vec![
                record.step.to_string(),
                record.contract.clone(),
                record.address.to_string(),
                record.kind.to_string(),
                logic,
                admin,
            ]);
        }
        table
    }
}

impl Deployer {
    pub fn profile(&self) -> Result<&NetworkProfile, DeployError> {
        self.registry.resolve(&self.network)
    }

    /// Load the artifacts and build the migration plan.
    pub fn plan(&self) -> Result<Vec<DeploymentStep>> {
        let artifacts = AcrArtifacts::load(&self.artifacts_dir, self.proxy_version)?;
        acr_plan(&artifacts, self.admin)
    }

    /// Where the verification manifest goes: next to the records, or the working directory.
    pub fn manifest_path(&self) -> PathBuf {
        self.records_path
            .as_deref()
            .and_then(Path::parent)
            .map(|dir| dir.join(MANIFEST_FILE))
            .unwrap_or_else(|| PathBuf::from(MANIFEST_FILE))
    }

    /// Connect to the network's endpoint and run the migrations.
    pub async fn migrate(&self, cancel: &CancelToken) -> Result<MigrationReport> {
        let rpc = self.connect()?;
        self.migrate_with(rpc, cancel).await
    }

    /// Run the migrations over `rpc`.
    pub async fn migrate_with<R: ChainRpc>(
        &self,
        rpc: R,
        cancel: &CancelToken,
    ) -> Result<MigrationReport> {
        let profile = self.profile()?;

        let explorer = if self.verify {
            require_api_key(profile, &self.secrets)?
        } else {
            None
        };

        let plan = self.plan().context("Failed to prepare the migration plan")?;
        let transport = self.transport(profile, rpc).await?;

        let _lock = self
            .records_path
            .as_deref()
            .map(FsHandler::lock_exclusive)
            .transpose()?;
        let mut records = self.load_records(profile)?;

        tracing::info!(
            network = %profile.name,
            chain_id = profile.chain_id,
            risk = %profile.risk,
            from = %transport.from(),
            steps = plan.len(),
            "Running migrations"
        );

        let sequencer = MigrationSequencer::new(StepExecutor::new(self.executor.clone()));
        let outcome = sequencer
            .run(&plan, profile, &transport, &mut records, &self.sequence, cancel)
            .await;

        // Records are saved whatever happened, they are what a rerun resumes from.
        self.save_records(&records)?;
        let outcome = outcome?;

        let mut manifest = None;
        if outcome.is_success() {
            if let Some(explorer) = explorer {
                let path = self.manifest_path();
                VerificationManifest::build(profile, explorer, &plan, &records)?.save(&path)?;
                tracing::info!(path = %path.display(), %explorer, "Verification manifest written");
                manifest = Some(path);
            }
        }

        Ok(MigrationReport {
            network: profile.name.clone(),
            chain_id: profile.chain_id,
            records: outcome.records,
            executed: outcome.executed,
            failure: outcome.failure,
            manifest,
        })
    }

    /// Connect to the network's endpoint and upgrade the logic contract of `step`.
    pub async fn upgrade(&self, step: &StepId, artifact: &str) -> Result<DeployedContractRecord> {
        let rpc = self.connect()?;
        self.upgrade_with(rpc, step, artifact).await
    }

    /// Deploy `artifact` as the new logic contract of `step` and point its proxy at it.
    pub async fn upgrade_with<R: ChainRpc>(
        &self,
        rpc: R,
        step: &StepId,
        artifact: &str,
    ) -> Result<DeployedContractRecord> {
        let records_path = self
            .records_path
            .as_deref()
            .context("Upgrading needs the record book of the original deployment")?;
        let profile = self.profile()?;

        let plan = self.plan()?;
        let step = plan
            .iter()
            .find(|candidate| &candidate.id == step)
            .ok_or_else(|| DeployError::UnknownStep { step: step.clone() })?;
        let artifact = ContractArtifact::load(&self.artifacts_dir, artifact)?;

        let transport = self.transport(profile, rpc).await?;
        let _lock = FsHandler::lock_exclusive(records_path)?;
        let mut records = self.load_records(profile)?;

        let executor = StepExecutor::new(self.executor.clone());
        let result = UpgradeProxyManager::new(&executor)
            .upgrade(step, &artifact, &transport, profile, &mut records)
            .await;

        self.save_records(&records)?;
        Ok(result?)
    }

    fn connect(&self) -> Result<HttpRpc> {
        let profile = self.profile()?;
        let url = profile.resolve_endpoint(&self.secrets)?;
        let rpc = HttpRpc::new(&url, profile.timeouts.network_check_timeout())?;
        tracing::info!(network = %profile.name, endpoint = %rpc.url(), "Connecting");
        Ok(rpc)
    }

    async fn transport<R: ChainRpc>(
        &self,
        profile: &NetworkProfile,
        rpc: R,
    ) -> Result<SigningTransport<R>> {
        let credential = self.secrets.credential();
        let transport = SignerResolver::resolve(profile, credential.as_ref(), rpc)
            .await?
            .with_gas_multiplier(self.executor.gas_multiplier_percent);
        Ok(transport)
    }

    fn load_records(&self, profile: &NetworkProfile) -> Result<RecordBook> {
        match &self.records_path {
            Some(path) => RecordBook::load_or_new(path, &profile.name, profile.chain_id),
            None => Ok(RecordBook::new(profile.name.clone(), profile.chain_id)),
        }
    }

    fn save_records(&self, records: &RecordBook) -> Result<()> {
        if let Some(path) = &self.records_path {
            records.save(path)?;
            tracing::info!(path = %path.display(), records = records.len(), "Deployment records saved");
        }
        Ok(())
    }
}
