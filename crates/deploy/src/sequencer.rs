//! Ordered execution of a migration plan.

use tokio::sync::watch;

use crate::{
    error::{DeployError, StepFailure},
    executor::StepExecutor,
    fingerprint::fingerprint,
    network::NetworkProfile,
    proxy::UpgradeProxyManager,
    records::{DeployedContractRecord, RecordBook},
    rpc::ChainRpc,
    signer::SigningTransport,
    step::{DeploymentStep, StepId, StepKind},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceOptions {
    /// Skip every step declared before this one.
    pub start_from: Option<StepId>,
    /// Deploy plain steps again even if they are already recorded.
    pub redeploy: bool,
}

/// Cancels a running sequence when triggered.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Observes a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}

impl CancelToken {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), CancelToken(rx))
    }

    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        CancelToken(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // The handle is gone, nobody can cancel anymore.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// What a sequencer run produced.
#[derive(Debug)]
pub struct SequenceOutcome {
    /// Records of the plan's completed steps, in plan order.
    pub records: Vec<DeployedContractRecord>,
    /// Steps that ran in this invocation.
    pub executed: Vec<StepId>,
    pub failure: Option<StepFailure>,
}

impl SequenceOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Runs deployment steps one after another, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct MigrationSequencer {
    executor: StepExecutor,
}

impl MigrationSequencer {
    pub fn new(executor: StepExecutor) -> Self {
        Self { executor }
    }

    /// Run `steps` against one network, stopping at the first failure.
    ///
    /// Returns `Err` only for problems detected before any step ran. Step failures are
    /// reported in [`SequenceOutcome::failure`] next to the records produced so far.
    ///
    /// Cancellation is observed by the executor between RPC round trips, so a transaction
    /// submitted before `cancel` fired keeps its hash recorded for the next run.
    pub async fn run<R: ChainRpc>(
        &self,
        steps: &[DeploymentStep],
        profile: &NetworkProfile,
        transport: &SigningTransport<R>,
        records: &mut RecordBook,
        options: &SequenceOptions,
        cancel: &CancelToken,
    ) -> Result<SequenceOutcome, DeployError> {
        records.ensure_network(&profile.name, profile.chain_id)?;

        let start = match &options.start_from {
            Some(start_from) => steps
                .iter()
                .position(|step| &step.id == start_from)
                .ok_or_else(|| DeployError::UnknownStep {
                    step: start_from.clone(),
                })?,
            None => 0,
        };

        let executor = self.executor.clone().with_cancel(cancel.clone());
        let mut executed = Vec::new();
        let mut failure = None;

        for step in &steps[start..] {
            if cancel.is_cancelled() {
                let step_failure =
                    StepFailure::new(step.id.clone(), profile.name.clone(), DeployError::Cancelled);
                tracing::warn!(network = %profile.name, step = %step.id, "{}", step_failure);
                failure = Some(step_failure);
                break;
            }

            if let Some(existing) = records.get(&step.id) {
                let redeploy = options.redeploy && !step.is_upgradeable();
                if !redeploy {
                    if existing.fingerprint != fingerprint(step, profile.chain_id) {
                        tracing::warn!(
                            network = %profile.name,
                            step = %step.id,
                            address = %existing.address,
                            "Step inputs changed since deployment, pass --redeploy to deploy again"
                        );
                    }
                    tracing::info!(
                        network = %profile.name,
                        step = %step.id,
                        address = %existing.address,
                        "Step already deployed, skipping"
                    );
                    continue;
                }
            }

            tracing::info!(
                network = %profile.name,
                step = %step.id,
                dependencies = ?step.dependencies().collect::<Vec<_>>(),
                "Running step"
            );

            let result = run_step(&executor, step, profile, transport, records).await;

            match result {
                Ok(record) => {
                    tracing::info!(
                        network = %profile.name,
                        step = %step.id,
                        address = %record.address,
                        "Step completed"
                    );
                    executed.push(step.id.clone());
                }
                Err(error) => {
                    let step_failure = StepFailure::new(step.id.clone(), profile.name.clone(), error);
                    tracing::error!(network = %profile.name, step = %step.id, "{}", step_failure);
                    failure = Some(step_failure);
                    break;
                }
            }
        }

        Ok(SequenceOutcome {
            records: steps
                .iter()
                .filter_map(|step| records.get(&step.id).cloned())
                .collect(),
            executed,
            failure,
        })
    }
}

async fn run_step<R: ChainRpc>(
    executor: &StepExecutor,
    step: &DeploymentStep,
    profile: &NetworkProfile,
    transport: &SigningTransport<R>,
    records: &mut RecordBook,
) -> Result<DeployedContractRecord, DeployError> {
    match &step.kind {
        StepKind::Plain => {
            let address = executor
                .execute(step, transport, profile, records)
                .await?;
            let record = DeployedContractRecord::plain(
                step.id.clone(),
                step.artifact.name.clone(),
                address,
                fingerprint(step, profile.chain_id),
            );
            if let Some(previous) = records.replace(record.clone()) {
                tracing::info!(
                    step = %step.id,
                    previous = %previous.address,
                    address = %record.address,
                    "Step redeployed"
                );
            }
            Ok(record)
        }
        StepKind::Upgradeable(_) => {
            UpgradeProxyManager::new(executor)
                .deploy(step, transport, profile, records)
                .await
        }
    }
}
