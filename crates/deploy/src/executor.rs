//! Execution of single deployment transactions.

use std::time::Duration;

use alloy_core::primitives::{Address, Bytes, TxHash};
use backon::{BackoffBuilder, ExponentialBuilder};

use crate::{
    error::{DeployError, RpcError},
    network::NetworkProfile,
    records::RecordBook,
    rpc::{ChainRpc, Receipt},
    sequencer::CancelToken,
    signer::SigningTransport,
    step::DeploymentStep,
    tx::TxRequest,
};

pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_MIN_DELAY: Duration = Duration::from_millis(4000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_GAS_MULTIPLIER_PERCENT: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// How many times a dropped transaction is resubmitted.
    pub max_retries: usize,
    /// Delay before the first resubmission, doubled on each further one.
    pub retry_min_delay: Duration,
    pub poll_interval: Duration,
    pub gas_multiplier_percent: u64,
    /// Never simulate before sending, even where the network asks for it.
    pub skip_dry_run: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_min_delay: DEFAULT_RETRY_MIN_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            gas_multiplier_percent: DEFAULT_GAS_MULTIPLIER_PERCENT,
            skip_dry_run: false,
        }
    }
}

/// Sends deployment transactions and waits for them to be final.
///
/// Once its [`CancelToken`] fires, no new transaction is sent and waits return
/// [`DeployError::Cancelled`], leaving the hash of a submitted transaction in place.
#[derive(Debug, Clone, Default)]
pub struct StepExecutor {
    options: ExecutorOptions,
    cancel: CancelToken,
}

impl StepExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            options,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deploy a plain step and return the address of the new contract.
    pub async fn execute<R: ChainRpc>(
        &self,
        step: &DeploymentStep,
        transport: &SigningTransport<R>,
        profile: &NetworkProfile,
        records: &mut RecordBook,
    ) -> Result<Address, DeployError> {
        let args = step.resolve_args(records)?;
        let data = step.artifact.deploy_data(&args);

        self.deploy(
            step.id.as_str(),
            data,
            step.gas_limit,
            transport,
            profile,
            records.pending_slot(&step.id),
        )
        .await
    }

    /// Send a contract creation and return the created address.
    pub(crate) async fn deploy<R: ChainRpc>(
        &self,
        label: &str,
        data: Bytes,
        gas_limit: Option<u64>,
        transport: &SigningTransport<R>,
        profile: &NetworkProfile,
        pending: &mut Option<TxHash>,
    ) -> Result<Address, DeployError> {
        let request = TxRequest::create(data).with_gas_limit(gas_limit);
        let receipt = self
            .send_tracked(label, &request, transport, profile, pending)
            .await?;

        let address = receipt.contract_address.ok_or_else(|| {
            RpcError::Decode(format!(
                "receipt of {} has no contract address",
                receipt.transaction_hash
            ))
        })?;

        tracing::info!(network = %profile.name, step = label, %address, "Contract deployed");
        Ok(address)
    }

    /// Send `request` and wait until it is final.
    ///
    /// The hash of the submitted transaction is stored in `pending` until it is confirmed.
    /// If `pending` already holds a hash, that transaction is waited on instead of sending
    /// a new one. A dropped transaction is resubmitted with the same nonce, with
    /// exponential backoff, up to `max_retries` times.
    pub(crate) async fn send_tracked<R: ChainRpc>(
        &self,
        label: &str,
        request: &TxRequest,
        transport: &SigningTransport<R>,
        profile: &NetworkProfile,
        pending: &mut Option<TxHash>,
    ) -> Result<Receipt, DeployError> {
        if let Some(tx_hash) = *pending {
            tracing::info!(
                network = %profile.name,
                step = label,
                %tx_hash,
                "Resuming wait on previously submitted transaction"
            );
            match self.wait(transport, profile, tx_hash).await {
                Ok(receipt) => {
                    *pending = None;
                    return Ok(receipt);
                }
                Err(e) if e.is_dropped() => {
                    tracing::warn!(step = label, %tx_hash, "Previous transaction was dropped, sending again");
                    *pending = None;
                    transport.resync_nonce().await;
                }
                Err(e) => {
                    if !e.is_indeterminate() {
                        *pending = None;
                    }
                    return Err(e);
                }
            }
        }

        self.ensure_not_cancelled(label)?;

        if profile.dry_run_required() && !self.options.skip_dry_run {
            tracing::info!(network = %profile.name, step = label, "Simulating transaction");
            transport.call(request).await?;
        }

        self.ensure_not_cancelled(label)?;
        let nonce = transport.reserve_nonce().await?;
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(self.options.retry_min_delay)
            .with_max_times(self.options.max_retries)
            .build();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let tx_hash = match transport.send_transaction(request, nonce).await {
                Ok(tx_hash) => tx_hash,
                Err(e) => {
                    // The nonce was never used.
                    transport.resync_nonce().await;
                    return Err(e);
                }
            };
            *pending = Some(tx_hash);

            match self.wait(transport, profile, tx_hash).await {
                Ok(receipt) => {
                    *pending = None;
                    return Ok(receipt);
                }
                Err(DeployError::TransactionDropped { .. }) => {
                    *pending = None;
                    let Some(delay) = backoff.next() else {
                        tracing::error!(step = label, %tx_hash, attempts, "Transaction dropped, giving up");
                        transport.resync_nonce().await;
                        return Err(DeployError::TransactionDropped { attempts, tx_hash });
                    };
                    tracing::warn!(
                        step = label,
                        %tx_hash,
                        attempt = attempts,
                        ?delay,
                        "Transaction dropped, resubmitting with the same nonce"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            transport.resync_nonce().await;
                            return Err(DeployError::Cancelled);
                        }
                    }
                }
                Err(e) => {
                    if !e.is_indeterminate() {
                        *pending = None;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn wait<R: ChainRpc>(
        &self,
        transport: &SigningTransport<R>,
        profile: &NetworkProfile,
        tx_hash: TxHash,
    ) -> Result<Receipt, DeployError> {
        transport
            .wait_for_confirmations(
                tx_hash,
                profile.confirmations,
                &profile.timeouts,
                self.options.poll_interval,
                &self.cancel,
            )
            .await
    }

    fn ensure_not_cancelled(&self, label: &str) -> Result<(), DeployError> {
        if self.cancel.is_cancelled() {
            tracing::warn!(step = label, "Interrupted before sending");
            return Err(DeployError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact::ContractArtifact,
        network::{DryRunPolicy, NetworkRegistry},
        signer::SignerResolver,
        step::{StepArg, StepId},
        testing::{MockChain, fast_options},
    };

    fn development() -> NetworkProfile {
        NetworkRegistry::builtin()
            .unwrap()
            .resolve("development")
            .unwrap()
            .clone()
    }

    async fn transport(chain: &MockChain) -> SigningTransport<MockChain> {
        SignerResolver::resolve(&development(), None, chain.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_deploys_contract() {
        let chain = MockChain::new(1337);
        let transport = transport(&chain).await;
        let executor = StepExecutor::new(fast_options());
        let mut records = RecordBook::new("development", 1337);

        let step = DeploymentStep::plain(
            "acr_nft",
            ContractArtifact::new("ACR", vec![0xa1, 0x00]),
            vec![],
        )
        .with_gas_limit(1_000_000);
        let address = executor
            .execute(&step, &transport, &development(), &mut records)
            .await
            .unwrap();

        assert_eq!(address, MockChain::AMBIENT_ACCOUNT.create(0));
        assert_eq!(chain.deployments_of(&[0xa1]), vec![address]);
        assert_eq!(chain.sent()[0].gas_limit, 1_000_000);
        assert_eq!(records.pending(&step.id), None);
    }

    #[tokio::test]
    async fn test_unresolved_dependency_sends_nothing() {
        let chain = MockChain::new(1337);
        let transport = transport(&chain).await;
        let executor = StepExecutor::new(fast_options());
        let mut records = RecordBook::new("development", 1337);

        let step = DeploymentStep::plain(
            "market",
            ContractArtifact::new("Market", vec![0xa2]),
            vec![StepArg::StepAddress(StepId::from("acr_nft"))],
        );
        let err = executor
            .execute(&step, &transport, &development(), &mut records)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::UnresolvedDependency { .. }));
        assert!(chain.sent().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_revert_aborts_before_sending() {
        let chain = MockChain::new(1337);
        chain.revert_on(&[0xa3], "ACR: constructor disabled");
        let transport = transport(&chain).await;
        let executor = StepExecutor::new(fast_options());
        let mut records = RecordBook::new("development", 1337);

        let mut profile = development();
        profile.dry_run = DryRunPolicy::Run;

        let step = DeploymentStep::plain("acr_nft", ContractArtifact::new("ACR", vec![0xa3]), vec![]);
        let err = executor
            .execute(&step, &transport, &profile, &mut records)
            .await
            .unwrap_err();

        assert!(
            matches!(err, DeployError::SimulationReverted { ref reason } if reason == "ACR: constructor disabled")
        );
        assert!(chain.sent().is_empty());
    }

    #[tokio::test]
    async fn test_skip_dry_run_suppresses_simulation() {
        let chain = MockChain::new(1337);
        let transport = transport(&chain).await;
        let executor = StepExecutor::new(ExecutorOptions {
            skip_dry_run: true,
            ..fast_options()
        });
        let mut records = RecordBook::new("development", 1337);

        let mut profile = development();
        profile.dry_run = DryRunPolicy::Run;

        let step = DeploymentStep::plain("acr_nft", ContractArtifact::new("ACR", vec![0xa4]), vec![])
            .with_gas_limit(1_000_000);
        executor
            .execute(&step, &transport, &profile, &mut records)
            .await
            .unwrap();
        assert_eq!(chain.calls(), 0);
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_resubmitted_with_same_nonce() {
        let chain = MockChain::new(1337);
        chain.drop_next(2);
        let transport = transport(&chain).await;
        let executor = StepExecutor::new(fast_options());
        let mut records = RecordBook::new("development", 1337);

        let step = DeploymentStep::plain("acr_nft", ContractArtifact::new("ACR", vec![0xa5]), vec![]);
        let address = executor
            .execute(&step, &transport, &development(), &mut records)
            .await
            .unwrap();

        let nonces: Vec<u64> = chain.sent().iter().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, vec![0, 0, 0]);
        assert_eq!(address, MockChain::AMBIENT_ACCOUNT.create(0));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let chain = MockChain::new(1337);
        chain.drop_next(10);
        let transport = transport(&chain).await;
        let executor = StepExecutor::new(fast_options());
        let mut records = RecordBook::new("development", 1337);

        let step = DeploymentStep::plain("acr_nft", ContractArtifact::new("ACR", vec![0xa6]), vec![]);
        let err = executor
            .execute(&step, &transport, &development(), &mut records)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::TransactionDropped { attempts: 4, .. }));
        assert_eq!(chain.sent().len(), 4);
        assert_eq!(records.pending(&step.id), None);
    }

    #[tokio::test]
    async fn test_timeout_keeps_pending_hash_for_resume() {
        let chain = MockChain::new(1337);
        chain.stall_matching(&[0xa7]);
        let transport = transport(&chain).await;
        let executor = StepExecutor::new(fast_options());
        let mut records = RecordBook::new("development", 1337);

        let mut profile = development();
        profile.timeouts.timeout_blocks = 3;

        let step = DeploymentStep::plain("acr_nft", ContractArtifact::new("ACR", vec![0xa7]), vec![]);
        let err = executor
            .execute(&step, &transport, &profile, &mut records)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ConfirmationTimeout { .. }));
        let tx_hash = records.pending(&step.id).unwrap();

        chain.release_stalled();
        let address = executor
            .execute(&step, &transport, &profile, &mut records)
            .await
            .unwrap();

        assert_eq!(chain.sent().len(), 1, "resume must not resubmit");
        assert_eq!(chain.sent()[0].hash, tx_hash);
        assert_eq!(chain.deployments_of(&[0xa7]), vec![address]);
    }

    #[tokio::test]
    async fn test_cancelled_executor_sends_nothing() {
        let chain = MockChain::new(1337);
        let transport = transport(&chain).await;
        let (handle, token) = CancelToken::new();
        handle.cancel();
        let executor = StepExecutor::new(fast_options()).with_cancel(token);
        let mut records = RecordBook::new("development", 1337);

        let step = DeploymentStep::plain("acr_nft", ContractArtifact::new("ACR", vec![0xa9]), vec![]);
        let err = executor
            .execute(&step, &transport, &development(), &mut records)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Cancelled));
        assert!(chain.sent().is_empty());
        assert_eq!(records.pending(&step.id), None);
    }

    #[tokio::test]
    async fn test_cancel_during_wait_records_submitted_hash() {
        let chain = MockChain::new(1337);
        chain.stall_matching(&[0xaa]);
        let transport = transport(&chain).await;
        let (handle, token) = CancelToken::new();
        let executor = StepExecutor::new(fast_options()).with_cancel(token);
        let mut records = RecordBook::new("development", 1337);

        let mut profile = development();
        profile.timeouts.timeout_blocks = u64::MAX;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.cancel();
        });

        let step = DeploymentStep::plain("acr_nft", ContractArtifact::new("ACR", vec![0xaa]), vec![]);
        let err = executor
            .execute(&step, &transport, &profile, &mut records)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Cancelled));
        assert_eq!(chain.sent().len(), 1);
        assert_eq!(records.pending(&step.id), Some(chain.sent()[0].hash));
    }

    #[tokio::test]
    async fn test_mined_revert_is_reported() {
        let chain = MockChain::new(1337);
        chain.revert_on(&[0xa8], "ACR: out of gas");
        let transport = transport(&chain).await;
        let executor = StepExecutor::new(fast_options());
        let mut records = RecordBook::new("development", 1337);

        // A fixed gas limit skips estimation, so the revert only shows up once mined.
        let step = DeploymentStep::plain("acr_nft", ContractArtifact::new("ACR", vec![0xa8]), vec![])
            .with_gas_limit(1_000_000);
        let err = executor
            .execute(&step, &transport, &development(), &mut records)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::TransactionReverted { .. }));
        assert_eq!(records.pending(&step.id), None);
    }
}
