//! Signer resolution and the signing transport.
//!
//! [`SignerResolver::resolve`] turns a network profile and an optional credential into a
//! [`SigningTransport`]: one signing account bound to one endpoint, with its own nonce
//! sequence.

use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, TxHash, U64, U256};
use alloy_signer_local::{MnemonicBuilder, PrivateKeySigner, coins_bip39::English};
use tokio::{sync::Mutex, time::Instant};
use url::Url;

use crate::{
    credentials::{Secrets, SignerCredential},
    error::{DeployError, RpcError},
    network::{GasPolicy, NetworkProfile, TimeoutPolicy},
    rpc::{CallRequest, ChainRpc, Receipt, revert_reason},
    sequencer::CancelToken,
    tx::{TxRequest, sign_eip1559},
};

/// Consecutive polls in which the node does not know a transaction before it counts as dropped.
pub const DROPPED_AFTER_POLLS: u32 = 3;

/// Default cap on the priority fee when the network has no fee policy.
const DEFAULT_PRIORITY_FEE: u64 = 1_000_000_000;

/// The account transactions are sent from.
#[derive(Debug, Clone)]
pub enum TransactionSigner {
    /// A key held by this process. Transactions are signed locally.
    Local(PrivateKeySigner),
    /// An account unlocked on a development node, which signs on our behalf.
    Ambient(Address),
}

impl TransactionSigner {
    pub fn address(&self) -> Address {
        match self {
            TransactionSigner::Local(signer) => signer.address(),
            TransactionSigner::Ambient(address) => *address,
        }
    }

    /// Derive the signing key from a credential.
    pub fn from_credential(credential: &SignerCredential) -> Result<Self, DeployError> {
        let signer = match credential {
            SignerCredential::Mnemonic { phrase, index } => MnemonicBuilder::<English>::default()
                .phrase(phrase.as_str())
                .index(*index)
                .and_then(|builder| builder.build())
                .map_err(|e| DeployError::Signer(format!("Failed to derive key from mnemonic: {}", e)))?,
            SignerCredential::PrivateKey(key) => key
                .trim()
                .parse::<PrivateKeySigner>()
                .map_err(|e| DeployError::Signer(format!("Invalid private key: {}", e)))?,
        };
        Ok(TransactionSigner::Local(signer))
    }
}

/// How a network is reached and who signs for it.
pub trait ProviderStrategy {
    fn resolve_endpoint(&self, secrets: &Secrets) -> Result<Url, DeployError>;

    /// The local signer to use, or `None` to fall back to the node's own accounts.
    fn resolve_signer(
        &self,
        credential: Option<&SignerCredential>,
    ) -> Result<Option<TransactionSigner>, DeployError>;
}

impl ProviderStrategy for NetworkProfile {
    fn resolve_endpoint(&self, secrets: &Secrets) -> Result<Url, DeployError> {
        self.endpoint.resolve(&self.name, secrets)
    }

    fn resolve_signer(
        &self,
        credential: Option<&SignerCredential>,
    ) -> Result<Option<TransactionSigner>, DeployError> {
        match credential {
            Some(credential) => TransactionSigner::from_credential(credential).map(Some),
            None if self.requires_credential() => Err(DeployError::MissingCredential {
                network: self.name.clone(),
            }),
            None => Ok(None),
        }
    }
}

pub struct SignerResolver;

impl SignerResolver {
    /// Bind a signer to `rpc` for `profile`.
    ///
    /// Fails with [`DeployError::ChainIdMismatch`] if the endpoint serves another chain.
    pub async fn resolve<R: ChainRpc>(
        profile: &NetworkProfile,
        credential: Option<&SignerCredential>,
        rpc: R,
    ) -> Result<SigningTransport<R>, DeployError> {
        let actual = rpc.chain_id().await?;
        profile.check_chain_id(actual)?;

        let signer = match profile.resolve_signer(credential)? {
            Some(signer) => signer,
            None => {
                let account = rpc.accounts().await?.into_iter().next().ok_or_else(|| {
                    DeployError::MissingCredential {
                        network: profile.name.clone(),
                    }
                })?;
                tracing::info!(
                    network = %profile.name,
                    %account,
                    "No credential supplied, using the node's default account"
                );
                TransactionSigner::Ambient(account)
            }
        };

        tracing::info!(
            network = %profile.name,
            chain_id = profile.chain_id,
            from = %signer.address(),
            credential = credential.map(SignerCredential::kind).unwrap_or("ambient"),
            "Signer resolved"
        );

        Ok(SigningTransport::new(rpc, profile, signer))
    }
}

/// A signing account bound to a network endpoint.
pub struct SigningTransport<R> {
    rpc: R,
    network: String,
    chain_id: u64,
    signer: TransactionSigner,
    gas: GasPolicy,
    gas_multiplier_percent: u64,
    /// Next nonce to hand out, fetched lazily from the node.
    nonce: Mutex<Option<u64>>,
}

impl<R: ChainRpc> SigningTransport<R> {
    pub fn new(rpc: R, profile: &NetworkProfile, signer: TransactionSigner) -> Self {
        Self {
            rpc,
            network: profile.name.clone(),
            chain_id: profile.chain_id,
            signer,
            gas: profile.gas.clone(),
            gas_multiplier_percent: 120,
            nonce: Mutex::new(None),
        }
    }

    /// Margin applied to gas estimates, in percent of the estimate.
    pub fn with_gas_multiplier(mut self, percent: u64) -> Self {
        self.gas_multiplier_percent = percent;
        self
    }

    pub fn from(&self) -> Address {
        self.signer.address()
    }

    /// Hand out the next nonce of this signer.
    pub async fn reserve_nonce(&self) -> Result<u64, DeployError> {
        let mut next = self.nonce.lock().await;
        let nonce = match *next {
            Some(nonce) => nonce,
            None => self.rpc.transaction_count(self.from()).await?,
        };
        *next = Some(nonce + 1);
        Ok(nonce)
    }

    /// Forget the local nonce so the next reservation asks the node again.
    pub async fn resync_nonce(&self) {
        *self.nonce.lock().await = None;
    }

    /// Execute `request` against the latest state without sending it.
    pub async fn call(&self, request: &TxRequest) -> Result<Bytes, DeployError> {
        self.rpc
            .call(&self.call_request(request))
            .await
            .map_err(simulation_error)
    }

    pub async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, DeployError> {
        Ok(self.rpc.storage_at(address, slot).await?)
    }

    /// Sign and submit `request` with `nonce`.
    pub async fn send_transaction(
        &self,
        request: &TxRequest,
        nonce: u64,
    ) -> Result<TxHash, DeployError> {
        let gas_limit = match request.gas_limit.or(self.gas.gas_limit) {
            Some(gas_limit) => gas_limit,
            None => {
                let estimate = self
                    .rpc
                    .estimate_gas(&self.call_request(request))
                    .await
                    .map_err(simulation_error)?;
                estimate.saturating_mul(self.gas_multiplier_percent) / 100
            }
        };
        let (max_fee_per_gas, max_priority_fee_per_gas) = self.fees().await?;

        let tx_hash = match &self.signer {
            TransactionSigner::Local(signer) => {
                let tx = request.clone().into_eip1559(
                    self.chain_id,
                    nonce,
                    gas_limit,
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                );
                self.rpc.send_raw_transaction(sign_eip1559(tx, signer)?).await?
            }
            TransactionSigner::Ambient(from) => {
                let call = CallRequest {
                    from: Some(*from),
                    to: request.to,
                    data: Some(request.input.clone()),
                    gas: Some(U64::from(gas_limit)),
                    max_fee_per_gas: Some(max_fee_per_gas),
                    max_priority_fee_per_gas: Some(max_priority_fee_per_gas),
                    nonce: Some(U64::from(nonce)),
                    ..Default::default()
                };
                self.rpc.send_transaction(&call).await?
            }
        };

        tracing::info!(
            network = %self.network,
            %tx_hash,
            nonce,
            gas_limit,
            "Transaction submitted"
        );
        Ok(tx_hash)
    }

    /// Wait until `tx_hash` has `confirmations` blocks on top of it.
    ///
    /// Fails with [`DeployError::ConfirmationTimeout`] once more than `timeouts.timeout_blocks`
    /// blocks pass, or once the chain head stands still for longer than the stall timeout.
    /// Fails with [`DeployError::TransactionDropped`] if the node forgets the transaction, and
    /// with [`DeployError::Cancelled`] as soon as `cancel` fires.
    pub async fn wait_for_confirmations(
        &self,
        tx_hash: TxHash,
        confirmations: u64,
        timeouts: &TimeoutPolicy,
        poll_interval: Duration,
        cancel: &CancelToken,
    ) -> Result<Receipt, DeployError> {
        let start_block = self.rpc.block_number().await?;
        let mut head = start_block;
        let mut head_seen_at = Instant::now();
        let mut unknown_polls = 0;

        loop {
            let receipt = self.rpc.transaction_receipt(tx_hash).await?;
            let current_block = self.rpc.block_number().await?;

            match receipt {
                Some(receipt) if !receipt.succeeded() => {
                    return Err(DeployError::TransactionReverted { tx_hash });
                }
                Some(receipt) => {
                    let depth = current_block.saturating_sub(receipt.block_number);
                    if depth >= confirmations {
                        tracing::debug!(%tx_hash, block = receipt.block_number, depth, "Transaction confirmed");
                        return Ok(receipt);
                    }
                    unknown_polls = 0;
                }
                None => {
                    if self.rpc.transaction_known(tx_hash).await? {
                        unknown_polls = 0;
                    } else {
                        unknown_polls += 1;
                        if unknown_polls >= DROPPED_AFTER_POLLS {
                            return Err(DeployError::TransactionDropped {
                                attempts: 1,
                                tx_hash,
                            });
                        }
                    }
                }
            }

            let waited_blocks = current_block.saturating_sub(start_block);
            if waited_blocks > timeouts.timeout_blocks {
                return Err(DeployError::ConfirmationTimeout {
                    tx_hash,
                    waited_blocks,
                });
            }

            if current_block != head {
                head = current_block;
                head_seen_at = Instant::now();
            } else if head_seen_at.elapsed() > timeouts.stall_timeout() {
                tracing::warn!(
                    network = %self.network,
                    %tx_hash,
                    block = head,
                    stalled_for = ?head_seen_at.elapsed(),
                    "Chain head is not advancing"
                );
                return Err(DeployError::ConfirmationTimeout {
                    tx_hash,
                    waited_blocks,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = cancel.cancelled() => {
                    tracing::warn!(network = %self.network, %tx_hash, "Wait interrupted, the transaction stays pending");
                    return Err(DeployError::Cancelled);
                }
            }
        }
    }

    fn call_request(&self, request: &TxRequest) -> CallRequest {
        CallRequest {
            from: Some(self.from()),
            to: request.to,
            data: Some(request.input.clone()),
            ..Default::default()
        }
    }

    /// `(max_fee_per_gas, max_priority_fee_per_gas)` from the profile, or derived from the
    /// node's gas price.
    async fn fees(&self) -> Result<(U256, U256), DeployError> {
        let (max_fee, priority_fee) = match (
            self.gas.max_fee_per_gas(),
            self.gas.max_priority_fee_per_gas(),
        ) {
            (Some(max_fee), Some(priority_fee)) => (max_fee, priority_fee),
            (max_fee, priority_fee) => {
                let gas_price = self.rpc.gas_price().await?;
                (
                    max_fee.unwrap_or(gas_price.saturating_mul(U256::from(2))),
                    priority_fee.unwrap_or(gas_price.min(U256::from(DEFAULT_PRIORITY_FEE))),
                )
            }
        };
        Ok((max_fee, priority_fee.min(max_fee)))
    }
}

fn simulation_error(error: RpcError) -> DeployError {
    match revert_reason(&error) {
        Some(reason) => DeployError::SimulationReverted { reason },
        None => DeployError::Rpc(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{network::NetworkRegistry, testing::MockChain};

    const PHRASE: &str = "test test test test test test test test test test test junk";
    const KEY_1: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn account_0() -> Address {
        "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap()
    }

    fn account_1() -> Address {
        "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".parse().unwrap()
    }

    fn profile(name: &str) -> NetworkProfile {
        NetworkRegistry::builtin().unwrap().resolve(name).unwrap().clone()
    }

    #[tokio::test]
    async fn test_mnemonic_takes_precedence_over_private_key() {
        let development = profile("development");
        let credential = SignerCredential::select(Some(PHRASE), 0, Some(KEY_1));

        let transport =
            SignerResolver::resolve(&development, credential.as_ref(), MockChain::new(1337))
                .await
                .unwrap();
        assert_eq!(transport.from(), account_0());
    }

    #[tokio::test]
    async fn test_mnemonic_address_index() {
        let development = profile("development");
        let credential = SignerCredential::select(Some(PHRASE), 1, None);

        let transport =
            SignerResolver::resolve(&development, credential.as_ref(), MockChain::new(1337))
                .await
                .unwrap();
        assert_eq!(transport.from(), account_1());
    }

    #[tokio::test]
    async fn test_private_key_signer() {
        let development = profile("development");
        let credential = SignerCredential::select(None, 0, Some(KEY_1));

        let transport =
            SignerResolver::resolve(&development, credential.as_ref(), MockChain::new(1337))
                .await
                .unwrap();
        assert_eq!(transport.from(), account_1());
    }

    #[tokio::test]
    async fn test_public_network_requires_credential() {
        let goerli = profile("goerli");
        let err = SignerResolver::resolve(&goerli, None, MockChain::new(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DeployError::MissingCredential { ref network } if network == "goerli"));
    }

    #[tokio::test]
    async fn test_local_network_uses_ambient_account() {
        let development = profile("development");
        let chain = MockChain::new(1337);

        let transport = SignerResolver::resolve(&development, None, chain.clone())
            .await
            .unwrap();
        assert_eq!(transport.from(), MockChain::AMBIENT_ACCOUNT);

        let err = SignerResolver::resolve(&development, None, MockChain::new(1337).without_accounts())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DeployError::MissingCredential { .. }));
    }

    #[tokio::test]
    async fn test_chain_id_mismatch_is_fatal() {
        let development = profile("development");
        let err = SignerResolver::resolve(&development, None, MockChain::new(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DeployError::ChainIdMismatch {
                expected: 1337,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_nonces_are_sequential() {
        let development = profile("development");
        let credential = SignerCredential::select(None, 0, Some(KEY_1));
        let transport =
            SignerResolver::resolve(&development, credential.as_ref(), MockChain::new(1337))
                .await
                .unwrap();

        assert_eq!(transport.reserve_nonce().await.unwrap(), 0);
        assert_eq!(transport.reserve_nonce().await.unwrap(), 1);

        transport.resync_nonce().await;
        assert_eq!(transport.reserve_nonce().await.unwrap(), 0);
    }

    fn timeouts(timeout_blocks: u64, stall_timeout_ms: u64) -> TimeoutPolicy {
        TimeoutPolicy {
            timeout_blocks,
            stall_timeout_ms,
            ..Default::default()
        }
    }

    async fn send_stalled(chain: &MockChain) -> (SigningTransport<MockChain>, TxHash) {
        chain.stall_matching(&[0xaa]);
        let transport = SignerResolver::resolve(&profile("development"), None, chain.clone())
            .await
            .unwrap();

        let nonce = transport.reserve_nonce().await.unwrap();
        let tx_hash = transport
            .send_transaction(&TxRequest::create(Bytes::from_static(&[0xaa, 0x01])), nonce)
            .await
            .unwrap();
        (transport, tx_hash)
    }

    #[tokio::test]
    async fn test_wait_times_out_on_stalled_transaction() {
        let chain = MockChain::new(1337);
        let (transport, tx_hash) = send_stalled(&chain).await;
        let cancel = CancelToken::never();

        let err = transport
            .wait_for_confirmations(tx_hash, 0, &timeouts(3, 60_000), Duration::from_millis(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ConfirmationTimeout { .. }));
        assert!(err.is_indeterminate());

        chain.release_stalled();
        let receipt = transport
            .wait_for_confirmations(tx_hash, 0, &timeouts(3, 60_000), Duration::from_millis(1), &cancel)
            .await
            .unwrap();
        assert!(receipt.contract_address.is_some());
    }

    #[tokio::test]
    async fn test_wait_times_out_when_head_stops() {
        let chain = MockChain::new(1337);
        let (transport, tx_hash) = send_stalled(&chain).await;
        chain.freeze_blocks();

        // No block ever arrives, so only the stall timeout can end the wait.
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            transport.wait_for_confirmations(
                tx_hash,
                0,
                &timeouts(1_000_000, 20),
                Duration::from_millis(1),
                &CancelToken::never(),
            ),
        )
        .await
        .expect("stall timeout should end the wait")
        .unwrap_err();
        assert!(matches!(
            err,
            DeployError::ConfirmationTimeout { waited_blocks: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_wait_stops_when_cancelled() {
        let chain = MockChain::new(1337);
        let (transport, tx_hash) = send_stalled(&chain).await;
        let (handle, cancel) = CancelToken::new();
        handle.cancel();

        let err = transport
            .wait_for_confirmations(
                tx_hash,
                0,
                &timeouts(1_000_000, 60_000),
                Duration::from_millis(1),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Cancelled));
        assert!(err.is_indeterminate());
    }

    #[tokio::test]
    async fn test_simulation_revert_surfaces_reason() {
        let development = profile("development");
        let chain = MockChain::new(1337);
        chain.revert_on(&[0xbb], "ACR: minting disabled");
        let transport = SignerResolver::resolve(&development, None, chain)
            .await
            .unwrap();

        let err = transport
            .call(&TxRequest::create(Bytes::from_static(&[0xbb])))
            .await
            .unwrap_err();
        assert!(
            matches!(err, DeployError::SimulationReverted { ref reason } if reason == "ACR: minting disabled")
        );
    }
}
