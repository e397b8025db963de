//! Error types for the deployment orchestrator.

use std::fmt;

use alloy_core::primitives::{Address, TxHash};

use crate::step::StepId;

/// Errors raised while resolving configuration or executing deployment steps.
#[derive(thiserror::Error, Debug)]
pub enum DeployError {
    #[error("unknown network '{network}'")]
    UnknownNetwork { network: String },
    #[error("chain id mismatch on '{network}': profile expects {expected}, endpoint reports {actual}")]
    ChainIdMismatch {
        network: String,
        expected: u64,
        actual: u64,
    },
    #[error("chain id {chain_id} is used by both '{first}' and '{second}'")]
    DuplicateChainId {
        chain_id: u64,
        first: String,
        second: String,
    },
    #[error("invalid profile for '{network}': {reason}")]
    InvalidProfile { network: String, reason: String },
    #[error("no signing credential (MNEMONIC or PRIVATE_KEY) supplied for public network '{network}'")]
    MissingCredential { network: String },
    #[error("network '{network}' needs {key} to build its endpoint URL")]
    MissingEndpointCredential { network: String, key: &'static str },
    #[error("no verification API key for explorer '{explorer}', set {var} or VERIFY_API_KEY")]
    MissingVerificationKey { explorer: String, var: &'static str },
    #[error("no step named '{step}' in the migration plan")]
    UnknownStep { step: StepId },
    #[error("step '{step}' depends on '{dependency}', which has not completed")]
    UnresolvedDependency { step: StepId, dependency: StepId },
    #[error("simulation reverted: {reason}")]
    SimulationReverted { reason: String },
    #[error("transaction {tx_hash} not confirmed after waiting {waited_blocks} blocks")]
    ConfirmationTimeout { tx_hash: TxHash, waited_blocks: u64 },
    #[error("proxy {proxy} is already initialized")]
    AlreadyInitialized { proxy: Address },
    #[error("transaction dropped after {attempts} attempts (last hash {tx_hash})")]
    TransactionDropped { attempts: usize, tx_hash: TxHash },
    #[error("transaction {tx_hash} was mined but reverted")]
    TransactionReverted { tx_hash: TxHash },
    #[error("invalid proxy transition: {0}")]
    InvalidTransition(String),
    #[error("interrupted by operator")]
    Cancelled,
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("signer error: {0}")]
    Signer(String),
}

impl DeployError {
    /// Configuration errors abort a run before any transaction is sent.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            DeployError::UnknownNetwork { .. }
                | DeployError::ChainIdMismatch { .. }
                | DeployError::DuplicateChainId { .. }
                | DeployError::InvalidProfile { .. }
                | DeployError::MissingCredential { .. }
                | DeployError::MissingEndpointCredential { .. }
                | DeployError::MissingVerificationKey { .. }
                | DeployError::UnknownStep { .. }
        )
    }

    /// The on-chain outcome is unknown and the operator must inspect the chain before resuming.
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            DeployError::ConfirmationTimeout { .. } | DeployError::Cancelled
        )
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, DeployError::TransactionDropped { .. })
    }
}

/// Errors returned by the JSON-RPC layer.
#[derive(thiserror::Error, Debug, Clone)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("{message} (code {code})")]
    Response {
        code: i64,
        message: String,
        data: Option<String>,
    },
    #[error("malformed response: {0}")]
    Decode(String),
}

/// A step failure, carrying the step and network it happened on.
#[derive(Debug)]
pub struct StepFailure {
    pub step: StepId,
    pub network: String,
    pub error: DeployError,
}

impl StepFailure {
    pub fn new(step: StepId, network: impl Into<String>, error: DeployError) -> Self {
        Self {
            step,
            network: network.into(),
            error,
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = if self.error.is_indeterminate() {
            "is indeterminate"
        } else {
            "failed"
        };
        write!(
            f,
            "step '{}' on '{}' {}: {}",
            self.step, self.network, outcome, self.error
        )
    }
}

impl std::error::Error for StepFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
