//! acr-deploy - Deployment library for the ACR contracts.
//!
//! This crate deploys the ACR NFT and the upgradeable ACR token to EVM networks: it
//! resolves network profiles and signers, sends and tracks deployment transactions, drives
//! the proxy lifecycle of upgradeable contracts and keeps resumable deployment records.

mod builder;
pub use builder::{DEFAULT_ARTIFACTS_DIR, DeployerBuilder};

mod deployer;
pub use deployer::{Deployer, MigrationReport};

pub mod artifact;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod fingerprint;
mod fs;
pub mod migrations;
pub mod network;
pub mod proxy;
pub mod records;
pub mod rpc;
pub mod sequencer;
pub mod signer;
pub mod step;
pub mod tx;
pub mod verify;

#[cfg(test)]
mod testing;

pub use artifact::ContractArtifact;
pub use credentials::{Secrets, SignerCredential};
pub use error::{DeployError, RpcError, StepFailure};
pub use executor::{ExecutorOptions, StepExecutor};
pub use network::{DEFAULT_NETWORK, NetworkProfile, NetworkRegistry, RiskClass};
pub use records::{DeployedContractRecord, ProxyState, RecordBook};
pub use sequencer::{CancelHandle, CancelToken, MigrationSequencer, SequenceOptions};
pub use signer::{SignerResolver, SigningTransport};
pub use step::{DeploymentStep, ProxyVersion, StepArg, StepId};
pub use verify::Explorer;
