use alloy_core::primitives::{B256, keccak256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::step::{DeploymentStep, StepArg, StepKind};

/// Inputs of a step that, when changed, make an existing deployment stale.
///
/// Bytecode is reduced to its keccak hash so fingerprints stay cheap to compare and log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFingerprint {
    pub chain_id: u64,
    pub contract: String,
    pub bytecode_hash: B256,
    pub args: Vec<StepArg>,
    /// Proxy bytecode hash and initializer for upgradeable steps.
    pub proxy: Option<(B256, String)>,
}

impl StepFingerprint {
    pub fn new(step: &DeploymentStep, chain_id: u64) -> Self {
        Self {
            chain_id,
            contract: step.artifact.name.clone(),
            bytecode_hash: keccak256(&step.artifact.bytecode),
            args: step.args.clone(),
            proxy: match &step.kind {
                StepKind::Plain => None,
                StepKind::Upgradeable(config) => Some((
                    keccak256(&config.proxy.bytecode),
                    config.initializer.clone(),
                )),
            },
        }
    }

    /// Compute a SHA-256 hash of these inputs.
    ///
    /// The inputs are serialized to JSON before hashing, struct fields serialize in
    /// declaration order so the hash is deterministic.
    pub fn compute_hash(&self) -> String {
        let json =
            serde_json::to_string(self).expect("StepFingerprint serialization should never fail");

        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Fingerprint hash of `step` deployed on `chain_id`.
pub fn fingerprint(step: &DeploymentStep, chain_id: u64) -> String {
    StepFingerprint::new(step, chain_id).compute_hash()
}
