//! Compiled contract artifacts.

use std::path::Path;

use alloy_core::{dyn_abi::DynSolValue, primitives::Bytes};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::step::encode_args;

/// Creation bytecode of a compiled contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractArtifact {
    pub name: String,
    pub bytecode: Bytes,
}

impl ContractArtifact {
    pub fn new(name: impl Into<String>, bytecode: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytecode: bytecode.into(),
        }
    }

    /// Load `<dir>/<name>.json`, as written by Truffle, Hardhat or Foundry.
    pub fn load(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(format!("{}.json", name));
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;

        Self::from_json(name, &content)
            .with_context(|| format!("Invalid artifact {}", path.display()))
    }

    /// Parse an artifact from its JSON form.
    ///
    /// The `bytecode` field is either a hex string or an object with an `object` field.
    pub fn from_json(name: &str, content: &str) -> Result<Self> {
        let json: Value = serde_json::from_str(content).context("Artifact is not valid JSON")?;

        let bytecode = match json.get("bytecode") {
            Some(Value::String(hex)) => hex.as_str(),
            Some(Value::Object(object)) => object
                .get("object")
                .and_then(Value::as_str)
                .context("Artifact bytecode object has no 'object' field")?,
            _ => anyhow::bail!("Artifact has no bytecode"),
        };

        let bytecode = hex::decode(bytecode.trim_start_matches("0x"))
            .context("Artifact bytecode is not valid hex")?;

        if bytecode.is_empty() {
            anyhow::bail!("Artifact {} has empty bytecode (abstract contract or interface?)", name);
        }

        Ok(Self::new(name, bytecode))
    }

    /// Creation bytecode followed by the ABI-encoded constructor arguments.
    pub fn deploy_data(&self, args: &[DynSolValue]) -> Bytes {
        let mut data = self.bytecode.to_vec();
        data.extend_from_slice(&encode_args(args));
        data.into()
    }
}
