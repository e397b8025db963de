//! Deployment steps and their arguments.

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Bytes, U256, keccak256},
};
use serde::{Deserialize, Serialize};

use crate::{artifact::ContractArtifact, error::DeployError, records::RecordBook};

/// Storage slot holding OpenZeppelin's `Initializable` state before v5.
pub const LEGACY_INITIALIZED_SLOT: B256 = B256::ZERO;

/// ERC-7201 namespaced slot of OpenZeppelin v5 `Initializable` storage.
pub const NAMESPACED_INITIALIZED_SLOT: B256 = B256::new([
    0xf0, 0xc5, 0x7e, 0x16, 0x84, 0x0d, 0xf0, 0x40, 0xf1, 0x50, 0x88, 0xdc, 0x2f, 0x81, 0xfe, 0x39,
    0x1c, 0x39, 0x23, 0xbe, 0xc7, 0x3e, 0x23, 0xa9, 0x66, 0x2e, 0xfc, 0x9c, 0x22, 0x9c, 0x6a, 0x00,
]);

/// OpenZeppelin generation of the transparent proxy contracts.
///
/// v4 proxies take their admin in the constructor and are upgraded with `upgradeTo` by the
/// admin, or through a `ProxyAdmin`. v5 proxies deploy their own `ProxyAdmin` owned by the
/// constructor's `initialOwner`, and only upgrade through it.
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
pub enum ProxyVersion {
    #[default]
    V4,
    V5,
}

impl ProxyVersion {
    /// Storage slot of the proxy that is non-zero once the logic has been initialized.
    pub fn initialized_slot(&self) -> B256 {
        match self {
            ProxyVersion::V4 => LEGACY_INITIALIZED_SLOT,
            ProxyVersion::V5 => NAMESPACED_INITIALIZED_SLOT,
        }
    }
}

/// Identifier of a step, unique within a migration plan.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A constructor or initializer argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StepArg {
    Address(Address),
    Uint(U256),
    String(String),
    Bool(bool),
    Bytes(Bytes),
    /// The address produced by an earlier step.
    StepAddress(StepId),
}

impl StepArg {
    /// Solidity type name, as used in function signatures.
    pub fn sol_type(&self) -> &'static str {
        match self {
            StepArg::Address(_) | StepArg::StepAddress(_) => "address",
            StepArg::Uint(_) => "uint256",
            StepArg::String(_) => "string",
            StepArg::Bool(_) => "bool",
            StepArg::Bytes(_) => "bytes",
        }
    }

    fn resolve(&self, step: &StepId, records: &RecordBook) -> Result<DynSolValue, DeployError> {
        Ok(match self {
            StepArg::Address(address) => DynSolValue::Address(*address),
            StepArg::Uint(value) => DynSolValue::Uint(*value, 256),
            StepArg::String(value) => DynSolValue::String(value.clone()),
            StepArg::Bool(value) => DynSolValue::Bool(*value),
            StepArg::Bytes(value) => DynSolValue::Bytes(value.to_vec()),
            StepArg::StepAddress(dependency) => DynSolValue::Address(
                records
                    .address_of(dependency)
                    .ok_or_else(|| DeployError::UnresolvedDependency {
                        step: step.clone(),
                        dependency: dependency.clone(),
                    })?,
            ),
        })
    }
}

/// How a step's contract is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Deployed directly, arguments go to the constructor.
    Plain,
    /// Deployed behind a transparent proxy, arguments go to the initializer.
    Upgradeable(UpgradeableConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeableConfig {
    pub proxy: ContractArtifact,
    /// Deployed ahead of a v4 proxy to become its admin when no admin is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_admin: Option<ContractArtifact>,
    /// Name of the initializer function on the logic contract.
    pub initializer: String,
    /// Proxy admin for v4, `initialOwner` of the proxy's own admin for v5. The deploying
    /// account when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<Address>,
    #[serde(default)]
    pub version: ProxyVersion,
}

impl UpgradeableConfig {
    pub fn new(proxy: ContractArtifact, initializer: impl Into<String>) -> Self {
        Self {
            proxy,
            proxy_admin: None,
            initializer: initializer.into(),
            admin: None,
            version: ProxyVersion::default(),
        }
    }

    pub fn with_proxy_admin(mut self, proxy_admin: ContractArtifact) -> Self {
        self.proxy_admin = Some(proxy_admin);
        self
    }

    pub fn with_admin(mut self, admin: Option<Address>) -> Self {
        self.admin = admin;
        self
    }

    pub fn with_version(mut self, version: ProxyVersion) -> Self {
        self.version = version;
        self
    }

    /// Calldata for `initializer(args...)`.
    pub fn initializer_calldata(&self, args: &[StepArg], values: &[DynSolValue]) -> Bytes {
        let types = args.iter().map(StepArg::sol_type).collect::<Vec<_>>().join(",");
        encode_call(&format!("{}({})", self.initializer, types), values)
    }

    /// Constructor arguments of the proxy: `(logic, admin, data)`.
    ///
    /// `data` is the initializer calldata, so the proxy is initialized in the transaction that
    /// creates it. For v5 proxies `admin` is the owner of the admin contract the proxy creates.
    pub fn proxy_constructor_args(
        &self,
        logic: Address,
        admin: Address,
        data: Bytes,
    ) -> Vec<DynSolValue> {
        vec![
            DynSolValue::Address(logic),
            DynSolValue::Address(admin),
            DynSolValue::Bytes(data.to_vec()),
        ]
    }
}

/// One unit of deployment work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub id: StepId,
    pub artifact: ContractArtifact,
    pub args: Vec<StepArg>,
    pub kind: StepKind,
    /// Gas limit for this step's transactions, overriding the network policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
}

impl DeploymentStep {
    pub fn plain(id: impl Into<StepId>, artifact: ContractArtifact, args: Vec<StepArg>) -> Self {
        Self {
            id: id.into(),
            artifact,
            args,
            kind: StepKind::Plain,
            gas_limit: None,
        }
    }

    pub fn upgradeable(
        id: impl Into<StepId>,
        artifact: ContractArtifact,
        config: UpgradeableConfig,
        args: Vec<StepArg>,
    ) -> Self {
        Self {
            id: id.into(),
            artifact,
            args,
            kind: StepKind::Upgradeable(config),
            gas_limit: None,
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn is_upgradeable(&self) -> bool {
        matches!(self.kind, StepKind::Upgradeable(_))
    }

    /// Steps whose addresses this step consumes.
    pub fn dependencies(&self) -> impl Iterator<Item = &StepId> {
        self.args.iter().filter_map(|arg| match arg {
            StepArg::StepAddress(id) => Some(id),
            _ => None,
        })
    }

    /// Resolve the step's arguments against already committed records.
    pub fn resolve_args(&self, records: &RecordBook) -> Result<Vec<DynSolValue>, DeployError> {
        self.args
            .iter()
            .map(|arg| arg.resolve(&self.id, records))
            .collect()
    }
}

/// Calldata of `signature` applied to `values`.
pub fn encode_call(signature: &str, values: &[DynSolValue]) -> Bytes {
    let mut calldata = keccak256(signature.as_bytes())[..4].to_vec();
    calldata.extend_from_slice(&encode_args(values));
    calldata.into()
}

/// ABI-encode `values` as a parameter list.
pub fn encode_args(values: &[DynSolValue]) -> Bytes {
    if values.is_empty() {
        return Bytes::new();
    }
    DynSolValue::Tuple(values.to_vec()).abi_encode_params().into()
}
