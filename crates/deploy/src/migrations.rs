//! The ACR migration plan.

use std::path::Path;

use alloy_core::primitives::{Address, U256};
use anyhow::Context;

use crate::{
    artifact::ContractArtifact,
    step::{DeploymentStep, ProxyVersion, StepArg, UpgradeableConfig},
};

pub const NFT_STEP: &str = "acr_nft";
pub const TOKEN_STEP: &str = "acr_token";

pub const NFT_ARTIFACT: &str = "ACR";
pub const TOKEN_ARTIFACT: &str = "ACRToken";
pub const PROXY_ARTIFACT: &str = "TransparentUpgradeableProxy";
pub const PROXY_ADMIN_ARTIFACT: &str = "ProxyAdmin";

pub const TOKEN_NAME: &str = "ACR Token";
pub const TOKEN_SYMBOL: &str = "ACR";
pub const TOKEN_DECIMALS: u8 = 18;
/// Total supply in whole tokens.
pub const TOKEN_TOTAL_SUPPLY: u128 = 10_000_000;
pub const TOKEN_INITIALIZER: &str = "initialize";

/// Gas limit of the NFT deployment.
pub const NFT_GAS_LIMIT: u64 = 1_000_000;

/// Convert a display amount to the token's smallest unit: `amount * 10^decimals`.
///
/// Returns `None` if the result does not fit in 256 bits.
pub fn scale_supply(amount: u128, decimals: u8) -> Option<U256> {
    let unit = U256::from(10u64).checked_pow(U256::from(decimals))?;
    U256::from(amount).checked_mul(unit)
}

/// The compiled contracts the plan deploys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcrArtifacts {
    pub nft: ContractArtifact,
    pub token: ContractArtifact,
    pub proxy: ContractArtifact,
    /// Admin contract deployed ahead of v4 proxies. v5 proxies create their own.
    pub proxy_admin: Option<ContractArtifact>,
    pub version: ProxyVersion,
}

impl AcrArtifacts {
    pub fn load(dir: &Path, version: ProxyVersion) -> anyhow::Result<Self> {
        let proxy_admin = match version {
            ProxyVersion::V4 => Some(ContractArtifact::load(dir, PROXY_ADMIN_ARTIFACT)?),
            ProxyVersion::V5 => None,
        };
        Ok(Self {
            nft: ContractArtifact::load(dir, NFT_ARTIFACT)?,
            token: ContractArtifact::load(dir, TOKEN_ARTIFACT)?,
            proxy: ContractArtifact::load(dir, PROXY_ARTIFACT)?,
            proxy_admin,
            version,
        })
    }
}

/// Deploy the ACR NFT, then the ACR token behind an upgradeable proxy initialized at
/// construction.
///
/// `admin` overrides the proxy admin of v4 proxies and the admin owner of v5 proxies. Unset,
/// a v4 proxy is administered by a `ProxyAdmin` owned by the deploying account, and a v5
/// proxy's own admin is owned by the deploying account.
pub fn acr_plan(artifacts: &AcrArtifacts, admin: Option<Address>) -> anyhow::Result<Vec<DeploymentStep>> {
    let total_supply = scale_supply(TOKEN_TOTAL_SUPPLY, TOKEN_DECIMALS)
        .context("ACR token supply overflows uint256")?;

    let nft = DeploymentStep::plain(NFT_STEP, artifacts.nft.clone(), vec![])
        .with_gas_limit(NFT_GAS_LIMIT);

    let mut proxy = UpgradeableConfig::new(artifacts.proxy.clone(), TOKEN_INITIALIZER)
        .with_admin(admin)
        .with_version(artifacts.version);
    if let Some(proxy_admin) = &artifacts.proxy_admin {
        proxy = proxy.with_proxy_admin(proxy_admin.clone());
    }

    let token = DeploymentStep::upgradeable(
        TOKEN_STEP,
        artifacts.token.clone(),
        proxy,
        vec![
            StepArg::String(TOKEN_NAME.to_string()),
            StepArg::String(TOKEN_SYMBOL.to_string()),
            StepArg::Uint(total_supply),
        ],
    );

    Ok(vec![nft, token])
}
