use std::path::PathBuf;

use acr_deploy::{DEFAULT_ARTIFACTS_DIR, DEFAULT_NETWORK, ProxyVersion, migrations::TOKEN_STEP};
use alloy_core::primitives::Address;
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// The local file secrets are read from, besides the environment.
pub const DEFAULT_CONFIG_FILE: &str = "acr.toml";

#[derive(Parser)]
#[command(name = "acr")]
#[command(
    author,
    version,
    about = "Deploy the ACR NFT and the upgradeable ACR token to EVM networks"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "ACR_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// TOML file holding secrets (mnemonic, private key, API keys).
    ///
    /// Environment variables take precedence over the file. A missing file is ignored.
    #[arg(long, env = "ACR_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the ACR migrations against a network.
    Migrate(MigrateArgs),
    /// Point the proxy of an upgradeable step at a new logic contract.
    Upgrade(UpgradeArgs),
    /// List the known networks.
    Networks(NetworksArgs),
}

/// Options shared by every command that talks to a network.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// The network to deploy to.
    #[arg(short, long, env = "ACR_NETWORK", default_value = DEFAULT_NETWORK)]
    pub network: String,

    /// A TOML network table overlaid on the built-in one.
    #[arg(long, env = "ACR_NETWORKS")]
    pub networks: Option<PathBuf>,

    /// Directory holding the compiled contract artifacts.
    #[arg(long, env = "ACR_ARTIFACTS", default_value = DEFAULT_ARTIFACTS_DIR)]
    pub artifacts: PathBuf,

    /// OpenZeppelin generation of the proxy artifacts: `v4` deploys a `ProxyAdmin`, `v5`
    /// proxies create their own.
    #[arg(long, env = "ACR_PROXY_VERSION", default_value = "v4")]
    pub proxy_version: ProxyVersion,

    /// Skip the simulation of transactions before broadcasting them.
    #[arg(long, env = "ACR_SKIP_DRY_RUN")]
    pub skip_dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Deployment records file.
    ///
    /// Completed steps found in it are skipped, and it is saved after every run.
    #[arg(long, env = "ACR_RECORDS")]
    pub records: Option<PathBuf>,

    /// Require an explorer API key and write a verification manifest.
    #[arg(long, env = "ACR_VERIFY")]
    pub verify: bool,

    /// The proxy admin. Defaults to the deploying account.
    #[arg(long, env = "ACR_ADMIN")]
    pub admin: Option<Address>,

    /// Start at this step, skipping the steps before it.
    #[arg(long, env = "ACR_START_FROM")]
    pub start_from: Option<String>,

    /// Redeploy completed plain steps.
    #[arg(long, env = "ACR_REDEPLOY", default_value_t = false)]
    pub redeploy: bool,
}

#[derive(Debug, Clone, Args)]
pub struct UpgradeArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Deployment records file of the original deployment.
    #[arg(long, env = "ACR_RECORDS")]
    pub records: PathBuf,

    /// The upgradeable step to upgrade.
    #[arg(long, default_value = TOKEN_STEP)]
    pub step: String,

    /// Artifact name of the new logic contract.
    #[arg(long)]
    pub artifact: String,
}

#[derive(Debug, Clone, Args)]
pub struct NetworksArgs {
    /// A TOML network table overlaid on the built-in one.
    #[arg(long, env = "ACR_NETWORKS")]
    pub networks: Option<PathBuf>,
}
