//! acr deploys the ACR NFT and the upgradeable ACR token to EVM networks.

mod cli;
mod config;

use std::path::Path;

use acr_deploy::{
    CancelToken, DeployerBuilder, MigrationReport, NetworkRegistry, Secrets, StepId,
    network::Endpoint,
};
use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};
use dotenv::dotenv;

use cli::{Cli, Command, MigrateArgs, NetworksArgs, TargetArgs, UpgradeArgs};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.command {
        Command::Migrate(args) => migrate(args, config::load_secrets(&cli.config)?).await,
        Command::Upgrade(args) => upgrade(args, config::load_secrets(&cli.config)?).await,
        Command::Networks(args) => networks(args),
    }
}

fn builder(target: TargetArgs, secrets: Secrets) -> DeployerBuilder {
    let mut builder = DeployerBuilder::new(target.network)
        .secrets(secrets)
        .artifacts_dir(target.artifacts)
        .proxy_version(target.proxy_version)
        .skip_dry_run(target.skip_dry_run);

    if let Some(networks) = target.networks {
        builder = builder.networks_file(networks);
    }
    builder
}

async fn migrate(args: MigrateArgs, secrets: Secrets) -> Result<()> {
    let mut builder = builder(args.target, secrets)
        .verify(args.verify)
        .redeploy(args.redeploy);

    if let Some(records) = args.records {
        builder = builder.records_path(records);
    }
    if let Some(admin) = args.admin {
        builder = builder.admin(admin);
    }
    if let Some(step) = args.start_from {
        builder = builder.start_from(step);
    }

    let deployer = builder.build()?;

    let (handle, cancel) = CancelToken::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current wait...");
            handle.cancel();
        }
    });

    let report = deployer.migrate(&cancel).await?;
    print_report(&report);

    match report.failure {
        Some(failure) => Err(failure).context("Migration did not complete"),
        None => {
            tracing::info!(
                network = %report.network,
                executed = report.executed.len(),
                "Migration complete"
            );
            Ok(())
        }
    }
}

async fn upgrade(args: UpgradeArgs, secrets: Secrets) -> Result<()> {
    let deployer = builder(args.target, secrets)
        .records_path(args.records)
        .build()?;

    let record = deployer
        .upgrade(&StepId::from(args.step), &args.artifact)
        .await?;

    if let Some(proxy) = record.proxy {
        println!("{}: {}", record.step, record.address);
        println!("logic: {}", proxy.logic);
        if let Some(previous) = proxy.previous_logic {
            println!("previous logic: {}", previous);
        }
    }
    Ok(())
}

fn networks(args: NetworksArgs) -> Result<()> {
    let mut registry = NetworkRegistry::builtin()?;
    if let Some(path) = args.networks.as_deref() {
        registry = registry.with_overrides_file(Path::new(path))?;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "Network",
        "Chain ID",
        "Risk",
        "Endpoint",
        "Confirmations",
        "Timeout (blocks)",
        "Explorer",
    ]);

    for profile in registry.profiles() {
        let endpoint = match &profile.endpoint {
            Endpoint::Fixed { url } => url.to_string(),
            Endpoint::Templated { template } => template.clone(),
        };
        table.add_row(vec![
            profile.name.clone(),
            profile.chain_id.to_string(),
            profile.risk.to_string(),
            endpoint,
            profile.confirmations.to_string(),
            profile.timeouts.timeout_blocks.to_string(),
            profile
                .explorer
                .map(|explorer| explorer.to_string())
                .unwrap_or_default(),
        ]);
    }

    println!("{table}");
    Ok(())
}

fn print_report(report: &MigrationReport) {
    if !report.records.is_empty() {
        println!("{}", report.table());
        for line in report.address_lines() {
            println!("{}", line);
        }
    }

    if let Some(path) = &report.manifest {
        println!("verification manifest: {}", path.display());
    }
}
