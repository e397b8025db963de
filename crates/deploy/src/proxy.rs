//! Upgradeable deployments behind a transparent proxy.
//!
//! A proxied step moves through `NotDeployed -> LogicDeployed -> ProxyDeployed ->
//! Initialized`, and later upgrades move it to `Upgraded`. Every transition is persisted in
//! the [`RecordBook`] as soon as it happens, including the hash of a transaction that has
//! been sent but not confirmed, so a failed or interrupted run resumes at the failed
//! transition instead of redeploying.
//!
//! The proxy is created with the initializer calldata as its constructor data, the way
//! OpenZeppelin's upgrade tooling does it. A transparent proxy never forwards calls from its
//! admin, so an initializer sent by the admin in a second transaction could not reach the
//! logic contract.

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Bytes, b256},
};

use crate::{
    artifact::ContractArtifact,
    error::DeployError,
    executor::StepExecutor,
    fingerprint::fingerprint,
    network::NetworkProfile,
    records::{DeployedContractRecord, ProxyAddresses, ProxyState, RecordBook},
    rpc::ChainRpc,
    signer::SigningTransport,
    step::{DeploymentStep, ProxyVersion, StepId, StepKind, UpgradeableConfig, encode_call},
    tx::TxRequest,
};

/// ERC-1967 storage slot holding the proxy admin.
pub const PROXY_ADMIN_SLOT: B256 =
    b256!("b53127684a568b3173ae13b9f8a6016e243e63b6e8ee1178d6a717850b5d6103");

/// Drives proxied steps through their lifecycle.
pub struct UpgradeProxyManager<'a> {
    executor: &'a StepExecutor,
}

impl<'a> UpgradeProxyManager<'a> {
    pub fn new(executor: &'a StepExecutor) -> Self {
        Self { executor }
    }

    /// Deploy `step` behind a proxy and initialize it, resuming from the last persisted state.
    pub async fn deploy<R: ChainRpc>(
        &self,
        step: &DeploymentStep,
        transport: &SigningTransport<R>,
        profile: &NetworkProfile,
        records: &mut RecordBook,
    ) -> Result<DeployedContractRecord, DeployError> {
        let config = upgradeable_config(step)?;

        if let Some(record) = records.get(&step.id) {
            return Ok(record.clone());
        }

        // Resolve initializer arguments before anything is sent.
        let init_args = step.resolve_args(records)?;

        loop {
            let state = records.progress_mut(&step.id).state;
            tracing::debug!(network = %profile.name, step = %step.id, %state, "Proxy state");

            match state {
                ProxyState::NotDeployed => {
                    self.deploy_logic(step, transport, profile, records).await?
                }
                ProxyState::LogicDeployed => {
                    self.deploy_proxy(step, config, &init_args, transport, profile, records)
                        .await?
                }
                ProxyState::ProxyDeployed => {
                    self.initialize(step, config, &init_args, transport, profile, records)
                        .await?
                }
                ProxyState::Initialized | ProxyState::Upgraded => break,
            }
        }

        let addresses = committed_addresses(records, &step.id)?;
        let record = DeployedContractRecord::upgradeable(
            step.id.clone(),
            step.artifact.name.clone(),
            addresses,
            fingerprint(step, profile.chain_id),
        );
        records.commit(record.clone())?;

        tracing::info!(
            network = %profile.name,
            step = %step.id,
            proxy = %addresses.proxy,
            logic = %addresses.logic,
            admin = %addresses.admin,
            version = %config.version,
            "Upgradeable contract deployed"
        );
        Ok(record)
    }

    /// `NotDeployed -> LogicDeployed`
    pub async fn deploy_logic<R: ChainRpc>(
        &self,
        step: &DeploymentStep,
        transport: &SigningTransport<R>,
        profile: &NetworkProfile,
        records: &mut RecordBook,
    ) -> Result<(), DeployError> {
        let progress = records.progress_mut(&step.id);
        expect_state(&step.id, progress.state, ProxyState::NotDeployed)?;

        let label = format!("{}:logic", step.id);
        let logic = self
            .executor
            .deploy(
                &label,
                step.artifact.deploy_data(&[]),
                step.gas_limit,
                transport,
                profile,
                &mut progress.pending_tx,
            )
            .await?;

        progress.logic = Some(logic);
        progress.state = ProxyState::LogicDeployed;
        Ok(())
    }

    /// `LogicDeployed -> ProxyDeployed`
    ///
    /// For v4 proxies without a configured admin, a `ProxyAdmin` owned by the signer is
    /// deployed first when the step carries its artifact. Its address is recorded before the
    /// proxy is sent, so a resumed run does not deploy a second one.
    pub async fn deploy_proxy<R: ChainRpc>(
        &self,
        step: &DeploymentStep,
        config: &UpgradeableConfig,
        init_args: &[DynSolValue],
        transport: &SigningTransport<R>,
        profile: &NetworkProfile,
        records: &mut RecordBook,
    ) -> Result<(), DeployError> {
        let progress = records.progress_mut(&step.id);
        expect_state(&step.id, progress.state, ProxyState::LogicDeployed)?;

        let logic = progress.logic.ok_or_else(|| missing(&step.id, "logic address"))?;

        let admin = match progress.admin {
            Some(admin) => admin,
            None => {
                let admin = match (config.admin, config.version, &config.proxy_admin) {
                    (Some(admin), _, _) => admin,
                    (None, ProxyVersion::V4, Some(proxy_admin)) => {
                        let label = format!("{}:proxy_admin", step.id);
                        let admin = self
                            .executor
                            .deploy(
                                &label,
                                proxy_admin.deploy_data(&[]),
                                step.gas_limit,
                                transport,
                                profile,
                                &mut progress.pending_tx,
                            )
                            .await?;
                        progress.owner = Some(transport.from());
                        admin
                    }
                    (None, _, _) => transport.from(),
                };
                if config.version == ProxyVersion::V5 {
                    progress.owner = Some(admin);
                }
                progress.admin = Some(admin);
                admin
            }
        };

        let label = format!("{}:proxy", step.id);
        let init_data = config.initializer_calldata(&step.args, init_args);
        let data = config
            .proxy
            .deploy_data(&config.proxy_constructor_args(logic, admin, init_data));
        let proxy = self
            .executor
            .deploy(
                &label,
                data,
                step.gas_limit,
                transport,
                profile,
                &mut progress.pending_tx,
            )
            .await?;

        // v5 proxies deploy their own admin contract, read back what the proxy reports.
        let admin_word = transport.storage_at(proxy, PROXY_ADMIN_SLOT).await?;
        if admin_word != B256::ZERO {
            let onchain_admin = Address::from_word(admin_word);
            if onchain_admin != admin {
                tracing::info!(step = %step.id, %proxy, admin = %onchain_admin, "Proxy created its own admin");
            }
            progress.admin = Some(onchain_admin);
        }

        progress.proxy = Some(proxy);
        progress.state = ProxyState::ProxyDeployed;
        Ok(())
    }

    /// `ProxyDeployed -> Initialized`
    ///
    /// The initializer runs exactly once. Initialization state is read from the chain, records
    /// alone are not trusted. A proxy initialized by its constructor only has its state
    /// advanced. An uninitialized proxy gets the initializer sent through it, unless the
    /// signer is the proxy admin, whose calls the proxy never forwards.
    pub async fn initialize<R: ChainRpc>(
        &self,
        step: &DeploymentStep,
        config: &UpgradeableConfig,
        args: &[DynSolValue],
        transport: &SigningTransport<R>,
        profile: &NetworkProfile,
        records: &mut RecordBook,
    ) -> Result<(), DeployError> {
        let progress = records.progress_mut(&step.id);
        let proxy = progress.proxy.ok_or_else(|| missing(&step.id, "proxy address"))?;

        match progress.state {
            ProxyState::ProxyDeployed => {}
            ProxyState::Initialized | ProxyState::Upgraded => {
                return Err(DeployError::AlreadyInitialized { proxy });
            }
            other => return Err(invalid(&step.id, other, ProxyState::ProxyDeployed)),
        }

        // With an initializer transaction in flight, the flag may be ours.
        if progress.pending_tx.is_none() {
            let initialized = transport
                .storage_at(proxy, config.version.initialized_slot())
                .await?;
            if initialized != B256::ZERO {
                tracing::info!(step = %step.id, %proxy, "Proxy initialized at construction");
                progress.state = ProxyState::Initialized;
                return Ok(());
            }

            if progress.admin == Some(transport.from()) {
                return Err(DeployError::InvalidTransition(format!(
                    "proxy {} is not initialized and signer {} is its admin, which the proxy \
                     does not forward calls from",
                    proxy,
                    transport.from()
                )));
            }
        }

        let label = format!("{}:initialize", step.id);
        let request = TxRequest::call(proxy, config.initializer_calldata(&step.args, args))
            .with_gas_limit(step.gas_limit);
        self.executor
            .send_tracked(&label, &request, transport, profile, &mut progress.pending_tx)
            .await?;

        tracing::info!(step = %step.id, %proxy, initializer = %config.initializer, "Proxy initialized");
        progress.state = ProxyState::Initialized;
        Ok(())
    }

    /// `Initialized | Upgraded -> Upgraded`
    ///
    /// Deploys `artifact` as the new logic contract and points the proxy at it. The proxy
    /// and admin addresses never change. A signer that is the proxy admin upgrades the proxy
    /// directly. Otherwise the admin must be a `ProxyAdmin` owned by the signer, which is
    /// checked on chain before anything is sent.
    pub async fn upgrade<R: ChainRpc>(
        &self,
        step: &DeploymentStep,
        artifact: &ContractArtifact,
        transport: &SigningTransport<R>,
        profile: &NetworkProfile,
        records: &mut RecordBook,
    ) -> Result<DeployedContractRecord, DeployError> {
        let config = upgradeable_config(step)?;

        let record = records
            .get(&step.id)
            .cloned()
            .ok_or_else(|| DeployError::InvalidTransition(format!("step '{}' has not been deployed", step.id)))?;
        let addresses = record
            .proxy
            .ok_or_else(|| missing(&step.id, "proxy addresses"))?;

        let progress = records.progress_mut(&step.id);
        if !matches!(
            progress.state,
            ProxyState::Initialized | ProxyState::Upgraded
        ) {
            return Err(invalid(&step.id, progress.state, ProxyState::Initialized));
        }

        let via_proxy_admin = transport.from() != addresses.admin;
        if via_proxy_admin {
            let owner = proxy_admin_owner(transport, addresses.admin).await?;
            if owner != Some(transport.from()) {
                return Err(DeployError::InvalidTransition(format!(
                    "signer {} is neither the admin {} of proxy {} nor the owner of that admin",
                    transport.from(),
                    addresses.admin,
                    addresses.proxy
                )));
            }
        }

        let next_logic = match progress.next_logic {
            Some(next_logic) => next_logic,
            None => {
                let label = format!("{}:logic", step.id);
                let next_logic = self
                    .executor
                    .deploy(
                        &label,
                        artifact.deploy_data(&[]),
                        step.gas_limit,
                        transport,
                        profile,
                        &mut progress.pending_tx,
                    )
                    .await?;
                progress.next_logic = Some(next_logic);
                next_logic
            }
        };

        let request = if via_proxy_admin {
            TxRequest::call(
                addresses.admin,
                proxy_admin_upgrade_calldata(config.version, addresses.proxy, next_logic),
            )
        } else {
            TxRequest::call(
                addresses.proxy,
                admin_upgrade_calldata(config.version, next_logic),
            )
        }
        .with_gas_limit(step.gas_limit);

        let label = format!("{}:upgrade", step.id);
        self.executor
            .send_tracked(&label, &request, transport, profile, &mut progress.pending_tx)
            .await?;

        progress.logic = Some(next_logic);
        progress.next_logic = None;
        progress.state = ProxyState::Upgraded;

        let mut upgraded_step = step.clone();
        upgraded_step.artifact = artifact.clone();
        let upgraded = record.upgraded(next_logic, fingerprint(&upgraded_step, profile.chain_id));
        records.replace(upgraded.clone());

        tracing::info!(
            network = %profile.name,
            step = %step.id,
            proxy = %addresses.proxy,
            previous_logic = %addresses.logic,
            logic = %next_logic,
            via_proxy_admin,
            "Proxy upgraded"
        );
        Ok(upgraded)
    }
}

/// Calldata of `upgradeTo(address)`, sent by a v4 proxy's admin to the proxy.
pub fn upgrade_to_calldata(logic: Address) -> Bytes {
    encode_call("upgradeTo(address)", &[DynSolValue::Address(logic)])
}

/// Calldata the proxy admin sends to the proxy itself.
pub fn admin_upgrade_calldata(version: ProxyVersion, logic: Address) -> Bytes {
    match version {
        ProxyVersion::V4 => upgrade_to_calldata(logic),
        ProxyVersion::V5 => encode_call(
            "upgradeToAndCall(address,bytes)",
            &[DynSolValue::Address(logic), DynSolValue::Bytes(Vec::new())],
        ),
    }
}

/// Calldata the owner of a `ProxyAdmin` sends to it to upgrade `proxy`.
pub fn proxy_admin_upgrade_calldata(version: ProxyVersion, proxy: Address, logic: Address) -> Bytes {
    match version {
        ProxyVersion::V4 => encode_call(
            "upgrade(address,address)",
            &[DynSolValue::Address(proxy), DynSolValue::Address(logic)],
        ),
        ProxyVersion::V5 => encode_call(
            "upgradeAndCall(address,address,bytes)",
            &[
                DynSolValue::Address(proxy),
                DynSolValue::Address(logic),
                DynSolValue::Bytes(Vec::new()),
            ],
        ),
    }
}

/// `owner()` of the contract at `admin`, `None` when it does not answer like an `Ownable`.
async fn proxy_admin_owner<R: ChainRpc>(
    transport: &SigningTransport<R>,
    admin: Address,
) -> Result<Option<Address>, DeployError> {
    let output = transport
        .call(&TxRequest::call(admin, encode_call("owner()", &[])))
        .await?;
    if output.len() < 32 {
        return Ok(None);
    }
    Ok(Some(Address::from_word(B256::from_slice(&output[..32]))))
}

fn upgradeable_config(step: &DeploymentStep) -> Result<&UpgradeableConfig, DeployError> {
    match &step.kind {
        StepKind::Upgradeable(config) => Ok(config),
        StepKind::Plain => Err(DeployError::InvalidTransition(format!(
            "step '{}' is not upgradeable",
            step.id
        ))),
    }
}

fn committed_addresses(records: &mut RecordBook, step: &StepId) -> Result<ProxyAddresses, DeployError> {
    let progress = records.progress_mut(step);
    Ok(ProxyAddresses {
        logic: progress.logic.ok_or_else(|| missing(step, "logic address"))?,
        proxy: progress.proxy.ok_or_else(|| missing(step, "proxy address"))?,
        admin: progress.admin.ok_or_else(|| missing(step, "admin address"))?,
        owner: progress.owner,
        previous_logic: None,
    })
}

fn expect_state(step: &StepId, actual: ProxyState, expected: ProxyState) -> Result<(), DeployError> {
    if actual != expected {
        return Err(invalid(step, actual, expected));
    }
    Ok(())
}

fn invalid(step: &StepId, actual: ProxyState, expected: ProxyState) -> DeployError {
    DeployError::InvalidTransition(format!(
        "step '{}' is {}, expected {}",
        step, actual, expected
    ))
}

fn missing(step: &StepId, what: &str) -> DeployError {
    DeployError::InvalidTransition(format!("step '{}' has no recorded {}", step, what))
}
