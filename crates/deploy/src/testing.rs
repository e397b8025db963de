//! An in-memory chain for unit tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_core::primitives::{Address, B256, Bytes, TxHash, U64, U256, address, keccak256};

use crate::{
    error::RpcError,
    executor::ExecutorOptions,
    proxy::PROXY_ADMIN_SLOT,
    rpc::{CallRequest, ChainRpc, Receipt, encode_revert_reason},
    step::ProxyVersion,
    tx::decode_signed,
};

/// Creation code prefix the mock treats as a v4 transparent proxy.
pub(crate) const PROXY_CODE: [u8; 4] = [0xfe, 0xed, 0x00, 0x04];
/// Creation code prefix the mock treats as a v5 transparent proxy.
pub(crate) const PROXY_V5_CODE: [u8; 4] = [0xfe, 0xed, 0x00, 0x05];
/// Creation code prefix the mock treats as a v4 `ProxyAdmin`, owned by its deployer.
pub(crate) const PROXY_ADMIN_CODE: [u8; 4] = [0xfe, 0xed, 0x0a, 0xd0];

const ESTIMATED_GAS: u64 = 100_000;

/// Executor options with negligible delays.
pub(crate) fn fast_options() -> ExecutorOptions {
    ExecutorOptions {
        retry_min_delay: Duration::from_millis(1),
        poll_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

/// First four bytes of the hash of `signature`.
pub(crate) fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentTx {
    pub hash: TxHash,
    pub from: Address,
    pub nonce: u64,
    pub to: Option<Address>,
    pub input: Bytes,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, Copy)]
struct MockProxy {
    logic: Address,
    admin: Address,
    version: ProxyVersion,
}

/// What a successful transaction changes.
enum Effect {
    None,
    Initialize(Address),
    Upgrade { proxy: Address, logic: Address },
    Return(Bytes),
}

#[derive(Default)]
struct ChainState {
    block: u64,
    frozen: bool,
    accounts: Vec<Address>,
    nonces: HashMap<Address, u64>,
    code: HashMap<Address, Bytes>,
    storage: HashMap<(Address, B256), B256>,
    proxies: HashMap<Address, MockProxy>,
    /// `ProxyAdmin` contract -> owner
    proxy_admins: HashMap<Address, Address>,
    receipts: HashMap<TxHash, Receipt>,
    stalled: Vec<SentTx>,
    stall_prefixes: Vec<Vec<u8>>,
    reverts: Vec<(Vec<u8>, String)>,
    drop_next: usize,
    sent: Vec<SentTx>,
    deployments: Vec<(Bytes, Address)>,
    calls: usize,
}

fn word(data: &[u8], index: usize) -> Option<B256> {
    data.get(index * 32..(index + 1) * 32).map(B256::from_slice)
}

fn address_arg(input: &[u8], index: usize) -> Result<Address, String> {
    word(input.get(4..).unwrap_or_default(), index)
        .map(Address::from_word)
        .ok_or_else(|| "calldata too short".to_string())
}

/// Split `(address logic, address admin, bytes data)` proxy constructor arguments.
fn proxy_args(args: &[u8]) -> Option<(Address, Address, &[u8])> {
    let logic = Address::from_word(word(args, 0)?);
    let admin = Address::from_word(word(args, 1)?);
    let offset: usize = U256::from_be_bytes(word(args, 2)?.0).saturating_to();
    let len: usize = U256::from_be_bytes(word(args.get(offset..)?, 0)?.0).saturating_to();
    let data = args.get(offset + 32..offset + 32 + len)?;
    Some((logic, admin, data))
}

impl ChainState {
    fn revert_reason(&self, input: &[u8]) -> Option<String> {
        self.reverts
            .iter()
            .find(|(prefix, _)| input.starts_with(prefix))
            .map(|(_, reason)| reason.clone())
    }

    /// Outcome of executing a transaction against the current state.
    ///
    /// Proxies follow the transparent proxy rules: calls from the admin are never forwarded,
    /// and everything else reaches the logic contract, whose only entry point is its
    /// initializer.
    fn simulate(&self, from: Address, to: Option<Address>, input: &[u8]) -> Result<Effect, String> {
        if let Some(reason) = self.revert_reason(input) {
            return Err(reason);
        }
        let Some(to) = to else {
            return Ok(Effect::None);
        };
        let selector_matches = |signature: &str| input.get(..4) == Some(&selector(signature)[..]);

        if let Some(owner) = self.proxy_admins.get(&to) {
            if selector_matches("owner()") {
                return Ok(Effect::Return(owner.into_word().into()));
            }
            if from != *owner {
                return Err("Ownable: caller is not the owner".to_string());
            }
            if selector_matches("upgrade(address,address)")
                || selector_matches("upgradeAndCall(address,address,bytes)")
            {
                return self.admin_upgrade(to, address_arg(input, 0)?, address_arg(input, 1)?);
            }
            return Err("ProxyAdmin: unknown function".to_string());
        }

        let Some(proxy) = self.proxies.get(&to) else {
            return Ok(Effect::None);
        };
        let admin_selector = match proxy.version {
            ProxyVersion::V4 => {
                selector_matches("upgradeTo(address)")
                    || selector_matches("upgradeToAndCall(address,bytes)")
            }
            ProxyVersion::V5 => selector_matches("upgradeToAndCall(address,bytes)"),
        };

        if from == proxy.admin {
            if admin_selector {
                return self.admin_upgrade(from, to, address_arg(input, 0)?);
            }
            return Err(match proxy.version {
                ProxyVersion::V4 => {
                    "TransparentUpgradeableProxy: admin cannot fallback to proxy target".to_string()
                }
                ProxyVersion::V5 => "ProxyDeniedAdminAccess()".to_string(),
            });
        }
        if admin_selector {
            return Err("function selector was not recognized".to_string());
        }
        if self.initialized(to) {
            return Err("Initializable: contract is already initialized".to_string());
        }
        Ok(Effect::Initialize(to))
    }

    fn admin_upgrade(&self, admin: Address, proxy: Address, logic: Address) -> Result<Effect, String> {
        match self.proxies.get(&proxy) {
            Some(state) if state.admin == admin => Ok(Effect::Upgrade { proxy, logic }),
            _ => Err("caller is not the proxy admin".to_string()),
        }
    }

    fn initialized(&self, proxy: Address) -> bool {
        let Some(state) = self.proxies.get(&proxy) else {
            return false;
        };
        self.storage
            .get(&(proxy, state.version.initialized_slot()))
            .is_some_and(|value| *value != B256::ZERO)
    }

    fn mark_initialized(&mut self, proxy: Address) {
        if let Some(state) = self.proxies.get(&proxy) {
            let slot = state.version.initialized_slot();
            self.storage.insert((proxy, slot), B256::with_last_byte(1));
        }
    }

    fn create(&mut self, from: Address, address: Address, input: &Bytes) {
        let version = if input.starts_with(&PROXY_CODE) {
            Some(ProxyVersion::V4)
        } else if input.starts_with(&PROXY_V5_CODE) {
            Some(ProxyVersion::V5)
        } else {
            None
        };

        if let Some((version, (logic, admin, data))) =
            version.and_then(|version| Some((version, proxy_args(&input[4..])?)))
        {
            let admin = match version {
                ProxyVersion::V4 => admin,
                ProxyVersion::V5 => {
                    let proxy_admin = address.create(1);
                    self.proxy_admins.insert(proxy_admin, admin);
                    self.code
                        .insert(proxy_admin, Bytes::from_static(&PROXY_ADMIN_CODE));
                    proxy_admin
                }
            };
            self.proxies.insert(
                address,
                MockProxy {
                    logic,
                    admin,
                    version,
                },
            );
            self.storage
                .insert((address, PROXY_ADMIN_SLOT), admin.into_word());
            if !data.is_empty() {
                self.mark_initialized(address);
            }
        } else if input.starts_with(&PROXY_ADMIN_CODE) {
            self.proxy_admins.insert(address, from);
        }

        self.code.insert(address, input.clone());
        self.deployments.push((input.clone(), address));
    }

    fn mine(&mut self, tx: SentTx) {
        self.block += 1;
        let mut contract_address = None;
        let outcome = self.simulate(tx.from, tx.to, &tx.input);

        match (&outcome, tx.to) {
            (Ok(_), None) => {
                let address = tx.from.create(tx.nonce);
                self.create(tx.from, address, &tx.input);
                contract_address = Some(address);
            }
            (Ok(Effect::Initialize(proxy)), Some(_)) => self.mark_initialized(*proxy),
            (Ok(Effect::Upgrade { proxy, logic }), Some(_)) => {
                if let Some(state) = self.proxies.get_mut(proxy) {
                    state.logic = *logic;
                }
            }
            _ => {}
        }

        self.receipts.insert(
            tx.hash,
            Receipt {
                transaction_hash: tx.hash,
                block_number: self.block,
                contract_address,
                status: Some(U64::from(outcome.is_ok() as u8)),
            },
        );
    }

    fn submit(&mut self, tx: SentTx) -> Result<TxHash, RpcError> {
        let expected = self.nonces.get(&tx.from).copied().unwrap_or_default();
        if tx.nonce != expected {
            return Err(RpcError::Response {
                code: -32000,
                message: format!("invalid nonce: expected {}, got {}", expected, tx.nonce),
                data: None,
            });
        }

        self.sent.push(tx.clone());
        let hash = tx.hash;

        if self.drop_next > 0 {
            self.drop_next -= 1;
            return Ok(hash);
        }

        self.nonces.insert(tx.from, expected + 1);
        if self
            .stall_prefixes
            .iter()
            .any(|prefix| tx.input.starts_with(prefix))
        {
            self.stalled.push(tx);
        } else {
            self.mine(tx);
        }
        Ok(hash)
    }
}

/// A chain that mines every transaction instantly, one block per transaction.
///
/// Each block number query also advances the chain by one block, so confirmation waits make
/// progress without a real clock, until [`MockChain::freeze_blocks`] stops the head. Clones
/// share state.
#[derive(Clone)]
pub(crate) struct MockChain {
    chain_id: u64,
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    /// Unlocked account of the node.
    pub const AMBIENT_ACCOUNT: Address = address!("00a329c0648769a73afac7f9381e08fb43dbea72");

    pub fn new(chain_id: u64) -> Self {
        let state = ChainState {
            accounts: vec![Self::AMBIENT_ACCOUNT],
            ..Default::default()
        };
        Self {
            chain_id,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn without_accounts(self) -> Self {
        self.state.lock().unwrap().accounts.clear();
        self
    }

    /// Make calls and transactions whose input starts with `prefix` revert.
    pub fn revert_on(&self, prefix: &[u8], reason: &str) {
        self.state
            .lock()
            .unwrap()
            .reverts
            .push((prefix.to_vec(), reason.to_string()));
    }

    /// Accept the next `count` transactions but forget them immediately.
    pub fn drop_next(&self, count: usize) {
        self.state.lock().unwrap().drop_next = count;
    }

    /// Keep transactions whose input starts with `prefix` pending until released.
    pub fn stall_matching(&self, prefix: &[u8]) {
        self.state.lock().unwrap().stall_prefixes.push(prefix.to_vec());
    }

    /// Mine every stalled transaction and stop stalling.
    pub fn release_stalled(&self) {
        let mut state = self.state.lock().unwrap();
        state.stall_prefixes.clear();
        let stalled = std::mem::take(&mut state.stalled);
        for tx in stalled {
            state.mine(tx);
        }
    }

    /// Stop the head from advancing, as a stalled node would.
    pub fn freeze_blocks(&self) {
        self.state.lock().unwrap().frozen = true;
    }

    pub fn set_storage(&self, address: Address, slot: B256, value: B256) {
        self.state
            .lock()
            .unwrap()
            .storage
            .insert((address, slot), value);
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Number of `eth_call` requests served.
    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn contract_count(&self) -> usize {
        self.state.lock().unwrap().code.len()
    }

    /// Addresses of contracts created from code starting with `prefix`, in creation order.
    pub fn deployments_of(&self, prefix: &[u8]) -> Vec<Address> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .iter()
            .filter(|(code, _)| code.starts_with(prefix))
            .map(|(_, address)| *address)
            .collect()
    }

    pub fn logic_of(&self, proxy: Address) -> Option<Address> {
        self.state
            .lock()
            .unwrap()
            .proxies
            .get(&proxy)
            .map(|state| state.logic)
    }

    pub fn owner_of(&self, proxy_admin: Address) -> Option<Address> {
        self.state
            .lock()
            .unwrap()
            .proxy_admins
            .get(&proxy_admin)
            .copied()
    }

    pub fn is_initialized(&self, proxy: Address) -> bool {
        self.state.lock().unwrap().initialized(proxy)
    }

    fn revert_error(reason: String) -> RpcError {
        RpcError::Response {
            code: 3,
            message: format!("execution reverted: {}", reason),
            data: Some(format!("0x{}", hex::encode(encode_revert_reason(&reason)))),
        }
    }
}

impl ChainRpc for MockChain {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let mut state = self.state.lock().unwrap();
        if !state.frozen {
            state.block += 1;
        }
        Ok(state.block)
    }

    async fn accounts(&self) -> Result<Vec<Address>, RpcError> {
        Ok(self.state.lock().unwrap().accounts.clone())
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nonces
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<U256, RpcError> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, RpcError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .storage
            .get(&(address, slot))
            .copied()
            .unwrap_or_default())
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, RpcError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let input = request.data.clone().unwrap_or_default();
        match state
            .simulate(request.from.unwrap_or_default(), request.to, &input)
            .map_err(Self::revert_error)?
        {
            Effect::Return(output) => Ok(output),
            _ => Ok(Bytes::new()),
        }
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, RpcError> {
        let state = self.state.lock().unwrap();
        let input = request.data.clone().unwrap_or_default();
        state
            .simulate(request.from.unwrap_or_default(), request.to, &input)
            .map_err(Self::revert_error)?;
        Ok(ESTIMATED_GAS)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, RpcError> {
        let (tx, from) = decode_signed(&raw)
            .ok_or_else(|| RpcError::Decode("invalid signed transaction".to_string()))?;
        if tx.chain_id != self.chain_id {
            return Err(RpcError::Response {
                code: -32000,
                message: "invalid chain id".to_string(),
                data: None,
            });
        }

        self.state.lock().unwrap().submit(SentTx {
            hash: keccak256(&raw),
            from,
            nonce: tx.nonce,
            to: tx.to.to().copied(),
            input: tx.input,
            gas_limit: tx.gas_limit,
        })
    }

    async fn send_transaction(&self, request: &CallRequest) -> Result<TxHash, RpcError> {
        let mut state = self.state.lock().unwrap();
        let from = request
            .from
            .filter(|from| state.accounts.contains(from))
            .ok_or_else(|| RpcError::Response {
                code: -32000,
                message: "unknown account".to_string(),
                data: None,
            })?;
        let nonce = match request.nonce {
            Some(nonce) => nonce.to::<u64>(),
            None => state.nonces.get(&from).copied().unwrap_or_default(),
        };

        let mut preimage = from.to_vec();
        preimage.extend_from_slice(&nonce.to_be_bytes());
        preimage.extend_from_slice(&(state.sent.len() as u64).to_be_bytes());

        state.submit(SentTx {
            hash: keccak256(&preimage),
            from,
            nonce,
            to: request.to,
            input: request.data.clone().unwrap_or_default(),
            gas_limit: request.gas.map(|gas| gas.to::<u64>()).unwrap_or(ESTIMATED_GAS),
        })
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, RpcError> {
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).cloned())
    }

    async fn transaction_known(&self, tx_hash: TxHash) -> Result<bool, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state.receipts.contains_key(&tx_hash)
            || state.stalled.iter().any(|tx| tx.hash == tx_hash))
    }
}
