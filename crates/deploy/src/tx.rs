//! Transaction construction and local signing.

use alloy_consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy_core::primitives::{Address, Bytes, TxKind, U256};
use alloy_eips::eip2718::Encodable2718;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;

use crate::error::DeployError;

/// What a step wants sent, before nonce and fees are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    /// `None` creates a contract.
    pub to: Option<Address>,
    pub input: Bytes,
    pub gas_limit: Option<u64>,
}

impl TxRequest {
    pub fn create(input: Bytes) -> Self {
        Self {
            to: None,
            input,
            gas_limit: None,
        }
    }

    pub fn call(to: Address, input: Bytes) -> Self {
        Self {
            to: Some(to),
            input,
            gas_limit: None,
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: Option<u64>) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    /// Bind the request to a nonce and fee caps, producing an unsigned dynamic fee transaction.
    pub fn into_eip1559(
        self,
        chain_id: u64,
        nonce: u64,
        gas_limit: u64,
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    ) -> TxEip1559 {
        TxEip1559 {
            chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas: max_fee_per_gas.saturating_to(),
            max_priority_fee_per_gas: max_priority_fee_per_gas.saturating_to(),
            to: self.to.map_or(TxKind::Create, TxKind::Call),
            value: U256::ZERO,
            input: self.input,
            ..Default::default()
        }
    }
}

/// Sign `tx` with a local key and return its EIP-2718 network encoding, ready for
/// `eth_sendRawTransaction`.
pub fn sign_eip1559(tx: TxEip1559, signer: &PrivateKeySigner) -> Result<Bytes, DeployError> {
    let signature = signer
        .sign_hash_sync(&tx.signature_hash())
        .map_err(|e| DeployError::Signer(e.to_string()))?;
    let envelope = TxEnvelope::from(tx.into_signed(signature));
    Ok(envelope.encoded_2718().into())
}

/// Decode a signed dynamic fee transaction and recover its sender.
#[cfg(test)]
pub(crate) fn decode_signed(raw: &[u8]) -> Option<(TxEip1559, Address)> {
    use alloy_eips::eip2718::Decodable2718;

    let envelope = TxEnvelope::decode_2718(&mut &raw[..]).ok()?;
    let signed = envelope.as_eip1559()?;
    let sender = signed
        .signature()
        .recover_address_from_prehash(&signed.signature_hash())
        .ok()?;
    Some((signed.tx().clone(), sender))
}
