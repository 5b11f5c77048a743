//! Calldata for revocation transactions
//!
//! Revoking an ERC-20 allowance is `approve(spender, 0)` sent from the owner to
//! the token contract.

use alloy_primitives::{keccak256, Address, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::delegation::ActionKind;
use crate::error::{Error, Result};
use crate::rules::ProposedAction;

const APPROVE_SIGNATURE: &str = "approve(address,uint256)";

/// An unsigned transaction handed to the authority provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIntent {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub max_fee_per_gas_wei: u128,
}

/// 4-byte selector of `approve(address,uint256)`
pub fn approve_selector() -> [u8; 4] {
    let hash = keccak256(APPROVE_SIGNATURE.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn approve_calldata(spender: &Address, amount: U256) -> Bytes {
    let mut data = Vec::with_capacity(4 + 32 + 32);
    data.extend_from_slice(&approve_selector());
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(spender.as_slice());
    data.extend_from_slice(&amount.to_be_bytes::<32>());
    Bytes::from(data)
}

/// Build the transaction for an action
pub fn encode_intent(action: &ProposedAction, max_fee_per_gas_wei: u128) -> Result<TxIntent> {
    match action.kind {
        ActionKind::Revoke | ActionKind::Cleanup => Ok(TxIntent {
            from: action.owner,
            to: action.token,
            data: approve_calldata(&action.spender, U256::ZERO),
            value: U256::ZERO,
            max_fee_per_gas_wei,
        }),
        ActionKind::Consolidate => Err(Error::InvariantViolation(format!(
            "no transaction encoding for {} of {}",
            action.kind, action.token
        ))),
    }
}
