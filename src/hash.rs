use crate::encoding::pack_for_signature;
use crate::types::{UserOperation, UserOperationHash};
use ethers::abi::{encode, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;

/// `keccak256(abi.encode(keccak256(pack_for_signature(op)), entry_point, chain_id))`.
///
/// The signature never takes part, so the hash is stable across signing.
pub fn user_operation_hash(
    op: &UserOperation,
    entry_point: Address,
    chain_id: u64,
) -> UserOperationHash {
    let inner = keccak256(pack_for_signature(op));
    let outer = keccak256(encode(&[
        Token::FixedBytes(inner.to_vec()),
        Token::Address(entry_point),
        Token::Uint(U256::from(chain_id)),
    ]));
    H256(outer).into()
}

impl UserOperation {
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> UserOperationHash {
        user_operation_hash(self, entry_point, chain_id)
    }
}
