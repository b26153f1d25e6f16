use crate::error::{Error, Result};
use crate::types::UserOperation;
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde_json::Value;

/// Encodes `op` in one of the two EntryPoint v0.6 layouts.
///
/// With `for_signature` the dynamic fields are replaced by their keccak256 and
/// the signature is left out; otherwise every byte field is embedded as-is.
pub fn encode_user_operation(op: &UserOperation, for_signature: bool) -> Bytes {
    if for_signature {
        pack_for_signature(op)
    } else {
        pack(op)
    }
}

/// `(address, uint256, bytes32, bytes32, uint256 x5, bytes32)`.
pub fn pack_for_signature(op: &UserOperation) -> Bytes {
    encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&op.init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::Uint(op.call_gas_limit),
        Token::Uint(op.verification_gas_limit),
        Token::Uint(op.pre_verification_gas),
        Token::Uint(op.max_fee_per_gas),
        Token::Uint(op.max_priority_fee_per_gas),
        Token::FixedBytes(keccak256(&op.paymaster_and_data).to_vec()),
    ])
    .into()
}

/// `(address, uint256, bytes, bytes, uint256 x5, bytes, bytes)`, the layout
/// relayed to the EntryPoint and used to price calldata.
pub fn pack(op: &UserOperation) -> Bytes {
    encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::Bytes(op.init_code.to_vec()),
        Token::Bytes(op.call_data.to_vec()),
        Token::Uint(op.call_gas_limit),
        Token::Uint(op.verification_gas_limit),
        Token::Uint(op.pre_verification_gas),
        Token::Uint(op.max_fee_per_gas),
        Token::Uint(op.max_priority_fee_per_gas),
        Token::Bytes(op.paymaster_and_data.to_vec()),
        Token::Bytes(op.signature.to_vec()),
    ])
    .into()
}

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

pub fn user_op_to_json(op: &UserOperation) -> Value {
    serde_json::json!({
        "sender": fmt_address(op.sender),
        "nonce": fmt_u256(op.nonce),
        "initCode": fmt_bytes(&op.init_code),
        "callData": fmt_bytes(&op.call_data),
        "callGasLimit": fmt_u256(op.call_gas_limit),
        "verificationGasLimit": fmt_u256(op.verification_gas_limit),
        "preVerificationGas": fmt_u256(op.pre_verification_gas),
        "maxFeePerGas": fmt_u256(op.max_fee_per_gas),
        "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas),
        "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
        "signature": fmt_bytes(&op.signature),
    })
}

/// Rewrites every non-negative integer leaf as a `0x` quantity string.
///
/// Strings, booleans, null, negative and fractional numbers are left alone,
/// so applying it twice gives the same value as applying it once.
pub fn deep_hexlify(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_u64() {
            Some(v) => Value::String(fmt_u256(U256::from(v))),
            None => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(deep_hexlify).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, deep_hexlify(v)))
                .collect(),
        ),
        other => other,
    }
}

pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(s, 16).map_err(|e| Error::invalid("quantity", e))
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| Error::invalid("hash", e))?;
    if bytes.len() != 32 {
        return Err(Error::invalid(
            "hash",
            format!("expected 32-byte hex, got {} bytes", bytes.len()),
        ));
    }
    Ok(H256::from_slice(&bytes))
}

pub fn parse_bytes(field: &'static str, s: &str) -> Result<Bytes> {
    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(hex_str)
        .map(Bytes::from)
        .map_err(|e| Error::invalid(field, format!("invalid hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gas_only_op() -> UserOperation {
        UserOperation {
            verification_gas_limit: 100_000u64.into(),
            pre_verification_gas: 21_000u64.into(),
            max_priority_fee_per_gas: 1_000_000_000u64.into(),
            ..Default::default()
        }
    }

    #[test]
    fn signature_layout_matches_known_vector() {
        let expected: Bytes = "0x00000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000186a000000000000000000000000000000000000000000000000000000000000052080000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000003b9aca00c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470".parse().unwrap();
        assert_eq!(pack_for_signature(&gas_only_op()), expected);
        assert_eq!(encode_user_operation(&gas_only_op(), true), expected);
    }

    #[test]
    fn signature_layout_ignores_signature() {
        let signed = gas_only_op().with_signature(Bytes::from(vec![7u8; 65]));
        assert_eq!(pack_for_signature(&signed), pack_for_signature(&gas_only_op()));
        assert_ne!(pack(&signed), pack(&gas_only_op()));
    }

    #[test]
    fn relay_layout_with_empty_bytes_is_well_formed() {
        let encoded = pack(&gas_only_op());
        // 11 head words plus one zero length word for each of the 4 byte fields.
        assert_eq!(encoded.len(), 15 * 32);

        let word = |i: usize| U256::from_big_endian(&encoded[i * 32..(i + 1) * 32]);
        assert_eq!(word(2), U256::from(0x160));
        assert_eq!(word(3), U256::from(0x180));
        assert_eq!(word(9), U256::from(0x1a0));
        assert_eq!(word(10), U256::from(0x1c0));
        for i in 11..15 {
            assert!(word(i).is_zero());
        }
        assert_eq!(encode_user_operation(&gas_only_op(), false), encoded);
    }

    #[test]
    fn relay_layout_embeds_raw_bytes() {
        let op = UserOperation {
            call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
            ..gas_only_op()
        };
        let encoded = pack(&op);
        // initCode tail is a single zero length word, so callData starts at word 12.
        assert_eq!(U256::from_big_endian(&encoded[12 * 32..13 * 32]), U256::from(4u64));
        assert_eq!(&encoded[13 * 32..13 * 32 + 4], &[0xb6, 0x1d, 0x27, 0xf6]);
        assert_eq!(encoded.len(), 16 * 32);
    }

    #[test]
    fn deep_hexlify_converts_numeric_leaves_only() {
        let input = json!({
            "a": 255,
            "b": "already a string",
            "c": [0, true, null, { "d": 16 }],
            "e": -1,
            "f": 1.5,
        });
        let out = deep_hexlify(input);
        assert_eq!(
            out,
            json!({
                "a": "0xff",
                "b": "already a string",
                "c": ["0x0", true, null, { "d": "0x10" }],
                "e": -1,
                "f": 1.5,
            })
        );
        assert_eq!(deep_hexlify(out.clone()), out);
    }

    #[test]
    fn user_op_json_formats_quantities() {
        let v = user_op_to_json(&gas_only_op());
        assert_eq!(v["nonce"], json!("0x0"));
        assert_eq!(v["verificationGasLimit"], json!("0x186a0"));
        assert_eq!(v["paymasterAndData"], json!("0x"));
    }

    #[test]
    fn parse_h256_rejects_wrong_length() {
        assert!(parse_h256("0x1234").is_err());
        assert!(parse_h256(&format!("0x{}", "11".repeat(32))).is_ok());
    }
}
