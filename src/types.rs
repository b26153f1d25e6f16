use crate::error::{Error, Result};
use crate::quantity::Quantity;
use ethers::types::{Address, Bytes, H256, U256};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout), fully resolved.
///
/// Every field holds a concrete value. Partially known operations are
/// represented by [`PartialUserOperation`] until the resolver finishes them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    pub fn with_signature(mut self, signature: Bytes) -> Self {
        self.signature = signature;
        self
    }
}

/// Protocol hash of a UserOperation; the correlation key for receipts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserOperationHash(pub H256);

impl UserOperationHash {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<H256> for UserOperationHash {
    fn from(value: H256) -> Self {
        Self(value)
    }
}

impl From<UserOperationHash> for H256 {
    fn from(value: UserOperationHash) -> Self {
        value.0
    }
}

impl fmt::Display for UserOperationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}

/// One call the smart account should execute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub to: Address,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub data: Bytes,
}

impl Call {
    pub fn new(to: Address, value: U256, data: Bytes) -> Self {
        Self { to, value, data }
    }
}

/// A single UserOperation field that may not be known yet.
pub enum Field<T> {
    Unset,
    Value(T),
    /// Still outstanding; awaited by the resolver together with the others.
    Deferred(BoxFuture<'static, Result<T>>),
}

impl<T> Field<T> {
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Field::Deferred(Box::pin(fut))
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Field::Unset)
    }

    /// Awaits a deferred value; `Unset` stays `None`.
    pub async fn settle(self, name: &'static str) -> Result<Option<T>> {
        match self {
            Field::Unset => Ok(None),
            Field::Value(v) => Ok(Some(v)),
            Field::Deferred(fut) => fut.await.map(Some).map_err(Error::resolving(name)),
        }
    }

    fn concrete(self, name: &'static str) -> Result<T> {
        match self {
            Field::Value(v) => Ok(v),
            Field::Unset | Field::Deferred(_) => Err(Error::MissingField(name)),
        }
    }
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Unset
    }
}

impl<T> From<T> for Field<T> {
    fn from(v: T) -> Self {
        Field::Value(v)
    }
}

impl<T: fmt::Debug> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Unset => f.write_str("Unset"),
            Field::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Field::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Caller-supplied subset of a UserOperation.
///
/// Numeric fields accept any [`Quantity`] form; the resolver turns them into
/// `U256`.
#[derive(Debug, Default)]
pub struct PartialUserOperation {
    pub sender: Field<Address>,
    pub nonce: Field<Quantity>,
    pub init_code: Field<Bytes>,
    pub call_data: Field<Bytes>,
    pub call_gas_limit: Field<Quantity>,
    pub verification_gas_limit: Field<Quantity>,
    pub pre_verification_gas: Field<Quantity>,
    pub max_fee_per_gas: Field<Quantity>,
    pub max_priority_fee_per_gas: Field<Quantity>,
    pub paymaster_and_data: Field<Bytes>,
    pub signature: Field<Bytes>,
}

impl PartialUserOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: Address) -> Self {
        self.sender = Field::Value(sender);
        self
    }

    pub fn nonce(mut self, nonce: impl Into<Quantity>) -> Self {
        self.nonce = Field::Value(nonce.into());
        self
    }

    pub fn init_code(mut self, init_code: Bytes) -> Self {
        self.init_code = Field::Value(init_code);
        self
    }

    pub fn call_data(mut self, call_data: Bytes) -> Self {
        self.call_data = Field::Value(call_data);
        self
    }

    pub fn call_gas_limit(mut self, v: impl Into<Quantity>) -> Self {
        self.call_gas_limit = Field::Value(v.into());
        self
    }

    pub fn verification_gas_limit(mut self, v: impl Into<Quantity>) -> Self {
        self.verification_gas_limit = Field::Value(v.into());
        self
    }

    pub fn pre_verification_gas(mut self, v: impl Into<Quantity>) -> Self {
        self.pre_verification_gas = Field::Value(v.into());
        self
    }

    pub fn max_fee_per_gas(mut self, v: impl Into<Quantity>) -> Self {
        self.max_fee_per_gas = Field::Value(v.into());
        self
    }

    pub fn max_priority_fee_per_gas(mut self, v: impl Into<Quantity>) -> Self {
        self.max_priority_fee_per_gas = Field::Value(v.into());
        self
    }

    pub fn paymaster_and_data(mut self, v: Bytes) -> Self {
        self.paymaster_and_data = Field::Value(v);
        self
    }

    pub fn signature(mut self, v: Bytes) -> Self {
        self.signature = Field::Value(v);
        self
    }

    /// Converts an operation whose fields are all concrete.
    ///
    /// Fails with [`Error::MissingField`] on the first field that is unset,
    /// still deferred, or holds the `"0x"` numeric sentinel. No collaborator
    /// is consulted; use the resolver for that.
    pub fn into_resolved(self) -> Result<UserOperation> {
        Ok(UserOperation {
            sender: self.sender.concrete("sender")?,
            nonce: quantity(self.nonce, "nonce")?,
            init_code: self.init_code.concrete("initCode")?,
            call_data: self.call_data.concrete("callData")?,
            call_gas_limit: quantity(self.call_gas_limit, "callGasLimit")?,
            verification_gas_limit: quantity(self.verification_gas_limit, "verificationGasLimit")?,
            pre_verification_gas: quantity(self.pre_verification_gas, "preVerificationGas")?,
            max_fee_per_gas: quantity(self.max_fee_per_gas, "maxFeePerGas")?,
            max_priority_fee_per_gas: quantity(
                self.max_priority_fee_per_gas,
                "maxPriorityFeePerGas",
            )?,
            paymaster_and_data: self.paymaster_and_data.concrete("paymasterAndData")?,
            signature: self.signature.concrete("signature")?,
        })
    }
}

fn quantity(field: Field<Quantity>, name: &'static str) -> Result<U256> {
    field
        .concrete(name)?
        .normalize(name)?
        .ok_or(Error::MissingField(name))
}

impl From<UserOperation> for PartialUserOperation {
    fn from(op: UserOperation) -> Self {
        Self {
            sender: op.sender.into(),
            nonce: Quantity::from(op.nonce).into(),
            init_code: op.init_code.into(),
            call_data: op.call_data.into(),
            call_gas_limit: Quantity::from(op.call_gas_limit).into(),
            verification_gas_limit: Quantity::from(op.verification_gas_limit).into(),
            pre_verification_gas: Quantity::from(op.pre_verification_gas).into(),
            max_fee_per_gas: Quantity::from(op.max_fee_per_gas).into(),
            max_priority_fee_per_gas: Quantity::from(op.max_priority_fee_per_gas).into(),
            paymaster_and_data: op.paymaster_and_data.into(),
            signature: op.signature.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeeData {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Result of `eth_getUserOperationReceipt`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: UserOperationHash,
    #[serde(default)]
    pub entry_point: Option<Address>,
    #[serde(default)]
    pub sender: Option<Address>,
    #[serde(default)]
    pub nonce: Option<U256>,
    #[serde(default)]
    pub paymaster: Option<Address>,
    #[serde(default)]
    pub actual_gas_cost: Option<U256>,
    #[serde(default)]
    pub actual_gas_used: Option<U256>,
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub logs: Vec<serde_json::Value>,
    /// The bundle transaction receipt, kept raw since bundlers disagree on its shape.
    #[serde(default)]
    pub receipt: Option<serde_json::Value>,
}
