use crate::chain::receipt_poll_interval;
use crate::encoding::{
    deep_hexlify, fmt_address, fmt_h256, parse_h256, parse_u256_quantity, user_op_to_json,
};
use crate::error::{Error, Result};
use crate::quantity::Quantity;
use crate::resolver::GasEstimator;
use crate::rpc::{RpcClient, Transport};
use crate::types::{GasEstimates, UserOperation, UserOperationHash, UserOperationReceipt};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

/// How often and for how long to ask the bundler for a receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// `Duration::ZERO` polls until a receipt arrives or the caller cancels.
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Uses the registry's interval for `chain_id`.
    pub fn for_chain(chain_id: u64) -> Self {
        Self::new(receipt_poll_interval(chain_id), DEFAULT_RECEIPT_TIMEOUT)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// ERC-4337 bundler JSON-RPC client bound to one EntryPoint.
///
/// Holds no mutable state, so one instance can serve concurrent dispatches.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    rpc: RpcClient,
    entry_point: Address,
}

impl BundlerClient {
    pub fn new(url: String, entry_point: Address) -> Self {
        Self::from_rpc(RpcClient::new(url), entry_point)
    }

    pub fn with_transport(
        url: String,
        entry_point: Address,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::from_rpc(RpcClient::with_transport(url, transport), entry_point)
    }

    pub fn from_rpc(rpc: RpcClient, entry_point: Address) -> Self {
        Self { rpc, entry_point }
    }

    pub fn url(&self) -> &str {
        self.rpc.url()
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub async fn send_user_operation(&self, op: &UserOperation) -> Result<UserOperationHash> {
        let params = serde_json::json!([
            deep_hexlify(user_op_to_json(op)),
            fmt_address(self.entry_point)
        ]);
        let res = self.rpc.request("eth_sendUserOperation", params).await?;
        let hash = parse_userop_hash(&res)?;
        tracing::info!(user_op_hash = %hash, sender = ?op.sender, "user operation submitted");
        Ok(hash)
    }

    /// Gas limits for `op` against this client's EntryPoint.
    pub async fn estimate_gas(&self, op: &UserOperation) -> Result<GasEstimates> {
        GasEstimator::estimate_user_operation_gas(self, op, self.entry_point).await
    }

    /// `None` while the bundler has not seen the operation land.
    pub async fn get_user_operation_receipt(
        &self,
        hash: UserOperationHash,
    ) -> Result<Option<UserOperationReceipt>> {
        let res = self
            .rpc
            .request("eth_getUserOperationReceipt", serde_json::json!([fmt_h256(hash.0)]))
            .await?;
        if res.is_null() {
            return Ok(None);
        }
        serde_json::from_value(res)
            .map(Some)
            .map_err(|e| Error::invalid("receipt", e))
    }

    pub async fn get_user_operation_by_hash(
        &self,
        hash: UserOperationHash,
    ) -> Result<Option<Value>> {
        let res = self
            .rpc
            .request("eth_getUserOperationByHash", serde_json::json!([fmt_h256(hash.0)]))
            .await?;
        Ok((!res.is_null()).then_some(res))
    }

    pub async fn supported_entry_points(&self) -> Result<Vec<Address>> {
        let res = self
            .rpc
            .request("eth_supportedEntryPoints", serde_json::json!([]))
            .await?;
        serde_json::from_value(res).map_err(|e| Error::invalid("entryPoint", e))
    }

    pub async fn chain_id(&self) -> Result<u64> {
        let res = self.rpc.request("eth_chainId", serde_json::json!([])).await?;
        let id = match res.as_str() {
            Some(s) => parse_u256_quantity(s)?,
            None => quantity(&res, "chainId")?,
        };
        if id > U256::from(u64::MAX) {
            return Err(Error::invalid("chainId", format!("{id} does not fit in u64")));
        }
        Ok(id.as_u64())
    }

    /// Polls `eth_getUserOperationReceipt` every `poll.interval`.
    ///
    /// Ends with the receipt, [`Error::Timeout`] once `poll.timeout` elapses,
    /// [`Error::Cancelled`] when `cancel` fires, or the first request error.
    /// The pending sleep is dropped on every exit path.
    pub async fn wait_for_receipt(
        &self,
        hash: UserOperationHash,
        poll: &PollConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<UserOperationReceipt> {
        let started = tokio::time::Instant::now();
        let polling = self.poll_receipt(hash, poll.interval);

        let bounded = async {
            if poll.timeout.is_zero() {
                Ok(polling.await)
            } else {
                tokio::time::timeout(poll.timeout, polling).await
            }
        };

        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled(hash.0)),
                out = bounded => out,
            },
            None => bounded.await,
        };

        outcome.unwrap_or_else(|_| {
            Err(Error::Timeout {
                hash: hash.0,
                elapsed: started.elapsed(),
            })
        })
    }

    async fn poll_receipt(
        &self,
        hash: UserOperationHash,
        interval: Duration,
    ) -> Result<UserOperationReceipt> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if let Some(receipt) = self.get_user_operation_receipt(hash).await? {
                tracing::debug!(user_op_hash = %hash, attempt, "receipt found");
                return Ok(receipt);
            }
            tracing::debug!(user_op_hash = %hash, attempt, "receipt not available yet");
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl GasEstimator for BundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([
            deep_hexlify(user_op_to_json(op)),
            fmt_address(entry_point)
        ]);
        let res = self.rpc.request("eth_estimateUserOperationGas", params).await?;

        Ok(GasEstimates {
            call_gas_limit: quantity_field(&res, "callGasLimit")?,
            verification_gas_limit: quantity_field(&res, "verificationGasLimit")?,
            pre_verification_gas: quantity_field(&res, "preVerificationGas")?,
        })
    }
}

// Bundlers answer with hex strings, decimal strings or plain numbers.
fn quantity_field(v: &Value, key: &'static str) -> Result<U256> {
    let raw = v.get(key).ok_or(Error::MissingField(key))?;
    quantity(raw, key)
}

fn quantity(raw: &Value, field: &'static str) -> Result<U256> {
    let q: Quantity = serde_json::from_value(raw.clone()).map_err(|e| Error::invalid(field, e))?;
    Ok(q.normalize(field)?.unwrap_or_default())
}

fn parse_userop_hash(res: &Value) -> Result<UserOperationHash> {
    // Most bundlers return the hash as a bare string; some wrap it.
    let hash_str = res
        .as_str()
        .or_else(|| {
            ["result", "userOpHash", "userOperationHash"]
                .iter()
                .find_map(|k| res.get(*k).and_then(Value::as_str))
        })
        .ok_or_else(|| {
            Error::invalid(
                "userOpHash",
                format!("unexpected eth_sendUserOperation result shape: {res}"),
            )
        })?;

    parse_h256(hash_str).map(UserOperationHash)
}
