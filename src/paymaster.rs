use crate::encoding::{self, deep_hexlify, parse_bytes, user_op_to_json};
use crate::error::{Error, Result};
use crate::resolver::Paymaster;
use crate::rpc::{RpcClient, Transport};
use crate::types::UserOperation;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde_json::Value;
use std::sync::Arc;

/// ERC-7677 paymaster web service client.
///
/// `pm_getPaymasterStubData` / `pm_getPaymasterData` keep the client
/// vendor-portable; `pm_sponsorUserOperation` and `pm_getPaymasterType` cover
/// services that predate ERC-7677.
#[derive(Debug, Clone)]
pub struct PaymasterClient {
    rpc: RpcClient,
    policy_id: Option<String>,
    webhook_data: Option<String>,
}

impl PaymasterClient {
    pub fn new(url: String) -> Self {
        Self::from_rpc(RpcClient::new(url))
    }

    pub fn with_transport(url: String, transport: Arc<dyn Transport>) -> Self {
        Self::from_rpc(RpcClient::with_transport(url, transport))
    }

    pub fn from_rpc(rpc: RpcClient) -> Self {
        Self {
            rpc,
            policy_id: None,
            webhook_data: None,
        }
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    pub fn with_webhook_data(mut self, webhook_data: impl Into<String>) -> Self {
        self.webhook_data = Some(webhook_data.into());
        self
    }

    pub fn url(&self) -> &str {
        self.rpc.url()
    }

    pub async fn get_paymaster_stub_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Bytes> {
        let params = self.erc7677_params(op, entry_point, chain_id);
        let res = self.rpc.request("pm_getPaymasterStubData", params).await?;
        parse_v06_paymaster_and_data(&res)
    }

    pub async fn get_paymaster_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Bytes> {
        let params = self.erc7677_params(op, entry_point, chain_id);
        let res = self.rpc.request("pm_getPaymasterData", params).await?;
        parse_v06_paymaster_and_data(&res)
    }

    /// Single-shot sponsorship: `[userOp, entryPoint, context]`.
    pub async fn sponsor_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<Bytes> {
        let params = serde_json::json!([
            deep_hexlify(user_op_to_json(op)),
            encoding::fmt_address(entry_point),
            self.context(),
        ]);
        let res = self.rpc.request("pm_sponsorUserOperation", params).await?;
        parse_v06_paymaster_and_data(&res)
    }

    pub async fn get_paymaster_type(&self) -> Result<String> {
        let res = self
            .rpc
            .request("pm_getPaymasterType", serde_json::json!([self.context()]))
            .await?;
        match res {
            Value::String(s) => Ok(s),
            other => other
                .get("paymasterType")
                .or_else(|| other.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::invalid("paymasterType", format!("unexpected result shape: {other}"))
                }),
        }
    }

    fn context(&self) -> Value {
        let mut ctx = serde_json::Map::new();
        if let Some(policy) = &self.policy_id {
            ctx.insert("policyId".to_string(), Value::String(policy.clone()));
        }
        // context is free-form; Alchemy Gas Manager expects `webhookData`.
        if let Some(wd) = &self.webhook_data {
            ctx.insert("webhookData".to_string(), Value::String(wd.clone()));
        }
        Value::Object(ctx)
    }

    fn erc7677_params(&self, op: &UserOperation, entry_point: Address, chain_id: u64) -> Value {
        serde_json::json!([
            deep_hexlify(user_op_to_json(op)),
            encoding::fmt_address(entry_point),
            encoding::fmt_u256(U256::from(chain_id)),
            self.context(),
        ])
    }
}

#[async_trait]
impl Paymaster for PaymasterClient {
    async fn stub_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Bytes> {
        self.get_paymaster_stub_data(op, entry_point, chain_id).await
    }

    async fn final_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Bytes> {
        self.get_paymaster_data(op, entry_point, chain_id).await
    }
}

fn parse_v06_paymaster_and_data(result: &Value) -> Result<Bytes> {
    // ERC-7677 puts v0.6 data at the top level; Alchemy nests it under
    // `entrypointV06Response` next to a v0.7 sibling.
    let v06 = if result.get("paymasterAndData").is_some() {
        result
    } else {
        result
            .get("entrypointV06Response")
            .or_else(|| result.get("entryPointV06Response"))
            .ok_or(Error::MissingField("paymasterAndData"))?
    };

    let s = v06
        .get("paymasterAndData")
        .and_then(Value::as_str)
        .ok_or(Error::MissingField("paymasterAndData"))?;
    parse_bytes("paymasterAndData", s)
}
