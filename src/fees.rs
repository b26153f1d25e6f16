use crate::error::{Error, Result};
use crate::types::FeeData;
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::U256;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;

/// Supplies `maxFeePerGas` / `maxPriorityFeePerGas` when the caller did not.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn fee_data(&self) -> Result<FeeData>;
}

/// Node gas price scaled by a basis-point multiplier (10_000 = 1x).
///
/// Works on providers without EIP-1559 helpers; both fee fields get the same value.
#[derive(Debug)]
pub struct ProviderFeeOracle<M> {
    client: Arc<M>,
    multiplier_bps: u64,
}

impl<M: Middleware + 'static> ProviderFeeOracle<M> {
    pub fn new(client: Arc<M>, multiplier_bps: u64) -> Self {
        Self {
            client,
            multiplier_bps: multiplier_bps.max(1),
        }
    }
}

pub fn apply_multiplier(gas_price: U256, multiplier_bps: u64) -> U256 {
    gas_price * U256::from(multiplier_bps.max(1)) / U256::from(10_000u64)
}

#[async_trait]
impl<M: Middleware + 'static> FeeOracle for ProviderFeeOracle<M> {
    async fn fee_data(&self) -> Result<FeeData> {
        let gas_price = self
            .client
            .get_gas_price()
            .await
            .map_err(|e| Error::Account(format!("failed to fetch gas price: {e}")))?;
        let fee = apply_multiplier(gas_price, self.multiplier_bps);

        if self.multiplier_bps != 10_000 {
            tracing::debug!(
                bps = self.multiplier_bps,
                %gas_price,
                max_fee_per_gas = %fee,
                "gas multiplier applied"
            );
        }

        Ok(FeeData {
            max_fee_per_gas: fee,
            max_priority_fee_per_gas: fee,
        })
    }
}
