use crate::error::{Error, Result};
use ethers::types::U256;
use serde::Deserialize;

/// A numeric field as callers and services hand it to us.
///
/// Everything is converted to `U256` by [`Quantity::normalize`] at the
/// resolver boundary; the rest of the pipeline only sees `U256`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "WireQuantity")]
pub enum Quantity {
    Number(u64),
    Text(String),
    Big(U256),
}

/// What a JSON service can actually send: a number or a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireQuantity {
    Number(u64),
    Text(String),
}

impl From<WireQuantity> for Quantity {
    fn from(w: WireQuantity) -> Self {
        match w {
            WireQuantity::Number(n) => Quantity::Number(n),
            WireQuantity::Text(s) => Quantity::Text(s),
        }
    }
}

impl Quantity {
    /// Converts to `U256`.
    ///
    /// Returns `Ok(None)` for the `"0x"` sentinel, which marks a field that is
    /// present but not yet set.
    pub fn normalize(&self, field: &'static str) -> Result<Option<U256>> {
        match self {
            Quantity::Number(n) => Ok(Some(U256::from(*n))),
            Quantity::Big(v) => Ok(Some(*v)),
            Quantity::Text(s) => parse_text(s.trim(), field),
        }
    }
}

fn parse_text(s: &str, field: &'static str) -> Result<Option<U256>> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        if hex.is_empty() {
            return Ok(None);
        }
        return U256::from_str_radix(hex, 16)
            .map(Some)
            .map_err(|e| Error::invalid(field, format!("`{s}` is not a hex quantity: {e}")));
    }
    if s.is_empty() {
        return Err(Error::invalid(field, "empty quantity"));
    }
    U256::from_dec_str(s)
        .map(Some)
        .map_err(|e| Error::invalid(field, format!("`{s}` is not a decimal quantity: {e}")))
}

impl From<U256> for Quantity {
    fn from(v: U256) -> Self {
        Quantity::Big(v)
    }
}

impl From<u64> for Quantity {
    fn from(v: u64) -> Self {
        Quantity::Number(v)
    }
}

impl From<u32> for Quantity {
    fn from(v: u32) -> Self {
        Quantity::Number(v.into())
    }
}

impl From<&str> for Quantity {
    fn from(v: &str) -> Self {
        Quantity::Text(v.to_string())
    }
}

impl From<String> for Quantity {
    fn from(v: String) -> Self {
        Quantity::Text(v)
    }
}
