use crate::bundler::PollConfig;
use crate::chain::{self, check_service_urls};
use crate::error::{Error, Result};
use crate::quantity::Quantity;
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

/// EntryPoint v0.6, same address on every chain.
pub const ENTRY_POINT_V06: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

/// eth-infinitism `SimpleAccountFactory` for EntryPoint v0.6.
pub const SIMPLE_ACCOUNT_FACTORY_V06: &str = "0x9406Cc6185a346906296840746125a0E44976454";

const ENV_PREFIX: &str = "USEROP_KIT_";

/// SDK settings as written in the JSON config file (camelCase keys).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SdkConfig {
    pub chain_id: u64,
    pub entry_point: String,
    pub factory: String,
    pub bundler_url: String,
    pub paymaster_url: Option<String>,
    /// Empty means the registry's default RPC for `chain_id`.
    pub rpc_url: String,
    pub policy_id: Option<String>,
    /// Decimal or `0x` hex.
    pub salt: String,
    pub receipt_poll_interval_ms: Option<u64>,
    /// `0` waits until a receipt arrives.
    pub receipt_timeout_secs: u64,
    pub gas_multiplier_bps: u64,
    pub log_level: Option<String>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            chain_id: 0,
            entry_point: ENTRY_POINT_V06.to_string(),
            factory: SIMPLE_ACCOUNT_FACTORY_V06.to_string(),
            bundler_url: String::new(),
            paymaster_url: None,
            rpc_url: String::new(),
            policy_id: None,
            salt: "0".to_string(),
            receipt_poll_interval_ms: None,
            receipt_timeout_secs: 120,
            gas_multiplier_bps: 10_000,
            log_level: None,
        }
    }
}

/// Parsed, cross-checked settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub chain_id: u64,
    pub entry_point: Address,
    pub factory: Address,
    pub bundler_url: String,
    pub paymaster_url: Option<String>,
    pub rpc_url: String,
    pub policy_id: Option<String>,
    pub salt: U256,
    pub poll: PollConfig,
    pub gas_multiplier_bps: u64,
}

impl SdkConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config_err = |reason: String| Error::Config {
            path: path.display().to_string(),
            reason,
        };
        let raw = fs::read_to_string(path).map_err(|e| config_err(format!("failed to read: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| config_err(format!("failed to parse: {e}")))
    }

    /// Overrides fields from `USEROP_KIT_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());

        if let Some(v) = var("CHAIN_ID") {
            self.chain_id = parse_env_u64("chainId", &v)?;
        }
        if let Some(v) = var("ENTRY_POINT") {
            self.entry_point = v;
        }
        if let Some(v) = var("FACTORY") {
            self.factory = v;
        }
        if let Some(v) = var("BUNDLER_URL") {
            self.bundler_url = v;
        }
        if let Some(v) = var("PAYMASTER_URL") {
            self.paymaster_url = Some(v);
        }
        if let Some(v) = var("RPC_URL") {
            self.rpc_url = v;
        }
        if let Some(v) = var("POLICY_ID") {
            self.policy_id = Some(v);
        }
        if let Some(v) = var("SALT") {
            self.salt = v;
        }
        if let Some(v) = var("RECEIPT_TIMEOUT_SECS") {
            self.receipt_timeout_secs = parse_env_u64("receiptTimeoutSecs", &v)?;
        }
        if let Some(v) = var("GAS_MULTIPLIER_BPS") {
            self.gas_multiplier_bps = parse_env_u64("gasMultiplierBps", &v)?;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<Settings> {
        if self.chain_id == 0 {
            return Err(Error::MissingField("chainId"));
        }
        if self.bundler_url.is_empty() {
            return Err(Error::MissingField("bundlerUrl"));
        }
        if self.gas_multiplier_bps == 0 {
            return Err(Error::invalid("gasMultiplierBps", "must be greater than zero"));
        }

        let entry_point = parse_address("entryPoint", &self.entry_point)?;
        let factory = parse_address("factory", &self.factory)?;
        let salt = Quantity::Text(self.salt.clone())
            .normalize("salt")?
            .unwrap_or_default();

        let paymaster_url = self.paymaster_url.clone().filter(|u| !u.is_empty());
        check_service_urls(
            &self.bundler_url,
            paymaster_url.as_deref(),
            None,
            Some(self.chain_id),
        )?;

        let rpc_url = if self.rpc_url.is_empty() {
            chain::chain_info(self.chain_id)
                .map(|c| c.rpc_url.to_string())
                .ok_or(Error::MissingField("rpcUrl"))?
        } else {
            self.rpc_url.clone()
        };

        let mut poll = PollConfig::for_chain(self.chain_id)
            .with_timeout(Duration::from_secs(self.receipt_timeout_secs));
        if let Some(ms) = self.receipt_poll_interval_ms {
            poll.interval = Duration::from_millis(ms.max(1));
        }

        Ok(Settings {
            chain_id: self.chain_id,
            entry_point,
            factory,
            bundler_url: self.bundler_url.clone(),
            paymaster_url,
            rpc_url,
            policy_id: self.policy_id.clone(),
            salt,
            poll,
            gas_multiplier_bps: self.gas_multiplier_bps,
        })
    }
}

fn parse_address(field: &'static str, s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| Error::invalid(field, e))
}

fn parse_env_u64(field: &'static str, s: &str) -> Result<u64> {
    s.trim().parse::<u64>().map_err(|e| Error::invalid(field, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    fn sample() -> SdkConfig {
        serde_json::from_value(serde_json::json!({
            "chainId": 80001,
            "bundlerUrl": "https://bundler.example/api/v2/80001/abc123",
            "paymasterUrl": "https://paymaster.example/api/v2/80001/abc123",
            "policyId": "policy-1",
            "salt": "0x2a",
            "receiptTimeoutSecs": 30,
        }))
        .unwrap()
    }

    #[test]
    fn defaults_fill_missing_keys() {
        let cfg = sample();
        assert_eq!(cfg.entry_point, ENTRY_POINT_V06);
        assert_eq!(cfg.gas_multiplier_bps, 10_000);

        let settings = cfg.validate().unwrap();
        assert_eq!(settings.salt, U256::from(42u64));
        assert_eq!(settings.rpc_url, "https://rpc-mumbai.maticvigil.com");
        assert_eq!(settings.poll.interval, Duration::from_millis(1500));
        assert_eq!(settings.poll.timeout, Duration::from_secs(30));
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("USEROP_KIT_RPC_URL", "http://127.0.0.1:8545"),
            ("USEROP_KIT_GAS_MULTIPLIER_BPS", "12500"),
            ("USEROP_KIT_POLICY_ID", ""),
        ]);
        let mut cfg = sample();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.rpc_url, "http://127.0.0.1:8545");
        assert_eq!(cfg.gas_multiplier_bps, 12_500);
        // empty variables do not clear file values
        assert_eq!(cfg.policy_id.as_deref(), Some("policy-1"));
    }

    #[test]
    fn bad_env_number_is_rejected() {
        let mut cfg = sample();
        let err = cfg
            .apply_env_from(|k| (k == "USEROP_KIT_CHAIN_ID").then(|| "polygon".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "chainId", .. }));
    }

    #[test]
    fn mismatched_paymaster_chain_fails_validation() {
        let mut cfg = sample();
        cfg.paymaster_url = Some("https://paymaster.example/api/v2/137/abc123".into());
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::Consistency);
    }

    #[test]
    fn missing_required_fields() {
        assert!(matches!(
            SdkConfig::default().validate(),
            Err(Error::MissingField("chainId"))
        ));
        let mut cfg = sample();
        cfg.gas_multiplier_bps = 0;
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn load_reports_path_on_failure() {
        let err = SdkConfig::load(Path::new("/nonexistent/userop-kit.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/userop-kit.json"));
    }
}
