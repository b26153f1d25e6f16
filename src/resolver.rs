use crate::account::SmartAccount;
use crate::chain::{ensure_consistent, try_chain_id_from_url, ChainSource};
use crate::error::{Error, Result};
use crate::fees::FeeOracle;
use crate::quantity::Quantity;
use crate::types::{GasEstimates, PartialUserOperation, UserOperation};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait GasEstimator: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimates>;
}

/// Source of `paymasterAndData` (ERC-7677 stub then final data).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Paymaster: Send + Sync {
    async fn stub_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Bytes>;

    async fn final_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Bytes>;
}

/// Turns a [`PartialUserOperation`] into a [`UserOperation`].
///
/// Gas limits and fees come from the caller or from a collaborator; the
/// resolver never makes them up.
pub struct FieldResolver {
    account: Arc<dyn SmartAccount>,
    entry_point: Address,
    chain_id: u64,
    gas: Option<Arc<dyn GasEstimator>>,
    fees: Option<Arc<dyn FeeOracle>>,
    paymaster: Option<Arc<dyn Paymaster>>,
    chain_sources: Vec<(ChainSource, Option<u64>)>,
}

impl FieldResolver {
    pub fn new(account: Arc<dyn SmartAccount>, entry_point: Address, chain_id: u64) -> Self {
        Self {
            account,
            entry_point,
            chain_id,
            gas: None,
            fees: None,
            paymaster: None,
            chain_sources: vec![(ChainSource::Config, Some(chain_id))],
        }
    }

    pub fn with_gas_estimator(mut self, gas: Arc<dyn GasEstimator>) -> Self {
        self.gas = Some(gas);
        self
    }

    pub fn with_fee_oracle(mut self, fees: Arc<dyn FeeOracle>) -> Self {
        self.fees = Some(fees);
        self
    }

    pub fn with_paymaster(mut self, paymaster: Arc<dyn Paymaster>) -> Self {
        self.paymaster = Some(paymaster);
        self
    }

    /// Registers the chain ids derivable from the services and the signer.
    ///
    /// URLs that do not embed a chain id are skipped; URLs that do not parse
    /// are rejected here.
    pub fn with_chain_check(
        mut self,
        bundler_url: Option<&str>,
        paymaster_url: Option<&str>,
        signer_chain_id: Option<u64>,
    ) -> Result<Self> {
        let bundler = bundler_url.map(try_chain_id_from_url).transpose()?.flatten();
        let paymaster = paymaster_url.map(try_chain_id_from_url).transpose()?.flatten();
        self.chain_sources.extend([
            (ChainSource::Signer, signer_chain_id),
            (ChainSource::BundlerUrl, bundler),
            (ChainSource::PaymasterUrl, paymaster),
        ]);
        ensure_consistent(&self.chain_sources)?;
        Ok(self)
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn resolve(&self, partial: PartialUserOperation) -> Result<UserOperation> {
        ensure_consistent(&self.chain_sources)?;

        let PartialUserOperation {
            sender,
            nonce,
            init_code,
            call_data,
            call_gas_limit,
            verification_gas_limit,
            pre_verification_gas,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            paymaster_and_data,
            signature,
        } = partial;

        // Any rejected deferred field fails the whole resolution.
        let (
            sender,
            nonce,
            init_code,
            call_data,
            call_gas_limit,
            verification_gas_limit,
            pre_verification_gas,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            paymaster_and_data,
            signature,
        ) = futures::try_join!(
            sender.settle("sender"),
            nonce.settle("nonce"),
            init_code.settle("initCode"),
            call_data.settle("callData"),
            call_gas_limit.settle("callGasLimit"),
            verification_gas_limit.settle("verificationGasLimit"),
            pre_verification_gas.settle("preVerificationGas"),
            max_fee_per_gas.settle("maxFeePerGas"),
            max_priority_fee_per_gas.settle("maxPriorityFeePerGas"),
            paymaster_and_data.settle("paymasterAndData"),
            signature.settle("signature"),
        )?;

        let call_data = call_data.ok_or(Error::MissingField("callData"))?;
        let account_address = self.account.address();
        let sender = match sender {
            Some(s) if s != account_address => {
                return Err(Error::invalid(
                    "sender",
                    format!("{s:?} is not the configured account {account_address:?}"),
                ))
            }
            _ => account_address,
        };

        let nonce = Slot::new(nonce, "nonce")?;
        let call_gas_limit = Slot::new(call_gas_limit, "callGasLimit")?;
        let verification_gas_limit = Slot::new(verification_gas_limit, "verificationGasLimit")?;
        let pre_verification_gas = Slot::new(pre_verification_gas, "preVerificationGas")?;
        let max_fee_per_gas = Slot::new(max_fee_per_gas, "maxFeePerGas")?;
        let max_priority_fee_per_gas =
            Slot::new(max_priority_fee_per_gas, "maxPriorityFeePerGas")?;

        // Without a collaborator only caller values (or the `0x` sentinel) can fill these.
        if self.gas.is_none() {
            call_gas_limit.settled("callGasLimit")?;
            verification_gas_limit.settled("verificationGasLimit")?;
            pre_verification_gas.settled("preVerificationGas")?;
        }
        if self.fees.is_none() {
            max_fee_per_gas.settled("maxFeePerGas")?;
            max_priority_fee_per_gas.settled("maxPriorityFeePerGas")?;
        }

        let nonce_lookup = async {
            match nonce.value() {
                Some(n) => Ok(n),
                None => self
                    .account
                    .nonce()
                    .await
                    .map_err(Error::resolving("nonce")),
            }
        };
        let init_code_lookup = async {
            match init_code {
                Some(code) => Ok(code),
                None => match self.account.is_deployed().await {
                    Ok(true) => Ok(Bytes::default()),
                    Ok(false) => self.account.init_code(),
                    Err(e) => Err(e),
                }
                .map_err(Error::resolving("initCode")),
            }
        };
        let fee_lookup = async {
            match (&self.fees, max_fee_per_gas.value(), max_priority_fee_per_gas.value()) {
                (_, Some(_), Some(_)) | (None, _, _) => Ok(None),
                (Some(oracle), _, _) => oracle
                    .fee_data()
                    .await
                    .map(Some)
                    .map_err(Error::resolving("maxFeePerGas")),
            }
        };
        let (nonce, init_code, fees) =
            futures::try_join!(nonce_lookup, init_code_lookup, fee_lookup)?;

        let call_gas_limit = call_gas_limit.value();
        let verification_gas_limit = verification_gas_limit.value();
        let pre_verification_gas = pre_verification_gas.value();

        let mut op = UserOperation {
            sender,
            nonce,
            init_code,
            call_data,
            call_gas_limit: call_gas_limit.unwrap_or_default(),
            verification_gas_limit: verification_gas_limit.unwrap_or_default(),
            pre_verification_gas: pre_verification_gas.unwrap_or_default(),
            max_fee_per_gas: max_fee_per_gas
                .value()
                .or(fees.map(|f| f.max_fee_per_gas))
                .unwrap_or_default(),
            max_priority_fee_per_gas: max_priority_fee_per_gas
                .value()
                .or(fees.map(|f| f.max_priority_fee_per_gas))
                .unwrap_or_default(),
            paymaster_and_data: paymaster_and_data.clone().unwrap_or_default(),
            signature: signature.unwrap_or_else(|| self.account.dummy_signature()),
        };

        let sponsor = match (&self.paymaster, &paymaster_and_data) {
            (Some(pm), None) => Some(pm),
            _ => None,
        };

        if let Some(pm) = sponsor {
            op.paymaster_and_data = pm
                .stub_data(&op, self.entry_point, self.chain_id)
                .await
                .map_err(Error::resolving("paymasterAndData"))?;
        }

        let gas_missing = call_gas_limit.is_none()
            || verification_gas_limit.is_none()
            || pre_verification_gas.is_none();
        if let (true, Some(gas)) = (gas_missing, &self.gas) {
            let est = gas
                .estimate_user_operation_gas(&op, self.entry_point)
                .await
                .map_err(Error::resolving("gas limits"))?;
            if call_gas_limit.is_none() {
                op.call_gas_limit = est.call_gas_limit;
            }
            if verification_gas_limit.is_none() {
                op.verification_gas_limit = est.verification_gas_limit;
            }
            if pre_verification_gas.is_none() {
                op.pre_verification_gas = est.pre_verification_gas;
            }
        }

        if let Some(pm) = sponsor {
            op.paymaster_and_data = pm
                .final_data(&op, self.entry_point, self.chain_id)
                .await
                .map_err(Error::resolving("paymasterAndData"))?;
        }

        tracing::debug!(
            sender = ?op.sender,
            nonce = %op.nonce,
            deploying = !op.init_code.is_empty(),
            sponsored = !op.paymaster_and_data.is_empty(),
            "user operation resolved"
        );
        Ok(op)
    }
}

/// A numeric field after normalization.
#[derive(Clone, Copy, Debug)]
enum Slot {
    /// Not supplied at all.
    Unset,
    /// Supplied as the bare `0x` sentinel.
    Empty,
    Value(U256),
}

impl Slot {
    fn new(q: Option<Quantity>, field: &'static str) -> Result<Self> {
        Ok(match q {
            None => Slot::Unset,
            Some(q) => q.normalize(field)?.map_or(Slot::Empty, Slot::Value),
        })
    }

    fn value(self) -> Option<U256> {
        match self {
            Slot::Value(v) => Some(v),
            Slot::Unset | Slot::Empty => None,
        }
    }

    /// Fails for a field nobody supplied.
    fn settled(self, field: &'static str) -> Result<()> {
        match self {
            Slot::Unset => Err(Error::MissingField(field)),
            Slot::Empty | Slot::Value(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MockSmartAccount;
    use crate::error::ErrorKind;
    use crate::fees::MockFeeOracle;
    use crate::types::{FeeData, Field};
    use mockall::predicate::eq;

    const CHAIN: u64 = 80_001;

    fn entry_point() -> Address {
        "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap()
    }

    fn account(nonce_calls: usize, deployed: bool) -> MockSmartAccount {
        let mut account = MockSmartAccount::new();
        account
            .expect_address()
            .return_const(Address::repeat_byte(0xaa));
        account
            .expect_nonce()
            .times(nonce_calls)
            .returning(|| Ok(U256::from(9u64)));
        account.expect_is_deployed().returning(move || Ok(deployed));
        account
            .expect_init_code()
            .returning(|| Ok(Bytes::from(vec![0xfa; 24])));
        account
            .expect_dummy_signature()
            .returning(|| Bytes::from(vec![0u8; 65]));
        account
    }

    fn gas_limits(partial: PartialUserOperation) -> PartialUserOperation {
        partial
            .call_gas_limit(50_000u64)
            .verification_gas_limit("0x186a0")
            .pre_verification_gas("21000")
            .max_fee_per_gas(1_000u64)
            .max_priority_fee_per_gas(U256::from(100u64))
    }

    #[tokio::test]
    async fn given_nonce_skips_the_lookup() {
        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN);
        let partial = gas_limits(PartialUserOperation::new())
            .nonce(5u64)
            .call_data(Bytes::from(vec![1]));
        let op = resolver.resolve(partial).await.unwrap();
        assert_eq!(op.nonce, U256::from(5u64));
        assert_eq!(op.sender, Address::repeat_byte(0xaa));
        assert!(op.init_code.is_empty());
        assert_eq!(op.verification_gas_limit, U256::from(100_000u64));
        assert_eq!(op.pre_verification_gas, U256::from(21_000u64));
        assert_eq!(op.signature.len(), 65);
    }

    #[tokio::test]
    async fn missing_nonce_is_fetched_exactly_once() {
        let resolver = FieldResolver::new(Arc::new(account(1, true)), entry_point(), CHAIN);
        let partial = gas_limits(PartialUserOperation::new()).call_data(Bytes::from(vec![1]));
        let op = resolver.resolve(partial).await.unwrap();
        assert_eq!(op.nonce, U256::from(9u64));
    }

    #[tokio::test]
    async fn bare_prefix_nonce_counts_as_unset() {
        let resolver = FieldResolver::new(Arc::new(account(1, true)), entry_point(), CHAIN);
        let partial = gas_limits(PartialUserOperation::new())
            .nonce("0x")
            .call_data(Bytes::default());
        assert_eq!(resolver.resolve(partial).await.unwrap().nonce, 9u64.into());
    }

    #[tokio::test]
    async fn undeployed_account_gets_init_code() {
        let resolver = FieldResolver::new(Arc::new(account(0, false)), entry_point(), CHAIN);
        let partial = gas_limits(PartialUserOperation::new())
            .nonce(0u64)
            .call_data(Bytes::default());
        let op = resolver.resolve(partial).await.unwrap();
        assert_eq!(op.init_code, Bytes::from(vec![0xfa; 24]));
    }

    #[tokio::test]
    async fn deferred_fields_are_awaited() {
        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN);
        let mut partial = gas_limits(PartialUserOperation::new()).call_data(Bytes::default());
        partial.nonce = Field::deferred(async { Ok(Quantity::from("0x2a")) });
        partial.call_gas_limit = Field::deferred(async { Ok(Quantity::from(77u64)) });
        let op = resolver.resolve(partial).await.unwrap();
        assert_eq!(op.nonce, U256::from(42u64));
        assert_eq!(op.call_gas_limit, U256::from(77u64));
    }

    #[tokio::test]
    async fn a_rejected_deferred_field_fails_resolution() {
        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN);
        let mut partial = gas_limits(PartialUserOperation::new()).call_data(Bytes::default());
        partial.nonce = Field::deferred(async { Ok(Quantity::from(1u64)) });
        partial.paymaster_and_data =
            Field::deferred(async { Err(Error::Transport("connection reset".into())) });
        let err = resolver.resolve(partial).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution {
                field: "paymasterAndData",
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn nonce_fetch_failure_is_propagated() {
        let mut account = MockSmartAccount::new();
        account.expect_address().return_const(Address::zero());
        account.expect_is_deployed().returning(|| Ok(true));
        account
            .expect_nonce()
            .times(1)
            .returning(|| Err(Error::Account("rpc down".into())));
        let resolver = FieldResolver::new(Arc::new(account), entry_point(), CHAIN);
        let partial = gas_limits(PartialUserOperation::new()).call_data(Bytes::default());
        let err = resolver.resolve(partial).await.unwrap_err();
        assert!(matches!(err, Error::Resolution { field: "nonce", .. }));
        assert_eq!(err.kind(), ErrorKind::Collaborator);
    }

    #[tokio::test]
    async fn missing_call_data_is_a_validation_error() {
        let resolver = FieldResolver::new(Arc::new(MockSmartAccount::new()), entry_point(), CHAIN);
        let err = resolver
            .resolve(PartialUserOperation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingField("callData")));
    }

    #[tokio::test]
    async fn only_unset_gas_fields_come_from_the_estimator() {
        let mut gas = MockGasEstimator::new();
        gas.expect_estimate_user_operation_gas()
            .with(mockall::predicate::always(), eq(entry_point()))
            .times(1)
            .returning(|_, _| {
                Ok(GasEstimates {
                    call_gas_limit: 1u64.into(),
                    verification_gas_limit: 2u64.into(),
                    pre_verification_gas: 3u64.into(),
                })
            });
        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN)
            .with_gas_estimator(Arc::new(gas));

        let partial = PartialUserOperation::new()
            .nonce(1u64)
            .call_data(Bytes::default())
            .call_gas_limit(500u64)
            .max_fee_per_gas(1u64)
            .max_priority_fee_per_gas(1u64);
        let op = resolver.resolve(partial).await.unwrap();
        assert_eq!(op.call_gas_limit, U256::from(500u64));
        assert_eq!(op.verification_gas_limit, U256::from(2u64));
        assert_eq!(op.pre_verification_gas, U256::from(3u64));
    }

    #[tokio::test]
    async fn estimator_is_skipped_when_all_limits_are_given() {
        let mut gas = MockGasEstimator::new();
        gas.expect_estimate_user_operation_gas().times(0);
        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN)
            .with_gas_estimator(Arc::new(gas));
        let partial = gas_limits(PartialUserOperation::new())
            .nonce(1u64)
            .call_data(Bytes::default());
        resolver.resolve(partial).await.unwrap();
    }

    #[tokio::test]
    async fn fees_come_from_the_oracle_when_unset() {
        let mut fees = MockFeeOracle::new();
        fees.expect_fee_data().times(1).returning(|| {
            Ok(FeeData {
                max_fee_per_gas: 30u64.into(),
                max_priority_fee_per_gas: 2u64.into(),
            })
        });
        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN)
            .with_fee_oracle(Arc::new(fees));
        let partial = PartialUserOperation::new()
            .nonce(1u64)
            .call_data(Bytes::default())
            .call_gas_limit(1u64)
            .verification_gas_limit(1u64)
            .pre_verification_gas(1u64)
            .max_priority_fee_per_gas(5u64);
        let op = resolver.resolve(partial).await.unwrap();
        assert_eq!(op.max_fee_per_gas, U256::from(30u64));
        assert_eq!(op.max_priority_fee_per_gas, U256::from(5u64));
    }

    #[tokio::test]
    async fn paymaster_stub_precedes_estimation_and_final_data_follows() {
        let mut seq = mockall::Sequence::new();
        let mut pm = MockPaymaster::new();
        let mut gas = MockGasEstimator::new();

        pm.expect_stub_data()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(Bytes::from(vec![0x01])));
        gas.expect_estimate_user_operation_gas()
            .withf(|op, _| op.paymaster_and_data == Bytes::from(vec![0x01]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(GasEstimates {
                    call_gas_limit: 10u64.into(),
                    verification_gas_limit: 20u64.into(),
                    pre_verification_gas: 30u64.into(),
                })
            });
        pm.expect_final_data()
            .withf(|op, _, chain| op.call_gas_limit == 10u64.into() && *chain == CHAIN)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(Bytes::from(vec![0x02])));

        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN)
            .with_gas_estimator(Arc::new(gas))
            .with_paymaster(Arc::new(pm));
        let partial = PartialUserOperation::new()
            .nonce(3u64)
            .call_data(Bytes::default())
            .max_fee_per_gas(1u64)
            .max_priority_fee_per_gas(1u64);
        let op = resolver.resolve(partial).await.unwrap();
        assert_eq!(op.paymaster_and_data, Bytes::from(vec![0x02]));
    }

    #[tokio::test]
    async fn caller_paymaster_data_is_kept() {
        let mut pm = MockPaymaster::new();
        pm.expect_stub_data().times(0);
        pm.expect_final_data().times(0);
        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN)
            .with_paymaster(Arc::new(pm));
        let partial = gas_limits(PartialUserOperation::new())
            .nonce(3u64)
            .call_data(Bytes::default())
            .paymaster_and_data(Bytes::from(vec![0x09]));
        let op = resolver.resolve(partial).await.unwrap();
        assert_eq!(op.paymaster_and_data, Bytes::from(vec![0x09]));
    }

    #[tokio::test]
    async fn unset_gas_limit_without_estimator_is_missing() {
        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN);
        let partial = PartialUserOperation::new()
            .nonce(1u64)
            .call_data(Bytes::default())
            .call_gas_limit(1u64)
            .pre_verification_gas(1u64)
            .max_fee_per_gas(1u64)
            .max_priority_fee_per_gas(1u64);
        let err = resolver.resolve(partial).await.unwrap_err();
        assert!(matches!(err, Error::MissingField("verificationGasLimit")));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn unset_fee_without_oracle_is_missing() {
        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN);
        let partial = PartialUserOperation::new()
            .nonce(1u64)
            .call_data(Bytes::default())
            .call_gas_limit(1u64)
            .verification_gas_limit(1u64)
            .pre_verification_gas(1u64)
            .max_priority_fee_per_gas(1u64);
        let err = resolver.resolve(partial).await.unwrap_err();
        assert!(matches!(err, Error::MissingField("maxFeePerGas")));
    }

    #[tokio::test]
    async fn bare_prefix_gas_without_estimator_becomes_zero() {
        let resolver = FieldResolver::new(Arc::new(account(0, true)), entry_point(), CHAIN);
        let partial = gas_limits(PartialUserOperation::new())
            .nonce(1u64)
            .call_data(Bytes::default())
            .call_gas_limit("0x")
            .max_fee_per_gas("0x");
        let op = resolver.resolve(partial).await.unwrap();
        assert_eq!(op.call_gas_limit, U256::zero());
        assert_eq!(op.max_fee_per_gas, U256::zero());
        assert_eq!(op.verification_gas_limit, U256::from(100_000u64));
    }

    #[tokio::test]
    async fn sender_other_than_the_account_is_rejected() {
        let resolver = FieldResolver::new(Arc::new(account(0, false)), entry_point(), CHAIN);
        let partial = gas_limits(PartialUserOperation::new())
            .sender(Address::repeat_byte(0xbb))
            .call_data(Bytes::default());
        let err = resolver.resolve(partial).await.unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "sender", .. }));
    }

    #[tokio::test]
    async fn sender_matching_the_account_is_accepted() {
        let resolver = FieldResolver::new(Arc::new(account(1, true)), entry_point(), CHAIN);
        let partial = gas_limits(PartialUserOperation::new())
            .sender(Address::repeat_byte(0xaa))
            .call_data(Bytes::default());
        let op = resolver.resolve(partial).await.unwrap();
        assert_eq!(op.sender, Address::repeat_byte(0xaa));
        assert_eq!(op.nonce, U256::from(9u64));
    }

    #[test]
    fn chain_check_rejects_disagreeing_services() {
        let result = FieldResolver::new(Arc::new(MockSmartAccount::new()), entry_point(), CHAIN)
            .with_chain_check(
                Some("https://bundler.example/api/v2/80001/abc123"),
                Some("https://paymaster.example/api/v2/137/abc123"),
                None,
            );
        let err = result.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Consistency);
    }

    #[test]
    fn chain_check_compares_against_configured_chain() {
        let result = FieldResolver::new(Arc::new(MockSmartAccount::new()), entry_point(), 1)
            .with_chain_check(Some("https://bundler.example/api/v2/80001/abc123"), None, None);
        assert!(matches!(
            result.err(),
            Some(Error::ChainIdMismatch {
                left: ChainSource::Config,
                ..
            })
        ));
    }
}
