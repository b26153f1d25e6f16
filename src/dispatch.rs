use crate::account::{encode_calls, SmartAccount};
use crate::bundler::{BundlerClient, PollConfig};
use crate::error::{Error, ErrorKind};
use crate::fees::FeeOracle;
use crate::paymaster::PaymasterClient;
use crate::resolver::{FieldResolver, Paymaster};
use crate::signer::UserOpSigner;
use crate::types::{
    Call, PartialUserOperation, UserOperation, UserOperationHash, UserOperationReceipt,
};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The step a dispatch was in when it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStage {
    Building,
    Resolving,
    Signing,
    Submitting,
    Polling,
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchStage::Building => "building",
            DispatchStage::Resolving => "resolving",
            DispatchStage::Signing => "signing",
            DispatchStage::Submitting => "submitting",
            DispatchStage::Polling => "polling",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Building,
    Resolved,
    Hashed,
    Signed,
    Submitted,
    Confirmed,
    /// Receipt reported `success: false`.
    Failed,
    /// No receipt yet; polling may be resumed with the same hash.
    TimedOut,
}

impl DispatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DispatchState::Confirmed | DispatchState::Failed)
    }
}

#[derive(Debug, Error)]
#[error("dispatch failed while {stage}: {source}")]
pub struct DispatchError {
    pub stage: DispatchStage,
    #[source]
    pub source: Error,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

fn at(stage: DispatchStage) -> impl FnOnce(Error) -> DispatchError {
    move |source| DispatchError { stage, source }
}

/// A resolved and signed operation that has not been relayed yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedUserOperation {
    pub op: UserOperation,
    pub hash: UserOperationHash,
}

pub struct DispatcherBuilder {
    account: Arc<dyn SmartAccount>,
    bundler: BundlerClient,
    chain_id: u64,
    signer: Option<Arc<dyn UserOpSigner>>,
    fees: Option<Arc<dyn FeeOracle>>,
    paymaster: Option<Arc<dyn Paymaster>>,
    paymaster_url: Option<String>,
    poll: Option<PollConfig>,
}

impl DispatcherBuilder {
    pub fn signer(mut self, signer: Arc<dyn UserOpSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn fee_oracle(mut self, fees: Arc<dyn FeeOracle>) -> Self {
        self.fees = Some(fees);
        self
    }

    /// A paymaster service; its URL takes part in the chain id check.
    pub fn paymaster_client(mut self, client: PaymasterClient) -> Self {
        self.paymaster_url = Some(client.url().to_string());
        self.paymaster = Some(Arc::new(client));
        self
    }

    pub fn paymaster(mut self, paymaster: Arc<dyn Paymaster>) -> Self {
        self.paymaster = Some(paymaster);
        self
    }

    pub fn poll(mut self, poll: PollConfig) -> Self {
        self.poll = Some(poll);
        self
    }

    pub fn build(self) -> Result<Dispatcher, DispatchError> {
        let signer = self
            .signer
            .ok_or(Error::MissingSigner)
            .map_err(at(DispatchStage::Building))?;

        let mut resolver =
            FieldResolver::new(self.account.clone(), self.bundler.entry_point(), self.chain_id)
                .with_gas_estimator(Arc::new(self.bundler.clone()))
                .with_chain_check(
                    Some(self.bundler.url()),
                    self.paymaster_url.as_deref(),
                    signer.chain_id(),
                )
                .map_err(at(DispatchStage::Building))?;
        if let Some(fees) = self.fees {
            resolver = resolver.with_fee_oracle(fees);
        }
        if let Some(pm) = self.paymaster {
            resolver = resolver.with_paymaster(pm);
        }

        Ok(Dispatcher {
            account: self.account,
            signer,
            resolver,
            bundler: self.bundler,
            poll: self.poll.unwrap_or_else(|| PollConfig::for_chain(self.chain_id)),
        })
    }
}

pub struct Dispatcher {
    account: Arc<dyn SmartAccount>,
    signer: Arc<dyn UserOpSigner>,
    resolver: FieldResolver,
    bundler: BundlerClient,
    poll: PollConfig,
}

impl Dispatcher {
    pub fn builder(
        account: Arc<dyn SmartAccount>,
        bundler: BundlerClient,
        chain_id: u64,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            account,
            bundler,
            chain_id,
            signer: None,
            fees: None,
            paymaster: None,
            paymaster_url: None,
            poll: None,
        }
    }

    pub fn bundler(&self) -> &BundlerClient {
        &self.bundler
    }

    pub fn chain_id(&self) -> u64 {
        self.resolver.chain_id()
    }

    /// Encodes `calls`, resolves, signs and submits.
    pub async fn send(&self, calls: &[Call]) -> Result<PendingUserOperation, DispatchError> {
        self.send_with(calls, PartialUserOperation::new()).await
    }

    /// Like [`send`](Self::send), with caller overrides for any field.
    pub async fn send_with(
        &self,
        calls: &[Call],
        overrides: PartialUserOperation,
    ) -> Result<PendingUserOperation, DispatchError> {
        let signed = self.prepare(calls, overrides).await?;
        self.submit(signed).await
    }

    /// Everything up to and including signing; nothing is sent.
    pub async fn prepare(
        &self,
        calls: &[Call],
        mut overrides: PartialUserOperation,
    ) -> Result<SignedUserOperation, DispatchError> {
        trace_state(DispatchState::Building);
        if overrides.call_data.is_unset() {
            let call_data =
                encode_calls(self.account.as_ref(), calls).map_err(at(DispatchStage::Building))?;
            overrides = overrides.call_data(call_data);
        }

        let op = self
            .resolver
            .resolve(overrides)
            .await
            .map_err(at(DispatchStage::Resolving))?;
        trace_state(DispatchState::Resolved);

        let hash = op.hash(self.resolver.entry_point(), self.resolver.chain_id());
        trace_state(DispatchState::Hashed);

        let signature = self
            .signer
            .sign_message(hash.as_bytes())
            .await
            .map_err(at(DispatchStage::Signing))?;
        trace_state(DispatchState::Signed);

        Ok(SignedUserOperation {
            op: op.with_signature(signature),
            hash,
        })
    }

    pub async fn submit(
        &self,
        signed: SignedUserOperation,
    ) -> Result<PendingUserOperation, DispatchError> {
        let returned = self
            .bundler
            .send_user_operation(&signed.op)
            .await
            .map_err(at(DispatchStage::Submitting))?;
        if returned != signed.hash {
            tracing::warn!(
                local = %signed.hash,
                bundler = %returned,
                "bundler returned a different user operation hash"
            );
        }
        trace_state(DispatchState::Submitted);

        Ok(PendingUserOperation {
            hash: signed.hash,
            op: signed.op,
            bundler: self.bundler.clone(),
            poll: self.poll,
            state: DispatchState::Submitted,
        })
    }

    /// Resumes tracking an operation submitted earlier.
    pub fn track(&self, hash: UserOperationHash, op: UserOperation) -> PendingUserOperation {
        PendingUserOperation {
            hash,
            op,
            bundler: self.bundler.clone(),
            poll: self.poll,
            state: DispatchState::Submitted,
        }
    }
}

fn trace_state(state: DispatchState) {
    tracing::debug!(?state, "dispatch state");
}

/// A submitted operation, keyed by its hash.
#[derive(Debug)]
pub struct PendingUserOperation {
    hash: UserOperationHash,
    op: UserOperation,
    bundler: BundlerClient,
    poll: PollConfig,
    state: DispatchState,
}

impl PendingUserOperation {
    pub fn hash(&self) -> UserOperationHash {
        self.hash
    }

    pub fn user_operation(&self) -> &UserOperation {
        &self.op
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub async fn wait(&mut self) -> Result<UserOperationReceipt, DispatchError> {
        self.wait_inner(None).await
    }

    pub async fn wait_with_cancel(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<UserOperationReceipt, DispatchError> {
        self.wait_inner(Some(cancel)).await
    }

    async fn wait_inner(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<UserOperationReceipt, DispatchError> {
        let outcome = self
            .bundler
            .wait_for_receipt(self.hash, &self.poll, cancel)
            .await;

        let receipt = match outcome {
            Ok(receipt) => receipt,
            Err(e) => {
                if e.kind() == ErrorKind::Timeout {
                    self.state = DispatchState::TimedOut;
                }
                return Err(at(DispatchStage::Polling)(e));
            }
        };

        if !receipt.success {
            self.state = DispatchState::Failed;
            let reason = receipt
                .reason
                .clone()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "execution reverted".to_string());
            tracing::warn!(user_op_hash = %self.hash, %reason, "user operation reverted");
            return Err(at(DispatchStage::Polling)(Error::OnChainRevert {
                hash: self.hash.0,
                reason,
            }));
        }

        self.state = DispatchState::Confirmed;
        tracing::info!(
            user_op_hash = %self.hash,
            actual_gas_cost = ?receipt.actual_gas_cost,
            "user operation confirmed"
        );
        Ok(receipt)
    }
}
