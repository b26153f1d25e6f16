use crate::chain::ChainSource;
use ethers::types::H256;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], stable enough to branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing input. Never worth retrying.
    Validation,
    /// Chain ids disagree between signer, bundler and paymaster.
    Consistency,
    /// HTTP-level failure without a usable JSON body.
    Transport,
    /// The service answered with a JSON failure envelope.
    Service,
    /// Receipt polling ran out of time; the operation may still land.
    Timeout,
    /// A receipt exists and reports `success: false`.
    OnChainRevert,
    Signer,
    /// Account, provider or fee oracle call failed.
    Collaborator,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("invalid chain id: cannot extract chain id from url `{0}`")]
    InvalidChainId(String),

    #[error("malformed url `{url}`: {reason}")]
    MalformedUrl { url: String, reason: String },

    #[error("config `{path}`: {reason}")]
    Config { path: String, reason: String },

    #[error("missing signer")]
    MissingSigner,

    #[error("chain id mismatch: {left} reports {left_id}, {right} reports {right_id}")]
    ChainIdMismatch {
        left: ChainSource,
        left_id: u64,
        right: ChainSource,
        right_id: u64,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("service error{}: {message}", code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Service { message: String, code: Option<i64> },

    #[error("timed out after {elapsed:?} waiting for receipt of user operation {hash:?}")]
    Timeout { hash: H256, elapsed: Duration },

    #[error("user operation {hash:?} reverted on chain: {reason}")]
    OnChainRevert { hash: H256, reason: String },

    #[error("cancelled while waiting for receipt of user operation {0:?}")]
    Cancelled(H256),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("account error: {0}")]
    Account(String),

    #[error("failed to resolve `{field}`: {source}")]
    Resolution {
        field: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingField(_)
            | Error::InvalidField { .. }
            | Error::InvalidChainId(_)
            | Error::MalformedUrl { .. }
            | Error::Config { .. }
            | Error::MissingSigner => ErrorKind::Validation,
            Error::ChainIdMismatch { .. } => ErrorKind::Consistency,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Service { .. } => ErrorKind::Service,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::OnChainRevert { .. } => ErrorKind::OnChainRevert,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Signer(_) => ErrorKind::Signer,
            Error::Account(_) => ErrorKind::Collaborator,
            Error::Resolution { source, .. } => source.kind(),
        }
    }

    pub(crate) fn resolving(field: &'static str) -> impl FnOnce(Error) -> Error {
        move |source| Error::Resolution {
            field,
            source: Box::new(source),
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl ToString) -> Self {
        Error::InvalidField {
            field,
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
