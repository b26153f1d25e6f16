//! ERC-4337 (EntryPoint v0.6) client SDK.
//!
//! Builds UserOperations from partial input, hashes them the way the
//! EntryPoint does, signs through a pluggable signer and relays them to a
//! bundler, optionally sponsored by an ERC-7677 paymaster.

pub mod account;
pub mod bundler;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod encoding;
pub mod error;
pub mod fees;
pub mod hash;
pub mod paymaster;
pub mod quantity;
pub mod resolver;
pub mod rpc;
pub mod signer;
pub mod types;

pub use account::{SimpleAccount, SmartAccount};
pub use bundler::{BundlerClient, PollConfig};
pub use config::{SdkConfig, Settings};
pub use dispatch::{DispatchError, DispatchStage, DispatchState, Dispatcher, PendingUserOperation};
pub use error::{Error, ErrorKind, Result};
pub use hash::user_operation_hash;
pub use paymaster::PaymasterClient;
pub use quantity::Quantity;
pub use resolver::FieldResolver;
pub use signer::{LocalSigner, RemoteSigner, UserOpSigner};
pub use types::{
    Call, Field, PartialUserOperation, UserOperation, UserOperationHash, UserOperationReceipt,
};
