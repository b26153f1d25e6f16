use crate::encoding::{fmt_address, parse_bytes};
use crate::error::{Error, Result};
use crate::rpc::RpcClient;
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip712::{EIP712Domain, Eip712, TypedData};
use ethers::types::{Address, Bytes, H256};
use std::str::FromStr;

/// Anything that can sign for the owner of a smart account.
#[async_trait]
pub trait UserOpSigner: Send + Sync {
    /// Constant for the lifetime of the adapter.
    fn address(&self) -> Address;

    /// Chain the backend believes it is on, if it knows.
    fn chain_id(&self) -> Option<u64> {
        None
    }

    /// EIP-191 personal message signature, parity byte in `{27, 28}`.
    async fn sign_message(&self, message: &[u8]) -> Result<Bytes>;

    /// Raw signature over a 32-byte digest, if the backend allows it.
    async fn sign_digest(&self, _digest: H256) -> Result<Bytes> {
        Err(Error::Signer(
            "backend does not support signing raw digests".into(),
        ))
    }

    /// EIP-712 signature.
    ///
    /// Backends without native support fall back to signing the EIP-712
    /// digest, which needs a domain to be meaningful.
    async fn sign_typed_data(&self, data: &TypedData) -> Result<Bytes> {
        if domain_is_empty(&data.domain) {
            return Err(Error::Signer(
                "backend does not support typed data signing and no domain was supplied".into(),
            ));
        }
        let digest = data
            .encode_eip712()
            .map_err(|e| Error::Signer(format!("failed to encode typed data: {e}")))?;
        self.sign_digest(H256(digest)).await
    }
}

pub fn domain_is_empty(domain: &EIP712Domain) -> bool {
    domain.name.is_none()
        && domain.version.is_none()
        && domain.chain_id.is_none()
        && domain.verifying_contract.is_none()
        && domain.salt.is_none()
}

/// Moves a `{0, 1}` recovery byte of a 65-byte signature into `{27, 28}`.
pub fn normalize_signature(sig: Bytes) -> Bytes {
    if sig.len() != 65 {
        return sig;
    }
    let mut v = sig.to_vec();
    if v[64] < 27 {
        v[64] += 27;
    }
    Bytes::from(v)
}

/// Signs with a private key held in process.
#[derive(Debug, Clone)]
pub struct LocalSigner {
    wallet: LocalWallet,
}

impl LocalSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    pub fn from_private_key(private_key: &str, chain_id: u64) -> Result<Self> {
        let wallet = LocalWallet::from_str(private_key)
            .map_err(|e| Error::Signer(format!("invalid private key: {e}")))?
            .with_chain_id(chain_id);
        Ok(Self::new(wallet))
    }
}

#[async_trait]
impl UserOpSigner for LocalSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    fn chain_id(&self) -> Option<u64> {
        Some(self.wallet.chain_id())
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes> {
        let sig = self
            .wallet
            .sign_message(message)
            .await
            .map_err(|e| Error::Signer(e.to_string()))?;
        Ok(normalize_signature(Bytes::from(sig.to_vec())))
    }

    async fn sign_digest(&self, digest: H256) -> Result<Bytes> {
        let sig = self
            .wallet
            .sign_hash(digest)
            .map_err(|e| Error::Signer(e.to_string()))?;
        Ok(normalize_signature(Bytes::from(sig.to_vec())))
    }

    async fn sign_typed_data(&self, data: &TypedData) -> Result<Bytes> {
        let sig = self
            .wallet
            .sign_typed_data(data)
            .await
            .map_err(|e| Error::Signer(e.to_string()))?;
        Ok(normalize_signature(Bytes::from(sig.to_vec())))
    }
}

/// Signs through a wallet that speaks EIP-1193 JSON-RPC (`personal_sign`,
/// `eth_signTypedData_v4`).
#[derive(Debug, Clone)]
pub struct RemoteSigner {
    rpc: RpcClient,
    address: Address,
    chain_id: Option<u64>,
}

impl RemoteSigner {
    /// Asks the wallet for its account and chain once; both are fixed afterwards.
    pub async fn connect(rpc: RpcClient) -> Result<Self> {
        let accounts = rpc
            .request("eth_accounts", serde_json::json!([]))
            .await
            .map_err(|e| Error::Signer(format!("eth_accounts failed: {e}")))?;
        let address = accounts
            .get(0)
            .and_then(|a| a.as_str())
            .ok_or_else(|| Error::Signer("wallet exposes no accounts".into()))?
            .parse::<Address>()
            .map_err(|e| Error::Signer(format!("wallet returned an invalid address: {e}")))?;

        // Wallets without eth_chainId are fine; the chain check just skips them.
        let chain_id = match rpc.request("eth_chainId", serde_json::json!([])).await {
            Ok(v) => v
                .as_str()
                .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()),
            Err(e) => {
                tracing::debug!(error = %e, "remote signer did not report a chain id");
                None
            }
        };

        Ok(Self {
            rpc,
            address,
            chain_id,
        })
    }

    fn parse_signature(result: serde_json::Value) -> Result<Bytes> {
        let s = result
            .as_str()
            .ok_or_else(|| Error::Signer(format!("unexpected signature result: {result}")))?;
        let sig = parse_bytes("signature", s)?;
        if sig.len() != 65 {
            return Err(Error::Signer(format!(
                "expected a 65-byte signature, got {} bytes",
                sig.len()
            )));
        }
        Ok(normalize_signature(sig))
    }
}

#[async_trait]
impl UserOpSigner for RemoteSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn chain_id(&self) -> Option<u64> {
        self.chain_id
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes> {
        let params = serde_json::json!([
            format!("0x{}", hex::encode(message)),
            fmt_address(self.address),
        ]);
        let res = self
            .rpc
            .request("personal_sign", params)
            .await
            .map_err(|e| Error::Signer(format!("personal_sign failed: {e}")))?;
        Self::parse_signature(res)
    }

    async fn sign_typed_data(&self, data: &TypedData) -> Result<Bytes> {
        // Types are serialized as ordered arrays, so field order survives.
        let payload = serde_json::to_string(data)
            .map_err(|e| Error::Signer(format!("failed to serialize typed data: {e}")))?;
        let params = serde_json::json!([fmt_address(self.address), payload]);
        let res = self
            .rpc
            .request("eth_signTypedData_v4", params)
            .await
            .map_err(|e| Error::Signer(format!("eth_signTypedData_v4 failed: {e}")))?;
        Self::parse_signature(res)
    }
}
