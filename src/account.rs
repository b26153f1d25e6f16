use crate::error::{Error, Result};
use crate::types::Call;
use async_trait::async_trait;
use ethers::abi::{AbiParser, Function, Token};
use ethers::contract::Contract;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, U256};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SmartAccount: Send + Sync {
    /// Counterfactual address; valid before deployment.
    fn address(&self) -> Address;

    /// Current EntryPoint nonce for key 0.
    async fn nonce(&self) -> Result<U256>;

    async fn is_deployed(&self) -> Result<bool>;

    /// `factory ++ factoryCalldata`.
    fn init_code(&self) -> Result<Bytes>;

    fn encode_execute(&self, call: &Call) -> Result<Bytes>;

    fn encode_execute_batch(&self, calls: &[Call]) -> Result<Bytes>;

    /// Well-formed placeholder used while the real signature is unknown.
    fn dummy_signature(&self) -> Bytes;
}

/// Picks `execute` for one call and `executeBatch` for several.
pub fn encode_calls(account: &dyn SmartAccount, calls: &[Call]) -> Result<Bytes> {
    match calls {
        [] => Err(Error::MissingField("callData")),
        [single] => account.encode_execute(single),
        many => account.encode_execute_batch(many),
    }
}

// ECDSA-shaped (low s, v = 28) so ecrecover in account validation does not revert.
const DUMMY_SIGNATURE: [u8; 65] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xf0,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x7a, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
    0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
    0x1c,
];

/// eth-infinitism `SimpleAccount` deployed by `SimpleAccountFactory`.
#[derive(Debug)]
pub struct SimpleAccount<M> {
    client: Arc<M>,
    entry_point: Address,
    factory: Address,
    owner: Address,
    salt: U256,
    address: Address,
}

impl<M: Middleware + 'static> SimpleAccount<M> {
    pub fn new(
        client: Arc<M>,
        entry_point: Address,
        factory: Address,
        owner: Address,
        salt: U256,
        address: Address,
    ) -> Self {
        Self {
            client,
            entry_point,
            factory,
            owner,
            salt,
            address,
        }
    }

    /// Asks the factory for the counterfactual address of `(owner, salt)`.
    pub async fn connect(
        client: Arc<M>,
        entry_point: Address,
        factory: Address,
        owner: Address,
        salt: U256,
    ) -> Result<Self> {
        let factory_abi = AbiParser::default()
            .parse(&["function getAddress(address owner, uint256 salt) view returns (address)"])
            .map_err(account_err)?;
        let factory_c = Contract::new(factory, factory_abi, client.clone());

        let address: Address = factory_c
            .method("getAddress", (owner, salt))
            .map_err(account_err)?
            .call()
            .await
            .map_err(|e| Error::Account(format!("factory.getAddress failed: {e}")))?;

        tracing::debug!(account = ?address, ?owner, %salt, "resolved counterfactual account");
        Ok(Self::new(client, entry_point, factory, owner, salt, address))
    }

    pub fn owner(&self) -> Address {
        self.owner
    }
}

#[async_trait]
impl<M: Middleware + 'static> SmartAccount for SimpleAccount<M> {
    fn address(&self) -> Address {
        self.address
    }

    async fn nonce(&self) -> Result<U256> {
        let entrypoint_abi = AbiParser::default()
            .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])
            .map_err(account_err)?;
        let entrypoint_c = Contract::new(self.entry_point, entrypoint_abi, self.client.clone());

        entrypoint_c
            .method::<_, U256>("getNonce", (self.address, U256::zero()))
            .map_err(account_err)?
            .call()
            .await
            .map_err(|e| Error::Account(format!("entryPoint.getNonce failed: {e}")))
    }

    async fn is_deployed(&self) -> Result<bool> {
        let code = self
            .client
            .get_code(self.address, None)
            .await
            .map_err(|e| Error::Account(format!("eth_getCode failed: {e}")))?;
        Ok(!code.as_ref().is_empty())
    }

    fn init_code(&self) -> Result<Bytes> {
        let create =
            function("function createAccount(address owner, uint256 salt) returns (address)")?;
        let calldata = create
            .encode_input(&[Token::Address(self.owner), Token::Uint(self.salt)])
            .map_err(account_err)?;

        let mut v = Vec::with_capacity(20 + calldata.len());
        v.extend_from_slice(self.factory.as_bytes());
        v.extend_from_slice(&calldata);
        Ok(Bytes::from(v))
    }

    fn encode_execute(&self, call: &Call) -> Result<Bytes> {
        let execute = function("function execute(address dest, uint256 value, bytes func)")?;
        execute
            .encode_input(&[
                Token::Address(call.to),
                Token::Uint(call.value),
                Token::Bytes(call.data.to_vec()),
            ])
            .map(Bytes::from)
            .map_err(account_err)
    }

    fn encode_execute_batch(&self, calls: &[Call]) -> Result<Bytes> {
        // v0.6 SimpleAccount.executeBatch has no value array.
        if let Some(i) = calls.iter().position(|c| !c.value.is_zero()) {
            return Err(Error::invalid(
                "callData",
                format!("call {i} carries value, which executeBatch cannot forward"),
            ));
        }
        let batch = function("function executeBatch(address[] dest, bytes[] func)")?;
        let dests = calls.iter().map(|c| Token::Address(c.to)).collect();
        let funcs = calls.iter().map(|c| Token::Bytes(c.data.to_vec())).collect();
        batch
            .encode_input(&[Token::Array(dests), Token::Array(funcs)])
            .map(Bytes::from)
            .map_err(account_err)
    }

    fn dummy_signature(&self) -> Bytes {
        Bytes::from(DUMMY_SIGNATURE.to_vec())
    }
}

fn function(signature: &str) -> Result<Function> {
    AbiParser::default()
        .parse_function(signature)
        .map_err(account_err)
}

fn account_err(e: impl std::fmt::Display) -> Error {
    Error::Account(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{Http, Provider};

    fn account() -> SimpleAccount<Provider<Http>> {
        let provider = Provider::<Http>::try_from("http://127.0.0.1:8545").unwrap();
        SimpleAccount::new(
            Arc::new(provider),
            "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap(),
            "0x9406cc6185a346906296840746125a0e44976454".parse().unwrap(),
            "0xce0fefa6f7979c4c9b5373e0f5105b7259092c6d".parse().unwrap(),
            U256::zero(),
            "0x9c5754De1443984659E1b3a8d1931D83475ba29C".parse().unwrap(),
        )
    }

    #[test]
    fn execute_matches_known_calldata() {
        let call = Call::new(
            "0x9c5754De1443984659E1b3a8d1931D83475ba29C".parse().unwrap(),
            U256::from(100_000_000_000_000u64),
            Bytes::default(),
        );
        let expected: Bytes = "0xb61d27f60000000000000000000000009c5754de1443984659e1b3a8d1931d83475ba29c00000000000000000000000000000000000000000000000000005af3107a400000000000000000000000000000000000000000000000000000000000000000600000000000000000000000000000000000000000000000000000000000000000".parse().unwrap();
        assert_eq!(account().encode_execute(&call).unwrap(), expected);
        assert_eq!(encode_calls(&account(), &[call]).unwrap(), expected);
    }

    #[test]
    fn init_code_is_factory_then_create_account() {
        let expected: Bytes = "0x9406cc6185a346906296840746125a0e449764545fbfb9cf000000000000000000000000ce0fefa6f7979c4c9b5373e0f5105b7259092c6d0000000000000000000000000000000000000000000000000000000000000000".parse().unwrap();
        assert_eq!(account().init_code().unwrap(), expected);
    }

    #[test]
    fn batch_uses_execute_batch_selector() {
        let calls = vec![
            Call::new(Address::repeat_byte(1), U256::zero(), Bytes::from(vec![1, 2])),
            Call::new(Address::repeat_byte(2), U256::zero(), Bytes::from(vec![3])),
        ];
        let encoded = encode_calls(&account(), &calls).unwrap();
        // keccak256("executeBatch(address[],bytes[])")[..4]
        assert_eq!(&encoded[..4], &[0x18, 0xdf, 0xb3, 0xc7]);
    }

    #[test]
    fn batch_with_value_is_rejected() {
        let calls = vec![
            Call::new(Address::repeat_byte(1), U256::one(), Bytes::default()),
            Call::new(Address::repeat_byte(2), U256::zero(), Bytes::default()),
        ];
        assert!(encode_calls(&account(), &calls).is_err());
        assert!(matches!(
            encode_calls(&account(), &[]),
            Err(Error::MissingField("callData"))
        ));
    }

    #[test]
    fn dummy_signature_is_a_well_formed_ecdsa_signature() {
        let expected: Bytes = "0xfffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c".parse().unwrap();
        let sig = account().dummy_signature();
        assert_eq!(sig, expected);
        assert_eq!(sig[64], 0x1c);
        assert!(ethers::types::Signature::try_from(sig.as_ref()).is_ok());
    }
}
