use std::{collections::BTreeMap, fmt, str::FromStr};

use async_trait::async_trait;
use ethers::{
    signers::{LocalWallet, Signer},
    types::{transaction::eip2718::TypedTransaction, TransactionRequest},
    utils::keccak256,
};
use eyre::{Context, Result};

use oracle_core::{
    Address, ChainCommunicationError, ChainResult, KeyStore, SignedTx, UnsignedTx, H256,
};

use crate::settings::KeysConf;

/// Key store holding secp256k1 secrets in memory, one per sending address.
#[derive(Clone, Default)]
pub struct LocalKeyStore {
    wallets: BTreeMap<Address, LocalWallet>,
}

impl fmt::Debug for LocalKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyStore")
            .field("addresses", &self.wallets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LocalKeyStore {
    /// Loads every configured private key.
    pub fn from_conf(conf: &KeysConf) -> Result<Self> {
        let mut store = Self::default();
        for (i, key) in conf.private_keys.iter().enumerate() {
            let wallet = LocalWallet::from_str(key.trim().trim_start_matches("0x"))
                .with_context(|| format!("Invalid private key at index {i}"))?;
            store.insert(wallet);
        }
        Ok(store)
    }

    /// Adds a wallet, replacing any with the same address.
    pub fn insert(&mut self, wallet: LocalWallet) {
        self.wallets.insert(wallet.address(), wallet);
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    async fn sending_keys(&self) -> ChainResult<Vec<Address>> {
        Ok(self.wallets.keys().copied().collect())
    }

    async fn sign_tx(
        &self,
        from: Address,
        tx: &UnsignedTx,
        chain_id: u64,
    ) -> ChainResult<SignedTx> {
        let wallet = self
            .wallets
            .get(&from)
            .ok_or(ChainCommunicationError::KeyNotFound(from))?
            .clone()
            .with_chain_id(chain_id);
        let typed: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(tx.to)
            .value(tx.value)
            .data(tx.data.clone())
            .gas(tx.gas_limit)
            .gas_price(tx.gas_price)
            .nonce(tx.nonce)
            .chain_id(chain_id)
            .into();
        let signature = wallet
            .sign_transaction_sync(&typed)
            .map_err(|e| ChainCommunicationError::Signing(e.to_string()))?;
        let raw = typed.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        Ok(SignedTx { hash, raw })
    }
}

#[cfg(test)]
mod tests {
    use ethers::utils::rlp::Rlp;
    use oracle_core::{Bytes, U256};

    use super::*;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn store() -> LocalKeyStore {
        LocalKeyStore::from_conf(&KeysConf {
            private_keys: vec![KEY.to_owned()],
        })
        .unwrap()
    }

    fn unsigned() -> UnsignedTx {
        UnsignedTx {
            nonce: 5,
            to: Address::repeat_byte(0x11),
            value: U256::from(7u64),
            data: Bytes::from(vec![0xde, 0xad]),
            gas_limit: 21_000,
            gas_price: U256::from(20_000_000_000u64),
        }
    }

    #[tokio::test]
    async fn signed_transaction_recovers_to_sender() {
        let store = store();
        let from = store.sending_keys().await.unwrap()[0];
        let signed = store.sign_tx(from, &unsigned(), 1337).await.unwrap();

        assert_eq!(signed.hash, H256::from(keccak256(&signed.raw)));
        let (decoded, sig) = TypedTransaction::decode_signed(&Rlp::new(&signed.raw)).unwrap();
        assert_eq!(sig.recover(decoded.sighash()).unwrap(), from);
        assert_eq!(decoded.nonce(), Some(&U256::from(5u64)));
        assert_eq!(decoded.gas_price(), Some(U256::from(20_000_000_000u64)));
    }

    #[tokio::test]
    async fn signing_is_deterministic() {
        let store = store();
        let from = store.sending_keys().await.unwrap()[0];
        let a = store.sign_tx(from, &unsigned(), 1).await.unwrap();
        let b = store.sign_tx(from, &unsigned(), 1).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected() {
        let err = store()
            .sign_tx(Address::repeat_byte(9), &unsigned(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainCommunicationError::KeyNotFound(_)));
    }

    #[test]
    fn debug_does_not_leak_secrets() {
        let out = format!("{:?}", store());
        assert!(!out.contains("4c0883a6"));
    }
}
