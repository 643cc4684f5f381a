//! Signing identities and their derivation from configured secrets

use crate::config::SignerSource;
use crate::error::{EngineError, EngineResult};

use ethers::providers::{Http, Provider};
use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer as _};
use ethers::types::Address;
use std::fmt;
use std::sync::Arc;

/// A hot account able to sign transactions, bound to a network connection
#[derive(Clone)]
pub struct Signer {
    wallet: LocalWallet,
    provider: Arc<Provider<Http>>,
}

impl Signer {
    pub fn new(wallet: LocalWallet, provider: Arc<Provider<Http>>) -> Self {
        Self { wallet, provider }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }

    pub fn provider(&self) -> &Provider<Http> {
        &self.provider
    }

    pub fn chain_id(&self) -> u64 {
        self.wallet.chain_id()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address())
            .field("chain_id", &self.chain_id())
            .finish()
    }
}

/// Derive the wallets described by `source`, in account order
pub fn derive_wallets(source: &SignerSource<'_>, chain_id: u64) -> EngineResult<Vec<LocalWallet>> {
    match source {
        SignerSource::Key(key) => {
            let wallet = key
                .trim_start_matches("0x")
                .parse::<LocalWallet>()
                .map_err(|e| EngineError::Wallet(format!("Invalid private key: {}", e)))?;
            Ok(vec![wallet.with_chain_id(chain_id)])
        }
        SignerSource::Mnemonic {
            phrase,
            path_prefix,
            count,
        } => (0..*count)
            .map(|index| {
                let path = format!("{}/{}", path_prefix.trim_end_matches('/'), index);
                MnemonicBuilder::<English>::default()
                    .phrase(*phrase)
                    .derivation_path(&path)
                    .and_then(|builder| builder.build())
                    .map(|wallet| wallet.with_chain_id(chain_id))
                    .map_err(|e| {
                        EngineError::Wallet(format!("Failed to derive account at {}: {}", path, e))
                    })
            })
            .collect(),
    }
}
