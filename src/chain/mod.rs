//! Chain module - signer pool, network connection and contract handles
//!
//! This module provides:
//! - The fixed set of hot signers for the active network
//! - Named contract handles (address + ABI)
//! - Raw JSON-RPC access for authoritative nonce and gas price

pub mod rpc;
pub mod signer;

pub use rpc::{HttpRpcClient, RpcClient};
pub use signer::Signer;

use crate::config::{ContractConfig, NetworkConfig};
use crate::error::{EngineError, EngineResult};
use crate::tx::PendingNonceTable;

use ethers::abi::Abi;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// A deployed contract the relayer calls into
#[derive(Debug, Clone)]
pub struct ContractHandle {
    pub name: String,
    pub address: Address,
    pub abi: Abi,
}

impl ContractHandle {
    /// Load a contract handle, reading its ABI from disk
    pub fn load(name: &str, config: &ContractConfig) -> EngineResult<Self> {
        let address = config.address.parse::<Address>().map_err(|e| {
            EngineError::Config(format!("Invalid address for contract {}: {}", name, e))
        })?;

        let abi_json = std::fs::read_to_string(&config.abi_path).map_err(|e| {
            EngineError::Config(format!(
                "Failed to read ABI for contract {} from {:?}: {}",
                name, config.abi_path, e
            ))
        })?;

        let abi: Abi = serde_json::from_str(&abi_json).map_err(|e| {
            EngineError::Config(format!("Invalid ABI for contract {}: {}", name, e))
        })?;

        Ok(Self {
            name: name.to_string(),
            address,
            abi,
        })
    }
}

struct PoolInner {
    provider: Arc<Provider<Http>>,
    chain_id: u64,
    signers: Vec<Arc<Signer>>,
    contracts: HashMap<String, ContractHandle>,
}

/// Fixed set of signing identities for the active network
///
/// Initialized once; every accessor fails with a config error before that.
pub struct SignerPool {
    inner: OnceCell<PoolInner>,
    pending: Arc<PendingNonceTable>,
}

impl SignerPool {
    /// Create an empty pool whose initialization resets `pending`
    pub fn new(pending: Arc<PendingNonceTable>) -> Self {
        Self {
            inner: OnceCell::new(),
            pending,
        }
    }

    /// Derive signers for `config`, connect them and load contract handles
    pub async fn init(&self, config: &NetworkConfig) -> EngineResult<()> {
        if self.is_initialized() {
            return Err(EngineError::AlreadyInitialized);
        }

        let source = config.signer_source()?;

        let provider = Provider::<Http>::try_from(config.url.as_str())
            .map_err(|e| EngineError::Config(format!("Invalid network url {}: {}", config.url, e)))?
            .interval(Duration::from_millis(500));
        let provider = Arc::new(provider);

        let chain_id = match config.chain_id {
            Some(chain_id) => chain_id,
            None => provider
                .get_chainid()
                .await
                .map_err(|e| EngineError::Config(format!("Failed to query chain id: {}", e)))?
                .as_u64(),
        };

        let signers = signer::derive_wallets(&source, chain_id)?
            .into_iter()
            .map(|wallet| Arc::new(Signer::new(wallet, provider.clone())))
            .collect::<Vec<_>>();

        let contracts = config
            .contracts
            .iter()
            .map(|(name, contract)| {
                ContractHandle::load(name, contract).map(|handle| (name.clone(), handle))
            })
            .collect::<EngineResult<HashMap<_, _>>>()?;

        self.init_with(provider, chain_id, signers, contracts)
    }

    /// Install an already-built signer set
    pub fn init_with(
        &self,
        provider: Arc<Provider<Http>>,
        chain_id: u64,
        signers: Vec<Arc<Signer>>,
        contracts: HashMap<String, ContractHandle>,
    ) -> EngineResult<()> {
        if signers.is_empty() {
            return Err(EngineError::Config("signer pool needs at least one signer".to_string()));
        }
        if self.is_initialized() {
            return Err(EngineError::AlreadyInitialized);
        }

        self.pending.reset();

        let count = signers.len();
        for signer in &signers {
            debug!("Signer {:?} ready on chain {}", signer.address(), chain_id);
        }

        self.inner
            .set(PoolInner {
                provider,
                chain_id,
                signers,
                contracts,
            })
            .map_err(|_| EngineError::AlreadyInitialized)?;

        info!("Signer pool initialized with {} signers on chain {}", count, chain_id);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized()
    }

    fn inner(&self) -> EngineResult<&PoolInner> {
        self.inner
            .get()
            .ok_or_else(|| EngineError::Config("signer pool is not initialized".to_string()))
    }

    pub fn signers(&self) -> EngineResult<&[Arc<Signer>]> {
        Ok(&self.inner()?.signers)
    }

    pub fn addresses(&self) -> EngineResult<Vec<Address>> {
        Ok(self.signers()?.iter().map(|s| s.address()).collect())
    }

    pub fn provider(&self) -> EngineResult<&Arc<Provider<Http>>> {
        Ok(&self.inner()?.provider)
    }

    pub fn chain_id(&self) -> EngineResult<u64> {
        Ok(self.inner()?.chain_id)
    }

    /// Get a named contract handle
    pub fn contract(&self, name: &str) -> EngineResult<&ContractHandle> {
        self.inner()?
            .contracts
            .get(name)
            .ok_or_else(|| EngineError::Config(format!("contract {} is not configured", name)))
    }
}
