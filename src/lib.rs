//! Wallet relayer - transaction execution engine
//!
//! Turns "call this contract method" requests from the SMS/chat command router
//! into nonced, priced, retried transactions sent from a small pool of shared
//! hot signers.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod tx;

pub use chain::{ContractHandle, HttpRpcClient, RpcClient, Signer, SignerPool};
pub use config::Settings;
pub use error::{EngineError, EngineResult, SubmissionError};
pub use tx::{ExecuteOptions, Executor, PendingNonceTable, TransactionHandle};
