//! Error types for the wallet relayer

use ethers::types::TransactionReceipt;
use thiserror::Error;

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signer pool is already initialized")]
    AlreadyInitialized,

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Nonce fetch error: {message}")]
    NonceFetch { message: String },

    #[error("Transaction aborted: {reason}")]
    Abort { reason: String },

    #[error("Transaction failed before broadcast: {message}")]
    PreBroadcast { message: String },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: SubmissionError,
    },
}

impl EngineError {
    /// Check if a later, fresh `execute` call might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::NonceFetch { .. } | EngineError::ExhaustedRetries { .. }
        )
    }

    /// Check if error indicates a startup problem rather than a request problem
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Config(_) | EngineError::AlreadyInitialized | EngineError::Wallet(_)
        )
    }
}

/// Failure of a single submission attempt, classified where it happened.
#[derive(Error, Debug)]
pub enum SubmissionError {
    /// The call can never succeed as issued (e.g. the simulation reverted).
    #[error("abort: {0}")]
    Abort(String),

    /// Nothing suggests the request reached the node.
    #[error("not broadcast: {0}")]
    PreBroadcast(String),

    /// The node answered with an error payload, or the transaction was mined
    /// and failed.
    #[error("transient submission error: {message}")]
    Transient {
        message: String,
        receipt: Option<Box<TransactionReceipt>>,
    },
}

impl SubmissionError {
    pub fn transient(message: impl Into<String>) -> Self {
        SubmissionError::Transient {
            message: message.into(),
            receipt: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SubmissionError::Abort(_) => "abort",
            SubmissionError::PreBroadcast(_) => "pre_broadcast",
            SubmissionError::Transient { .. } => "transient",
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
