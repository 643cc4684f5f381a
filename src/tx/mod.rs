//! Transaction execution: nonce reservation, signer selection, gas pricing,
//! submission and retry

mod executor;
mod gas;
mod nonce;
mod selector;
mod sender;

pub use executor::{ExecuteOptions, Executor, TransactionHandle};
pub use gas::GasEstimator;
pub use nonce::{PendingNonceTable, Reservation};
pub use selector::SignerSelector;
pub use sender::{classify_provider_error, EthersSubmitter, SubmitRequest, Submitted, Submitter};
