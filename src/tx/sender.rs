//! Submission of a single signed contract call, and classification of its
//! failures into abort / not-broadcast / transient.

use super::gas::GasEstimator;
use crate::chain::{ContractHandle, Signer};
use crate::error::SubmissionError;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::providers::{JsonRpcError, Middleware, ProviderError, RpcError};
use ethers::signers::Signer as _;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, TransactionReceipt, TransactionRequest, H256, U256, U64};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// One attempt at sending a contract call
#[derive(Debug, Clone)]
pub struct SubmitRequest<'a> {
    pub method: &'a str,
    pub params: &'a [Token],
    pub nonce: U256,
    pub gas_price: U256,
    pub attempt: u32,
}

/// A broadcast transaction, with its receipt when confirmations were awaited
#[derive(Debug, Clone)]
pub struct Submitted {
    pub hash: H256,
    pub receipt: Option<TransactionReceipt>,
}

/// Sends a call signed by a given signer at a given nonce and gas price
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(
        &self,
        signer: &Signer,
        request: &SubmitRequest<'_>,
    ) -> Result<Submitted, SubmissionError>;
}

#[async_trait]
impl<T: Submitter + ?Sized> Submitter for Arc<T> {
    async fn submit(
        &self,
        signer: &Signer,
        request: &SubmitRequest<'_>,
    ) -> Result<Submitted, SubmissionError> {
        (**self).submit(signer, request).await
    }
}

/// Submitter for one contract over the signer's HTTP provider
pub struct EthersSubmitter {
    contract: ContractHandle,
    gas: GasEstimator,
    /// Blocks to wait for; 0 returns as soon as the node accepts the tx
    confirmations: usize,
    send_timeout: Duration,
}

impl EthersSubmitter {
    pub fn new(contract: ContractHandle, gas: GasEstimator, confirmations: usize) -> Self {
        Self {
            contract,
            gas,
            confirmations,
            send_timeout: Duration::from_secs(30),
        }
    }

    pub fn contract(&self) -> &ContractHandle {
        &self.contract
    }

    /// ABI-encode `method(params)` for the target contract
    pub fn encode_call(&self, method: &str, params: &[Token]) -> Result<Bytes, SubmissionError> {
        let function = self.contract.abi.function(method).map_err(|e| {
            SubmissionError::Abort(format!(
                "unknown method {} on {}: {}",
                method, self.contract.name, e
            ))
        })?;

        function
            .encode_input(params)
            .map(Bytes::from)
            .map_err(|e| SubmissionError::Abort(format!("invalid arguments for {}: {}", method, e)))
    }

    fn build_tx(&self, signer: &Signer, data: Bytes, request: &SubmitRequest<'_>) -> TypedTransaction {
        TransactionRequest::new()
            .from(signer.address())
            .to(self.contract.address)
            .data(data)
            .nonce(request.nonce)
            .gas_price(request.gas_price)
            .chain_id(signer.chain_id())
            .into()
    }
}

#[async_trait]
impl Submitter for EthersSubmitter {
    async fn submit(
        &self,
        signer: &Signer,
        request: &SubmitRequest<'_>,
    ) -> Result<Submitted, SubmissionError> {
        let data = self.encode_call(request.method, request.params)?;
        let mut tx = self.build_tx(signer, data, request);
        let provider = signer.provider();

        // Simulate first so a revert aborts without spending gas
        provider
            .call(&tx, None)
            .await
            .map_err(|e| classify_provider_error(&e))?;

        let gas_limit = match self.gas.fixed_gas_limit() {
            Some(limit) => limit,
            None => {
                let estimate = provider
                    .estimate_gas(&tx, None)
                    .await
                    .map_err(|e| classify_provider_error(&e))?;
                self.gas.buffered_limit(estimate)
            }
        };
        tx.set_gas(gas_limit);

        let signature = signer
            .wallet()
            .sign_transaction(&tx)
            .await
            .map_err(|e| SubmissionError::Abort(format!("failed to sign transaction: {}", e)))?;
        let raw = tx.rlp_signed(&signature);

        let pending = match timeout(self.send_timeout, provider.send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => pending,
            Ok(Err(e)) => return Err(classify_provider_error(&e)),
            Err(_) => {
                return Err(SubmissionError::PreBroadcast(format!(
                    "send timed out after {:?}",
                    self.send_timeout
                )))
            }
        };

        let hash = pending.tx_hash();
        info!(
            "Transaction sent: {:?} (nonce {}, attempt {})",
            hash, request.nonce, request.attempt
        );

        if self.confirmations == 0 {
            return Ok(Submitted {
                hash,
                receipt: None,
            });
        }

        match pending.confirmations(self.confirmations).await {
            Ok(Some(receipt)) if receipt.status == Some(U64::one()) => {
                debug!("Transaction {:?} confirmed in block {:?}", hash, receipt.block_number);
                Ok(Submitted {
                    hash,
                    receipt: Some(receipt),
                })
            }
            Ok(Some(receipt)) => Err(SubmissionError::Transient {
                message: format!("transaction {:?} failed on chain", hash),
                receipt: Some(Box::new(receipt)),
            }),
            Ok(None) => Err(SubmissionError::transient(format!(
                "transaction {:?} dropped from mempool",
                hash
            ))),
            Err(e) => Err(SubmissionError::transient(format!(
                "waiting for {:?} failed: {}",
                hash, e
            ))),
        }
    }
}

/// Decide what a provider failure means for the attempt that hit it
pub fn classify_provider_error(err: &ProviderError) -> SubmissionError {
    match rpc_payload(err) {
        Some(payload) if is_revert(payload) => {
            SubmissionError::Abort(format!("execution reverted: {}", payload.message))
        }
        Some(payload) => SubmissionError::transient(format!(
            "rpc error {}: {}",
            payload.code, payload.message
        )),
        None => SubmissionError::PreBroadcast(err.to_string()),
    }
}

fn rpc_payload(err: &ProviderError) -> Option<&JsonRpcError> {
    match err {
        ProviderError::JsonRpcClientError(e) => e.as_error_response(),
        _ => None,
    }
}

fn is_revert(payload: &JsonRpcError) -> bool {
    payload.code == 3 || payload.message.contains("revert")
}
