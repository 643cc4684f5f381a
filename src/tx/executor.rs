//! The execution engine: turns "call this contract method" into a nonced,
//! priced, retried transaction from one of the pool's signers.

use super::gas::GasEstimator;
use super::nonce::PendingNonceTable;
use super::selector::SignerSelector;
use super::sender::{SubmitRequest, Submitter};
use crate::chain::{RpcClient, Signer, SignerPool};
use crate::config::RetryConfig;
use crate::error::{EngineError, EngineResult, SubmissionError};
use crate::metrics;

use chrono::{DateTime, Utc};
use ethers::abi::Token;
use ethers::types::{Address, TransactionReceipt, H256, U256};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Per-call options for [`Executor::execute`]
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Abort instead of retrying when a failure shows no sign of reaching the node
    pub abort_unless_unconfirmed_rpc_error: bool,
    /// Span to log the call under; defaults to one with a fresh request id
    pub span: Option<Span>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            abort_unless_unconfirmed_rpc_error: true,
            span: None,
        }
    }
}

impl ExecuteOptions {
    pub fn strict(abort_unless_unconfirmed_rpc_error: bool) -> Self {
        Self {
            abort_unless_unconfirmed_rpc_error,
            ..Self::default()
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}

/// A transaction accepted by the network
#[derive(Debug, Clone, Serialize)]
pub struct TransactionHandle {
    pub hash: H256,
    pub signer: Address,
    pub nonce: U256,
    pub gas_price: U256,
    pub attempts: u32,
    pub receipt: Option<TransactionReceipt>,
    pub submitted_at: DateTime<Utc>,
}

/// Where a call's submission loop stands
#[derive(Debug)]
enum RetryState {
    Attempting { attempt: u32 },
    Retryable { attempt: u32, error: SubmissionError },
    Aborted(EngineError),
    Exhausted { attempts: u32, error: SubmissionError },
    Succeeded(TransactionHandle),
}

/// State after attempt `attempt` failed with `error`
fn after_failure(attempt: u32, max_attempts: u32, error: SubmissionError, strict: bool) -> RetryState {
    match error {
        SubmissionError::Abort(reason) => RetryState::Aborted(EngineError::Abort { reason }),
        SubmissionError::PreBroadcast(message) if strict => {
            RetryState::Aborted(EngineError::PreBroadcast { message })
        }
        error if attempt >= max_attempts => RetryState::Exhausted {
            attempts: attempt,
            error,
        },
        error => RetryState::Retryable { attempt, error },
    }
}

/// Executes contract calls through the shared signer pool
pub struct Executor<R, S> {
    pool: Arc<SignerPool>,
    pending: Arc<PendingNonceTable>,
    selector: SignerSelector,
    rpc: R,
    submitter: S,
    retry: RetryConfig,
}

impl<R: RpcClient, S: Submitter> Executor<R, S> {
    pub fn new(
        pool: Arc<SignerPool>,
        pending: Arc<PendingNonceTable>,
        rpc: R,
        submitter: S,
        retry: RetryConfig,
    ) -> Self {
        Self {
            pool,
            pending,
            selector: SignerSelector::new(),
            rpc,
            submitter,
            retry,
        }
    }

    pub fn pool(&self) -> &SignerPool {
        &self.pool
    }

    /// Pending reservation count per signer
    pub fn pending_by_signer(&self) -> EngineResult<Vec<(Address, u64)>> {
        Ok(self
            .pool
            .addresses()?
            .into_iter()
            .map(|address| (address, self.pending.pending(address)))
            .collect())
    }

    /// Call `method(params)` from one of the pool's signers
    ///
    /// The reservation taken for the call is released on every exit path
    /// before the result is returned.
    pub async fn execute(
        &self,
        method: &str,
        params: Vec<Token>,
        options: ExecuteOptions,
    ) -> EngineResult<TransactionHandle> {
        let span = options.span.unwrap_or_else(|| {
            info_span!("execute", request_id = %Uuid::new_v4(), method = %method)
        });

        self.run(method, &params, options.abort_unless_unconfirmed_rpc_error)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        method: &str,
        params: &[Token],
        strict: bool,
    ) -> EngineResult<TransactionHandle> {
        let signer = self.select_signer()?;
        let address = signer.address();

        let on_chain = self.rpc.transaction_count(address).await?;

        let reservation = self.pending.reserve(address);
        let nonce = on_chain + U256::from(reservation.snapshot());
        metrics::record_pending(address, self.pending.pending(address));
        debug!("Signer {:?} reserved nonce {} (on-chain {})", address, nonce, on_chain);

        let outcome = match self.rpc.gas_price().await {
            Ok(base_price) => {
                self.submit_with_retry(&signer, method, params, nonce, base_price, strict)
                    .await
            }
            Err(e) => Err(e),
        };

        reservation.release();
        metrics::record_pending(address, self.pending.pending(address));

        match &outcome {
            Ok(handle) => {
                info!(
                    "{} executed as {:?} from {:?} after {} attempt(s)",
                    method, handle.hash, address, handle.attempts
                );
                metrics::record_execution("success");
            }
            Err(e) => {
                error!("{} failed from {:?}: {}", method, address, e);
                metrics::record_execution(outcome_label(e));
            }
        }

        outcome
    }

    fn select_signer(&self) -> EngineResult<Arc<Signer>> {
        let signers = self.pool.signers()?;
        let pending = self.pending.snapshot(signers.iter().map(|s| s.address()));

        let index = self
            .selector
            .sample(&pending)
            .ok_or_else(|| EngineError::Config("signer pool is empty".to_string()))?;

        debug!("Selected signer {} of {} (pending {:?})", index, signers.len(), pending);
        Ok(signers[index].clone())
    }

    async fn submit_with_retry(
        &self,
        signer: &Signer,
        method: &str,
        params: &[Token],
        nonce: U256,
        base_price: U256,
        strict: bool,
    ) -> EngineResult<TransactionHandle> {
        let mut state = RetryState::Attempting { attempt: 1 };

        loop {
            state = match state {
                RetryState::Attempting { attempt } => {
                    let request = SubmitRequest {
                        method,
                        params,
                        nonce,
                        gas_price: GasEstimator::escalated_price(base_price, attempt),
                        attempt,
                    };
                    debug!(
                        "Submitting {} with nonce {} at gas price {} (attempt {}/{})",
                        method, nonce, request.gas_price, attempt, self.retry.max_attempts
                    );

                    match self.submitter.submit(signer, &request).await {
                        Ok(submitted) => {
                            metrics::record_attempt("success");
                            RetryState::Succeeded(TransactionHandle {
                                hash: submitted.hash,
                                signer: signer.address(),
                                nonce,
                                gas_price: request.gas_price,
                                attempts: attempt,
                                receipt: submitted.receipt,
                                submitted_at: Utc::now(),
                            })
                        }
                        Err(error) => {
                            metrics::record_attempt(error.kind());
                            after_failure(attempt, self.retry.max_attempts, error, strict)
                        }
                    }
                }
                RetryState::Retryable { attempt, error } => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.retry.max_attempts, error, delay
                    );
                    tokio::time::sleep(delay).await;
                    RetryState::Attempting {
                        attempt: attempt + 1,
                    }
                }
                RetryState::Aborted(error) => return Err(error),
                RetryState::Exhausted { attempts, error } => {
                    return Err(EngineError::ExhaustedRetries {
                        attempts,
                        last: error,
                    })
                }
                RetryState::Succeeded(handle) => return Ok(handle),
            };
        }
    }
}

fn outcome_label(error: &EngineError) -> &'static str {
    match error {
        EngineError::Abort { .. } => "abort",
        EngineError::PreBroadcast { .. } => "pre_broadcast",
        EngineError::ExhaustedRetries { .. } => "exhausted",
        EngineError::NonceFetch { .. } => "nonce_fetch",
        _ => "config",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::rpc::MockRpcClient;
    use crate::chain::tests::test_pool;
    use crate::tx::sender::Submitted;
    use async_trait::async_trait;
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tokio::time::Instant;

    const ON_CHAIN_NONCE: u64 = 41;
    const BASE_PRICE: u64 = 1_000_000_000;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        signer: Address,
        nonce: U256,
        gas_price: U256,
        attempt: u32,
    }

    /// Plays back scripted outcomes, then succeeds
    #[derive(Default)]
    struct ScriptedSubmitter {
        script: Mutex<VecDeque<Result<Submitted, SubmissionError>>>,
        calls: Mutex<Vec<Call>>,
        barrier: Option<Barrier>,
    }

    impl ScriptedSubmitter {
        fn with_script(script: Vec<Result<Submitted, SubmissionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Submitter for ScriptedSubmitter {
        async fn submit(
            &self,
            signer: &Signer,
            request: &SubmitRequest<'_>,
        ) -> Result<Submitted, SubmissionError> {
            self.calls.lock().unwrap().push(Call {
                signer: signer.address(),
                nonce: request.nonce,
                gas_price: request.gas_price,
                attempt: request.attempt,
            });
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Ok(Submitted {
                    hash: H256::random(),
                    receipt: None,
                })
            })
        }
    }

    fn rpc() -> MockRpcClient {
        let mut rpc = MockRpcClient::new();
        rpc.expect_transaction_count()
            .returning(|_| Ok(U256::from(ON_CHAIN_NONCE)));
        rpc.expect_gas_price()
            .returning(|| Ok(U256::from(BASE_PRICE)));
        rpc
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        }
    }

    fn executor(
        signers: usize,
        rpc: MockRpcClient,
        submitter: Arc<ScriptedSubmitter>,
        max_attempts: u32,
    ) -> (Executor<MockRpcClient, Arc<ScriptedSubmitter>>, Arc<PendingNonceTable>) {
        let (pool, pending) = test_pool(signers);
        let executor = Executor::new(pool, pending.clone(), rpc, submitter, retry(max_attempts));
        (executor, pending)
    }

    fn transient(message: &str) -> Result<Submitted, SubmissionError> {
        Err(SubmissionError::transient(message))
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let submitter = ScriptedSubmitter::with_script(vec![
            transient("nonce too low"),
            transient("replacement transaction underpriced"),
        ]);
        let (executor, pending) = executor(1, rpc(), submitter.clone(), 5);
        let start = Instant::now();

        let handle = executor
            .execute("transfer", vec![], ExecuteOptions::default())
            .await
            .unwrap();

        let calls = submitter.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls.iter().map(|c| c.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let base = U256::from(BASE_PRICE);
        assert_eq!(
            calls.iter().map(|c| c.gas_price).collect::<Vec<_>>(),
            vec![base, base * 2, base * 3]
        );
        assert!(calls.iter().all(|c| c.nonce == U256::from(ON_CHAIN_NONCE)));

        assert_eq!(handle.attempts, 3);
        assert_eq!(handle.nonce, U256::from(ON_CHAIN_NONCE));
        assert_eq!(handle.gas_price, base * 3);
        assert_eq!(pending.pending(handle.signer), 0);
        assert!(start.elapsed() >= Duration::from_millis(100 + 200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error_and_releases() {
        let submitter = ScriptedSubmitter::with_script(vec![
            transient("timeout"),
            transient("timeout"),
            transient("header not found"),
        ]);
        let (executor, pending) = executor(1, rpc(), submitter.clone(), 3);

        let err = executor
            .execute("transfer", vec![], ExecuteOptions::default())
            .await
            .unwrap_err();

        match err {
            EngineError::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("header not found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(submitter.calls().len(), 3);
        assert_eq!(pending.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_short_circuits_without_delay() {
        let submitter = ScriptedSubmitter::with_script(vec![Err(SubmissionError::Abort(
            "execution reverted: insufficient balance".to_string(),
        ))]);
        let (executor, pending) = executor(1, rpc(), submitter.clone(), 5);
        let start = Instant::now();

        let err = executor
            .execute("transfer", vec![], ExecuteOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Abort { .. }));
        assert_eq!(submitter.calls().len(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(pending.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_mode_aborts_before_broadcast() {
        let submitter = ScriptedSubmitter::with_script(vec![Err(SubmissionError::PreBroadcast(
            "connection refused".to_string(),
        ))]);
        let (executor, pending) = executor(1, rpc(), submitter.clone(), 5);

        let err = executor
            .execute("transfer", vec![], ExecuteOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::PreBroadcast { .. }));
        assert_eq!(submitter.calls().len(), 1);
        assert_eq!(pending.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lenient_mode_retries_pre_broadcast_failures() {
        let submitter = ScriptedSubmitter::with_script(vec![Err(SubmissionError::PreBroadcast(
            "connection refused".to_string(),
        ))]);
        let (executor, pending) = executor(1, rpc(), submitter.clone(), 5);

        let handle = executor
            .execute("transfer", vec![], ExecuteOptions::strict(false))
            .await
            .unwrap();

        assert_eq!(handle.attempts, 2);
        assert_eq!(submitter.calls().len(), 2);
        assert_eq!(pending.total(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_gap_free_nonces() {
        const CALLS: usize = 6;
        let submitter = Arc::new(ScriptedSubmitter {
            barrier: Some(Barrier::new(CALLS)),
            ..ScriptedSubmitter::default()
        });
        let (executor, pending) = executor(1, rpc(), submitter.clone(), 1);
        let executor = Arc::new(executor);

        let tasks: Vec<_> = (0..CALLS)
            .map(|_| {
                let executor = executor.clone();
                tokio::spawn(async move {
                    executor
                        .execute("transfer", vec![], ExecuteOptions::default())
                        .await
                })
            })
            .collect();

        let handles: Vec<TransactionHandle> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let nonces: BTreeSet<U256> = handles.iter().map(|h| h.nonce).collect();
        let expected: BTreeSet<U256> = (0..CALLS as u64)
            .map(|i| U256::from(ON_CHAIN_NONCE + i))
            .collect();
        assert_eq!(nonces, expected);
        assert_eq!(pending.total(), 0);
    }

    #[tokio::test]
    async fn test_gas_price_failure_releases_reservation() {
        let mut rpc = MockRpcClient::new();
        rpc.expect_transaction_count()
            .returning(|_| Ok(U256::from(ON_CHAIN_NONCE)));
        rpc.expect_gas_price().returning(|| {
            Err(EngineError::NonceFetch {
                message: "eth_gasPrice failed".to_string(),
            })
        });
        let submitter = ScriptedSubmitter::with_script(vec![]);
        let (executor, pending) = executor(2, rpc, submitter.clone(), 5);

        let err = executor
            .execute("transfer", vec![], ExecuteOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::NonceFetch { .. }));
        assert!(submitter.calls().is_empty());
        assert_eq!(pending.total(), 0);
    }

    #[tokio::test]
    async fn test_nonce_fetch_failure_surfaces() {
        let mut rpc = MockRpcClient::new();
        rpc.expect_transaction_count().returning(|_| {
            Err(EngineError::NonceFetch {
                message: "eth_getTransactionCount failed".to_string(),
            })
        });
        rpc.expect_gas_price().never();
        let submitter = ScriptedSubmitter::with_script(vec![]);
        let (executor, pending) = executor(1, rpc, submitter.clone(), 5);

        let result = executor
            .execute("transfer", vec![], ExecuteOptions::default())
            .await;

        tokio_test::assert_err!(result);
        assert!(submitter.calls().is_empty());
        assert_eq!(pending.total(), 0);
    }

    #[tokio::test]
    async fn test_release_restores_pre_call_counts() {
        let submitter = ScriptedSubmitter::with_script(vec![Err(SubmissionError::Abort(
            "reverted".to_string(),
        ))]);
        let (executor, pending) = executor(1, rpc(), submitter.clone(), 5);
        let address = executor.pool().addresses().unwrap()[0];

        let held = pending.reserve(address);
        assert_eq!(pending.pending(address), 1);

        let aborted = executor
            .execute("transfer", vec![], ExecuteOptions::default())
            .await;
        tokio_test::assert_err!(aborted);
        assert_eq!(pending.pending(address), 1);

        let ok = executor
            .execute("transfer", vec![], ExecuteOptions::default())
            .await;
        let handle = tokio_test::assert_ok!(ok);
        assert_eq!(handle.nonce, U256::from(ON_CHAIN_NONCE + 1));
        assert_eq!(pending.pending(address), 1);

        held.release();
        assert_eq!(executor.pending_by_signer().unwrap(), vec![(address, 0)]);
    }

    #[test]
    fn test_failure_classification() {
        let aborted = after_failure(1, 5, SubmissionError::Abort("revert".into()), false);
        assert!(matches!(aborted, RetryState::Aborted(EngineError::Abort { .. })));

        let strict = after_failure(1, 5, SubmissionError::PreBroadcast("io".into()), true);
        assert!(matches!(strict, RetryState::Aborted(EngineError::PreBroadcast { .. })));

        let lenient = after_failure(1, 5, SubmissionError::PreBroadcast("io".into()), false);
        assert!(matches!(lenient, RetryState::Retryable { attempt: 1, .. }));

        let last = after_failure(5, 5, SubmissionError::transient("rpc"), true);
        assert!(matches!(last, RetryState::Exhausted { attempts: 5, .. }));
    }
}
