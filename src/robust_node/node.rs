use std::{fmt, sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, Bytes, TxHash},
    rpc::types::Log,
    transports::TransportResult,
};
use backon::Retryable;
use parking_lot::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{
    TailError,
    robust_node::{ChainClient, FibonacciBackoff},
    types::{Block, LogQuery, Receipt},
};

/// Open/closed state of a node connection.
///
/// `closed` refuses new calls and interrupts backoff sleeps; `aborted` additionally drops calls
/// that are already in flight.
#[derive(Clone, Debug, Default)]
pub(crate) struct Connection {
    closed: CancellationToken,
    aborted: CancellationToken,
}

impl Connection {
    fn child(&self) -> Self {
        Self { closed: self.closed.child_token(), aborted: self.aborted.child_token() }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// A [`ChainClient`] wrapped with per-call timeouts and Fibonacci backoff retries.
///
/// Every remote call the tail makes goes through here. Transient failures (transport errors,
/// timeouts and `null` answers) are retried; once the connection is closed the retry loop stops
/// and the last observed error is returned.
pub struct RobustNode<C> {
    pub(crate) client: Arc<C>,
    pub(crate) connection: Connection,
    pub(crate) call_timeout: Duration,
    pub(crate) backoff: FibonacciBackoff,
}

impl<C> Clone for RobustNode<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            connection: self.connection.clone(),
            call_timeout: self.call_timeout,
            backoff: self.backoff,
        }
    }
}

impl<C> fmt::Debug for RobustNode<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobustNode")
            .field("closed", &self.connection.is_closed())
            .field("call_timeout", &self.call_timeout)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl<C: ChainClient> RobustNode<C> {
    /// The wrapped client.
    #[must_use]
    pub fn client(&self) -> &C {
        &self.client
    }

    /// A handle sharing this node's client whose connection is a child of this one.
    ///
    /// Closing the parent closes the child; closing the child leaves the parent open.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self { connection: self.connection.child(), ..self.clone() }
    }

    /// Tear the connection down.
    ///
    /// A graceful close refuses new calls and stops retrying; a hard close also abandons calls
    /// that are still waiting on the node. Calling it again is a no-op.
    pub fn close(&self, graceful: bool) {
        debug!(graceful = graceful, "Closing node connection");
        self.connection.closed.cancel();
        if !graceful {
            self.connection.aborted.cancel();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Current chain height.
    pub async fn block_number(&self) -> Result<u64, TailError> {
        self.retry("eth_blockNumber", |client| async move { client.block_number().await.map(Some) })
            .await
    }

    /// Block at `number` with its transactions. A `null` block is retried.
    pub async fn block_by_number(&self, number: u64) -> Result<Block, TailError> {
        self.retry("eth_getBlockByNumber", |client| async move {
            client.block_by_number(number).await
        })
        .await
    }

    /// Logs matching `query`.
    pub async fn logs(&self, query: &LogQuery) -> Result<Vec<Log>, TailError> {
        self.retry("eth_getLogs", |client| async move { client.logs(query).await.map(Some) })
            .await
    }

    /// Receipt of `hash`. A missing receipt is retried like any other `null` answer.
    pub async fn transaction_receipt(&self, hash: TxHash) -> Result<Receipt, TailError> {
        self.retry("eth_getTransactionReceipt", |client| async move {
            client.transaction_receipt(hash).await
        })
        .await
    }

    /// Bytecode of `address` as of `number`.
    pub async fn code_at(&self, address: Address, number: u64) -> Result<Bytes, TailError> {
        self.retry("eth_getCode", |client| async move {
            client.code_at(address, number).await.map(Some)
        })
        .await
    }

    /// Run `operation` with retries, a per-attempt timeout and the Fibonacci backoff.
    ///
    /// # Errors
    ///
    /// * [`TailError::ConnectionClosed`] if the connection was closed before the first attempt.
    /// * The last transient error once attempts are exhausted or the connection closes while
    ///   retrying.
    /// * Any non-transient error as soon as it occurs.
    pub(crate) async fn retry<'a, T, F, Fut>(
        &'a self,
        method: &'static str,
        operation: F,
    ) -> Result<T, TailError>
    where
        F: Fn(&'a C) -> Fut,
        Fut: Future<Output = TransportResult<Option<T>>>,
    {
        let last_error = &Mutex::new(None::<TailError>);
        let operation = &operation;
        let closed = self.connection.closed.clone();

        let result = (|| async move {
            if self.connection.is_closed() {
                return Err(last_error.lock().take().unwrap_or(TailError::ConnectionClosed));
            }
            self.attempt(method, operation(self.client.as_ref())).await
        })
        .retry(self.backoff)
        .when(|err: &TailError| err.is_transient() && !self.connection.is_closed())
        .notify(|err: &TailError, delay: Duration| {
            warn!(
                method = method,
                error = %err,
                delay_ms = delay.as_millis(),
                "RPC call failed, retrying"
            );
            *last_error.lock() = Some(err.clone());
        })
        .sleep(move |delay| {
            let closed = closed.clone();
            async move {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = closed.cancelled_owned() => {}
                }
            }
        })
        .await;

        if let Err(err) = &result {
            error!(method = method, error = %err, "RPC call failed");
        }
        result
    }

    async fn attempt<T, Fut>(&self, method: &'static str, call: Fut) -> Result<T, TailError>
    where
        Fut: Future<Output = TransportResult<Option<T>>>,
    {
        trace!(method = method, "RPC call");
        tokio::select! {
            biased;
            () = self.connection.aborted.cancelled() => Err(TailError::ConnectionClosed),
            answer = timeout(self.call_timeout, call) => {
                answer?.map_err(TailError::from)?.ok_or(TailError::EmptyResponse(method))
            }
        }
    }
}
