//! Setup Procedures
//!
//! Generic request/response procedure with retry-with-wait, used for the
//! F1 Setup towards the CU. Transaction ids come from a per-endpoint pool;
//! responses to a transaction that is no longer open are dropped. The
//! procedure task suspends only on the response, the wait timer and the
//! cancellation channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Response to an outstanding setup transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Peer accepted the request
    Success,
    /// Peer rejected the request
    Failure {
        /// Wait before retrying, when the peer granted one
        time_to_wait: Option<Duration>,
        /// Human-readable cause
        cause: String,
    },
}

/// Terminal state of a setup procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupResult {
    /// Procedure completed successfully
    Success,
    /// Procedure failed; retries exhausted or no wait granted
    Failed(String),
    /// No response within the configured timeout
    Timeout,
    /// Procedure aborted through the cancellation channel
    Cancelled,
}

/// Outbound side of a setup procedure: encodes and sends the request PDU.
pub trait SetupRequestNotifier: Send + Sync {
    /// Send the request carrying the given transaction id
    fn on_setup_request(&self, transaction_id: u32);
}

/// Per-endpoint pool of transaction ids with the open-response channels
#[derive(Default)]
pub struct TransactionManager {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<SetupOutcome>>>,
}

impl TransactionManager {
    /// Open a transaction; the receiver resolves with the peer's outcome.
    pub fn create_transaction(&self) -> (u32, oneshot::Receiver<SetupOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver a response. Returns false (and drops the response) when the
    /// transaction is not open, e.g. a duplicate response.
    pub fn handle_response(&self, transaction_id: u32, outcome: SetupOutcome) -> bool {
        match self.pending.lock().remove(&transaction_id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => {
                debug!("response for closed transaction {} dropped", transaction_id);
                false
            }
        }
    }

    /// Close a transaction without a response (timeout or abort)
    pub fn close(&self, transaction_id: u32) {
        self.pending.lock().remove(&transaction_id);
    }

    /// Number of open transactions
    pub fn nof_open(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Cancellation handle for a running setup procedure
pub struct SetupCancelHandle {
    tx: watch::Sender<bool>,
}

impl SetupCancelHandle {
    /// Abort the procedure: the open transaction and any running wait
    /// timer terminate together.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Retry-with-wait setup procedure
pub struct SetupProcedure {
    name: &'static str,
    max_retries: u32,
    response_timeout: Duration,
    notifier: Arc<dyn SetupRequestNotifier>,
    transactions: Arc<TransactionManager>,
    cancel_rx: watch::Receiver<bool>,
}

impl SetupProcedure {
    /// Build a procedure and its cancellation handle
    pub fn new(
        name: &'static str,
        max_retries: u32,
        response_timeout: Duration,
        notifier: Arc<dyn SetupRequestNotifier>,
        transactions: Arc<TransactionManager>,
    ) -> (Self, SetupCancelHandle) {
        let (tx, cancel_rx) = watch::channel(false);
        (
            Self {
                name,
                max_retries,
                response_timeout,
                notifier,
                transactions,
                cancel_rx,
            },
            SetupCancelHandle { tx },
        )
    }

    /// Drive the procedure to a terminal state.
    ///
    /// One transaction per attempt; a failure carrying a time-to-wait
    /// re-enters the awaiting state after the wait, until `max_retries`
    /// attempts have been made.
    pub async fn run(mut self) -> SetupResult {
        let mut attempt = 0u32;
        loop {
            let (transaction_id, response) = self.transactions.create_transaction();
            attempt += 1;
            info!("{}: sending request (attempt {}/{})", self.name, attempt, self.max_retries);
            self.notifier.on_setup_request(transaction_id);

            let outcome = tokio::select! {
                resp = response => match resp {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!("{}: transaction {} channel lost", self.name, transaction_id);
                        return SetupResult::Failed("transaction channel lost".to_string());
                    }
                },
                _ = tokio::time::sleep(self.response_timeout) => {
                    warn!("{}: no response for transaction {} within {:?}", self.name, transaction_id, self.response_timeout);
                    self.transactions.close(transaction_id);
                    return SetupResult::Timeout;
                }
                _ = wait_cancelled(&mut self.cancel_rx) => {
                    info!("{}: aborted while awaiting transaction {}", self.name, transaction_id);
                    self.transactions.close(transaction_id);
                    return SetupResult::Cancelled;
                }
            };

            match outcome {
                SetupOutcome::Success => {
                    info!("{}: completed successfully after {} attempt(s)", self.name, attempt);
                    return SetupResult::Success;
                }
                SetupOutcome::Failure { time_to_wait: Some(wait), .. } if attempt < self.max_retries => {
                    debug!(
                        "{}: failure with time-to-wait, retrying in {:?} ({}/{})",
                        self.name, wait, attempt, self.max_retries
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = wait_cancelled(&mut self.cancel_rx) => {
                            info!("{}: aborted during retry wait", self.name);
                            return SetupResult::Cancelled;
                        }
                    }
                }
                SetupOutcome::Failure { time_to_wait, cause } => {
                    if time_to_wait.is_some() {
                        error!("{}: reached maximum number of setup retries ({})", self.name, self.max_retries);
                    } else {
                        error!("{}: failure without retry waiting time: {}", self.name, cause);
                    }
                    return SetupResult::Failed(cause);
                }
            }
        }
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // Handle dropped without cancelling; never resolve.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use tokio::time::Instant;

    /// Notifier answering each request after a scripted outcome list.
    struct ScriptedPeer {
        transactions: Arc<TransactionManager>,
        outcomes: PlMutex<Vec<SetupOutcome>>,
        request_times: PlMutex<Vec<Instant>>,
    }

    impl ScriptedPeer {
        fn new(transactions: Arc<TransactionManager>, outcomes: Vec<SetupOutcome>) -> Arc<Self> {
            Arc::new(Self {
                transactions,
                outcomes: PlMutex::new(outcomes),
                request_times: PlMutex::new(Vec::new()),
            })
        }
    }

    impl SetupRequestNotifier for ScriptedPeer {
        fn on_setup_request(&self, transaction_id: u32) {
            self.request_times.lock().push(Instant::now());
            let outcome = self.outcomes.lock().remove(0);
            let transactions = Arc::clone(&self.transactions);
            tokio::spawn(async move {
                transactions.handle_response(transaction_id, outcome);
            });
        }
    }

    fn failure_with_wait(secs: u64) -> SetupOutcome {
        SetupOutcome::Failure {
            time_to_wait: Some(Duration::from_secs(secs)),
            cause: "cu overload".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_wait_until_success() {
        const MAX_RETRIES: u32 = 3;
        let transactions = Arc::new(TransactionManager::default());
        // max_setup_retries - 1 failures with a 2 s wait, then success.
        let peer = ScriptedPeer::new(
            Arc::clone(&transactions),
            vec![failure_with_wait(2), failure_with_wait(2), SetupOutcome::Success],
        );
        let (procedure, _cancel) = SetupProcedure::new(
            "F1 Setup",
            MAX_RETRIES,
            Duration::from_secs(5),
            peer.clone(),
            Arc::clone(&transactions),
        );

        assert_eq!(procedure.run().await, SetupResult::Success);

        let times = peer.request_times.lock();
        assert_eq!(times.len(), MAX_RETRIES as usize, "exactly max_setup_retries transactions");
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(2), "each retry waited the commanded time");
        }
        assert_eq!(transactions.nof_open(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_fails() {
        let transactions = Arc::new(TransactionManager::default());
        let peer = ScriptedPeer::new(
            Arc::clone(&transactions),
            vec![failure_with_wait(1), failure_with_wait(1)],
        );
        let (procedure, _cancel) =
            SetupProcedure::new("F1 Setup", 2, Duration::from_secs(5), peer.clone(), Arc::clone(&transactions));

        match procedure.run().await {
            SetupResult::Failed(cause) => assert_eq!(cause, "cu overload"),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(peer.request_times.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_wait_does_not_retry() {
        let transactions = Arc::new(TransactionManager::default());
        let peer = ScriptedPeer::new(
            Arc::clone(&transactions),
            vec![SetupOutcome::Failure {
                time_to_wait: None,
                cause: "misconfigured".to_string(),
            }],
        );
        let (procedure, _cancel) =
            SetupProcedure::new("F1 Setup", 5, Duration::from_secs(5), peer.clone(), Arc::clone(&transactions));

        assert!(matches!(procedure.run().await, SetupResult::Failed(_)));
        assert_eq!(peer.request_times.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_times_out() {
        struct SilentPeer;
        impl SetupRequestNotifier for SilentPeer {
            fn on_setup_request(&self, _transaction_id: u32) {}
        }

        let transactions = Arc::new(TransactionManager::default());
        let (procedure, _cancel) = SetupProcedure::new(
            "F1 Setup",
            3,
            Duration::from_secs(5),
            Arc::new(SilentPeer),
            Arc::clone(&transactions),
        );
        assert_eq!(procedure.run().await, SetupResult::Timeout);
        assert_eq!(transactions.nof_open(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_transaction_and_timer() {
        struct SilentPeer;
        impl SetupRequestNotifier for SilentPeer {
            fn on_setup_request(&self, _transaction_id: u32) {}
        }

        let transactions = Arc::new(TransactionManager::default());
        let (procedure, cancel) = SetupProcedure::new(
            "F1 Setup",
            3,
            Duration::from_secs(3600),
            Arc::new(SilentPeer),
            Arc::clone(&transactions),
        );
        let handle = tokio::spawn(procedure.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), SetupResult::Cancelled);
        assert_eq!(transactions.nof_open(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_dropped() {
        let transactions = TransactionManager::default();
        let (id, rx) = transactions.create_transaction();
        assert!(transactions.handle_response(id, SetupOutcome::Success));
        assert_eq!(rx.await.unwrap(), SetupOutcome::Success);
        // Second response to the same id is dropped.
        assert!(!transactions.handle_response(id, SetupOutcome::Success));
        // Response to a never-opened id is dropped too.
        assert!(!transactions.handle_response(999, SetupOutcome::Success));
    }
}
