//! Per-UE Executors
//!
//! Each UE gets three cancellable executors (ctrl, UL PDU, DL PDU) mapped
//! onto one priority strand from a round-robin pool, plus a reference to the
//! shared crypto executor that runs unconstrained across the worker pool.
//!
//! Teardown contract: `stop()` flips the cancel flag, then drains the DL,
//! UL and ctrl lanes in that order with barrier tasks submitted on the
//! unwrapped executors. Once `stop()` resolves, no cancelled-path task body
//! will run again; tasks submitted while cancelled are accepted but no-op.
//!
//! UE-to-strand dispatch is plain round-robin and deliberately independent
//! of the scheduler's radio fairness: strands spread transport work evenly
//! across lanes, the scheduler ranks grants. The two compose because slot
//! processing runs entirely on the cell strand.

use crate::strand::{PriorityStrand, Strand};
use crate::{FabricError, InlineExecutor, SharedExecutor, TaskExecutor, UniqueTask};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::error;

/// Executor adaptor that drops task bodies once the shared flag is set.
#[derive(Clone)]
pub struct CancellableExecutor {
    inner: SharedExecutor,
    cancelled: Arc<AtomicBool>,
}

impl CancellableExecutor {
    fn new(inner: SharedExecutor, cancelled: Arc<AtomicBool>) -> Self {
        Self { inner, cancelled }
    }

    /// Submit a completion barrier on the unwrapped executor, bypassing the
    /// cancelled flag. The returned receiver resolves once every task
    /// enqueued before the barrier has left the lane.
    pub fn barrier(&self) -> Result<oneshot::Receiver<()>, FabricError> {
        let (tx, rx) = oneshot::channel();
        self.inner.defer(Box::new(move || {
            let _ = tx.send(());
        }))?;
        Ok(rx)
    }
}

impl TaskExecutor for CancellableExecutor {
    fn execute(&self, task: UniqueTask) -> Result<(), FabricError> {
        let cancelled = Arc::clone(&self.cancelled);
        self.inner.execute(Box::new(move || {
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            task();
        }))
    }

    fn defer(&self, task: UniqueTask) -> Result<(), FabricError> {
        let cancelled = Arc::clone(&self.cancelled);
        self.inner.defer(Box::new(move || {
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            task();
        }))
    }
}

/// The three per-UE executors plus the shared crypto executor
pub struct UeExecutorMapper {
    cancelled: Arc<AtomicBool>,
    ctrl: CancellableExecutor,
    ul_pdu: CancellableExecutor,
    dl_pdu: CancellableExecutor,
    crypto: SharedExecutor,
}

impl UeExecutorMapper {
    /// Build a mapper over the given lanes
    pub fn new(
        ctrl: SharedExecutor,
        ul_pdu: SharedExecutor,
        dl_pdu: SharedExecutor,
        crypto: SharedExecutor,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        Self {
            ctrl: CancellableExecutor::new(ctrl, Arc::clone(&cancelled)),
            ul_pdu: CancellableExecutor::new(ul_pdu, Arc::clone(&cancelled)),
            dl_pdu: CancellableExecutor::new(dl_pdu, Arc::clone(&cancelled)),
            crypto,
            cancelled,
        }
    }

    /// Control/timer executor
    pub fn ctrl_executor(&self) -> &CancellableExecutor {
        &self.ctrl
    }

    /// UL PDU executor
    pub fn ul_pdu_executor(&self) -> &CancellableExecutor {
        &self.ul_pdu
    }

    /// DL PDU executor
    pub fn dl_pdu_executor(&self) -> &CancellableExecutor {
        &self.dl_pdu
    }

    /// Shared crypto executor (not cancellable, not sequential)
    pub fn crypto_executor(&self) -> &SharedExecutor {
        &self.crypto
    }

    /// Whether the mapper has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancel and drain.
    ///
    /// Resolves once no task that could still observe the UE remains in any
    /// of the three lanes. Safe to call more than once; later calls drain
    /// again without re-flipping the flag.
    pub async fn stop(&self) -> Result<(), FabricError> {
        self.cancelled.store(true, Ordering::Release);
        // Flush data lanes first, ctrl last, so cleanup scheduled on ctrl
        // observes both PDU lanes already quiesced.
        self.dl_pdu.barrier()?.await.map_err(|_| FabricError::DrainFailed)?;
        self.ul_pdu.barrier()?.await.map_err(|_| FabricError::DrainFailed)?;
        self.ctrl.barrier()?.await.map_err(|_| FabricError::DrainFailed)?;
        Ok(())
    }
}

impl Drop for UeExecutorMapper {
    fn drop(&mut self) {
        if !self.cancelled.load(Ordering::Relaxed) {
            error!("UE executor mapper destroyed before its tasks were cancelled");
        }
    }
}

/// Round-robin pool of UE priority strands.
///
/// `max_nof_ue_strands` strands are pre-built over the base executor; each
/// new UE is assigned the next strand modulo the pool size, so UEs spread
/// uniformly over the lanes.
pub struct UeExecutorPool {
    strands: Vec<Arc<PriorityStrand>>,
    crypto: SharedExecutor,
    rr_index: AtomicUsize,
}

/// Priority levels inside a UE strand
const UE_PRIO_CTRL: usize = 0;
const UE_PRIO_UL: usize = 1;
const UE_PRIO_DL: usize = 2;

impl UeExecutorPool {
    /// Build the strand pool.
    ///
    /// `ctrl_queue_size` bounds the control lane, `data_queue_size` the UL
    /// and DL PDU lanes.
    pub fn new(
        base: SharedExecutor,
        crypto: SharedExecutor,
        max_nof_ue_strands: usize,
        ctrl_queue_size: usize,
        data_queue_size: usize,
    ) -> Result<Self, FabricError> {
        if max_nof_ue_strands == 0 {
            return Err(FabricError::InvalidConfig);
        }
        let sizes = [ctrl_queue_size, data_queue_size, data_queue_size];
        let strands = (0..max_nof_ue_strands)
            .map(|_| Arc::new(PriorityStrand::new(Arc::clone(&base), &sizes)))
            .collect();
        Ok(Self {
            strands,
            crypto,
            rr_index: AtomicUsize::new(0),
        })
    }

    /// Create the executor mapper for a newly admitted UE
    pub fn create_ue_executor_mapper(&self) -> UeExecutorMapper {
        let idx = self.rr_index.fetch_add(1, Ordering::Relaxed) % self.strands.len();
        let strand = &self.strands[idx];
        UeExecutorMapper::new(
            Arc::new(strand.executor(UE_PRIO_CTRL)),
            Arc::new(strand.executor(UE_PRIO_UL)),
            Arc::new(strand.executor(UE_PRIO_DL)),
            Arc::clone(&self.crypto),
        )
    }
}

/// UL I/O executor: inline on the caller or a dedicated strand, selected by
/// the `dedicated_io_strand` configuration option.
pub enum IoUlExecutor {
    /// Run I/O completions on the caller's thread
    Inline(InlineExecutor),
    /// Sequentialize I/O completions on their own strand
    Dedicated(Strand),
}

impl IoUlExecutor {
    /// Build according to configuration
    pub fn new(dedicated: bool, base: SharedExecutor, queue_size: usize) -> Self {
        if dedicated {
            IoUlExecutor::Dedicated(Strand::new(base, queue_size))
        } else {
            IoUlExecutor::Inline(InlineExecutor)
        }
    }
}

impl TaskExecutor for IoUlExecutor {
    fn execute(&self, task: UniqueTask) -> Result<(), FabricError> {
        match self {
            IoUlExecutor::Inline(exec) => exec.execute(task),
            IoUlExecutor::Dedicated(strand) => strand.execute(task),
        }
    }

    fn defer(&self, task: UniqueTask) -> Result<(), FabricError> {
        match self {
            IoUlExecutor::Inline(exec) => exec.defer(task),
            IoUlExecutor::Dedicated(strand) => strand.defer(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_pool::{QueuePolicy, WorkerPool, WorkerPoolConfig};
    use std::sync::atomic::AtomicU32;

    fn pool() -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig {
            name: "ue-exec-test".into(),
            nof_workers: 4,
            queue_size: 8192,
            policy: QueuePolicy::Block,
            cpu_affinity: Vec::new(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_stop_drains_and_blocks_late_tasks() {
        let pool = pool();
        let base: SharedExecutor = Arc::new(pool.executor());
        let crypto: SharedExecutor = Arc::new(pool.executor());
        let ue_pool = UeExecutorPool::new(base, crypto, 2, 2048, 2048).unwrap();

        let mapper = ue_pool.create_ue_executor_mapper();
        let executed = Arc::new(AtomicU32::new(0));

        for _ in 0..1000 {
            for exec in [
                mapper.ctrl_executor().clone(),
                mapper.ul_pdu_executor().clone(),
                mapper.dl_pdu_executor().clone(),
            ] {
                let c = Arc::clone(&executed);
                exec.execute(Box::new(move || {
                    c.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
            }
        }

        mapper.stop().await.unwrap();
        let after_stop = executed.load(Ordering::SeqCst);
        assert!(after_stop <= 3000);

        // Tasks submitted while cancelled are accepted but never run a body.
        for _ in 0..100 {
            let c = Arc::clone(&executed);
            mapper
                .ctrl_executor()
                .execute(Box::new(move || {
                    c.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
        }
        mapper.stop().await.unwrap();
        assert_eq!(executed.load(Ordering::SeqCst), after_stop);

        pool.stop();
    }

    #[tokio::test]
    async fn test_round_robin_spreads_ues() {
        let pool = pool();
        let base: SharedExecutor = Arc::new(pool.executor());
        let crypto: SharedExecutor = Arc::new(pool.executor());
        let ue_pool = UeExecutorPool::new(base, crypto, 4, 64, 64).unwrap();

        // Mappers cycle over the 4 strands; creating 8 touches each twice.
        let mappers: Vec<_> = (0..8).map(|_| ue_pool.create_ue_executor_mapper()).collect();
        assert_eq!(ue_pool.rr_index.load(Ordering::Relaxed), 8);
        for m in &mappers {
            m.stop().await.unwrap();
        }
        pool.stop();
    }

    #[test]
    fn test_io_executor_modes() {
        let pool = pool();
        let base: SharedExecutor = Arc::new(pool.executor());

        let inline = IoUlExecutor::new(false, Arc::clone(&base), 64);
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        inline.execute(Box::new(move || r.store(true, Ordering::Release))).unwrap();
        // Inline mode runs on the caller before returning.
        assert!(ran.load(Ordering::Acquire));

        let dedicated = IoUlExecutor::new(true, base, 64);
        dedicated.execute(Box::new(|| {})).unwrap();
        pool.stop();
    }
}
