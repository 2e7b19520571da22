//! Strands
//!
//! A strand turns a parallel worker pool into a FIFO lane: tasks submitted
//! to the strand run one at a time, in submission order, on whichever pool
//! worker picks up the drain job. A priority strand stacks several queues
//! on one lane and services the higher-priority queues first.

use crate::{FabricError, SharedExecutor, TaskExecutor, UniqueTask};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::error;

/// Number of tasks a drain job runs before yielding the worker back to the
/// pool. Keeps one busy strand from starving its siblings.
const DRAIN_BATCH: u32 = 32;

struct TaskQueue {
    tx: Sender<UniqueTask>,
    rx: Receiver<UniqueTask>,
}

impl TaskQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }
}

/// Shared state of a (priority) strand.
///
/// Producers enqueue to their queue first and only then bump the pending
/// counter; the 0 -> 1 producer dispatches the drain job. The drain job pops
/// one queued task per counted unit, so a non-empty count guarantees a
/// successful pop.
struct StrandState {
    queues: Vec<TaskQueue>,
    pending: AtomicU32,
    out: SharedExecutor,
}

fn enqueue(this: &Arc<StrandState>, level: usize, task: UniqueTask) -> Result<(), FabricError> {
    match this.queues[level].tx.try_send(task) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => return Err(FabricError::QueueFull),
        Err(TrySendError::Disconnected(_)) => return Err(FabricError::Stopped),
    }
    if this.pending.fetch_add(1, Ordering::AcqRel) == 0 {
        dispatch(this);
    }
    Ok(())
}

fn dispatch(this: &Arc<StrandState>) {
    let state = Arc::clone(this);
    if this.out.defer(Box::new(move || state.drain())).is_err() {
        // The underlying executor is gone; queued tasks are lost.
        error!("strand failed to dispatch drain job onto its executor");
    }
}

impl StrandState {
    fn pop(&self) -> Option<UniqueTask> {
        for queue in &self.queues {
            if let Ok(task) = queue.rx.try_recv() {
                return Some(task);
            }
        }
        None
    }

    fn drain(self: Arc<Self>) {
        let mut run = 0u32;
        loop {
            // A positive pending count implies the matching send completed.
            let task = match self.pop() {
                Some(task) => task,
                None => {
                    std::hint::spin_loop();
                    continue;
                }
            };
            task();
            run += 1;
            if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                return;
            }
            if run >= DRAIN_BATCH {
                // More work remains; hand the lane back to the pool queue.
                let state = Arc::clone(&self);
                if self.out.defer(Box::new(move || state.drain())).is_ok() {
                    return;
                }
                // The pool rejected the hand-back (it is shutting down);
                // keep draining inline so no queued task is lost.
                run = 0;
            }
        }
    }
}

/// FIFO strand over an underlying executor
pub struct Strand {
    state: Arc<StrandState>,
}

impl Strand {
    /// Create a strand with the given queue capacity
    pub fn new(out: SharedExecutor, queue_size: usize) -> Self {
        Self {
            state: Arc::new(StrandState {
                queues: vec![TaskQueue::new(queue_size)],
                pending: AtomicU32::new(0),
                out,
            }),
        }
    }
}

impl TaskExecutor for Strand {
    fn execute(&self, task: UniqueTask) -> Result<(), FabricError> {
        enqueue(&self.state, 0, task)
    }

    fn defer(&self, task: UniqueTask) -> Result<(), FabricError> {
        enqueue(&self.state, 0, task)
    }
}

/// Strand with multiple priority levels.
///
/// Level 0 is the highest priority. Within the strand, queued level-0 tasks
/// always run before queued level-1 tasks, and so on; across strands there
/// is no priority inversion because each strand drains independently.
pub struct PriorityStrand {
    state: Arc<StrandState>,
}

impl PriorityStrand {
    /// Create a strand with one queue per entry of `queue_sizes`
    pub fn new(out: SharedExecutor, queue_sizes: &[usize]) -> Self {
        assert!(!queue_sizes.is_empty(), "priority strand needs at least one level");
        Self {
            state: Arc::new(StrandState {
                queues: queue_sizes.iter().map(|&cap| TaskQueue::new(cap)).collect(),
                pending: AtomicU32::new(0),
                out,
            }),
        }
    }

    /// Number of priority levels
    pub fn nof_levels(&self) -> usize {
        self.state.queues.len()
    }

    /// Get the executor for one priority level
    pub fn executor(&self, level: usize) -> PriorityStrandExecutor {
        assert!(level < self.state.queues.len(), "invalid priority level {}", level);
        PriorityStrandExecutor {
            state: Arc::clone(&self.state),
            level,
        }
    }
}

/// Executor handle bound to one priority level of a strand
#[derive(Clone)]
pub struct PriorityStrandExecutor {
    state: Arc<StrandState>,
    level: usize,
}

impl TaskExecutor for PriorityStrandExecutor {
    fn execute(&self, task: UniqueTask) -> Result<(), FabricError> {
        enqueue(&self.state, self.level, task)
    }

    fn defer(&self, task: UniqueTask) -> Result<(), FabricError> {
        enqueue(&self.state, self.level, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_pool::{QueuePolicy, WorkerPool, WorkerPoolConfig};
    use parking_lot::Mutex;

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig {
            name: "strand-test".into(),
            nof_workers: workers,
            queue_size: 4096,
            policy: QueuePolicy::Block,
            cpu_affinity: Vec::new(),
        })
        .unwrap()
    }

    #[test]
    fn test_strand_preserves_fifo_order() {
        let pool = pool(4);
        let strand = Strand::new(Arc::new(pool.executor()), 2048);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..1000u32 {
            let o = Arc::clone(&order);
            strand.execute(Box::new(move || o.lock().push(i))).unwrap();
        }

        pool.stop();
        let order = order.lock();
        assert_eq!(order.len(), 1000);
        assert!(order.windows(2).all(|w| w[0] < w[1]), "strand ran tasks out of order");
    }

    #[test]
    fn test_strand_queue_full() {
        // Inline-less pool with one parked worker so the strand queue fills.
        let pool = pool(1);
        let exec = Arc::new(pool.executor());
        let gate = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let g = Arc::clone(&gate);
            exec.execute(Box::new(move || {
                while !g.load(Ordering::Acquire) {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }))
            .unwrap();
        }

        let strand = Strand::new(exec, 4);
        let mut results = Vec::new();
        for _ in 0..8 {
            results.push(strand.execute(Box::new(|| {})));
        }
        assert!(results.iter().any(|r| *r == Err(FabricError::QueueFull)));
        gate.store(true, Ordering::Release);
        pool.stop();
    }

    #[test]
    fn test_priority_strand_services_high_priority_first() {
        // Single worker, parked while we enqueue, so the drain sees both
        // queues populated and must pick level 0 first.
        let pool = pool(1);
        let exec = Arc::new(pool.executor());
        let gate = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let g = Arc::clone(&gate);
            exec.execute(Box::new(move || {
                while !g.load(Ordering::Acquire) {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }))
            .unwrap();
        }

        let strand = PriorityStrand::new(exec, &[64, 64]);
        let hi = strand.executor(0);
        let lo = strand.executor(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8u32 {
            let o = Arc::clone(&order);
            lo.execute(Box::new(move || o.lock().push((1, i)))).unwrap();
        }
        for i in 0..8u32 {
            let o = Arc::clone(&order);
            hi.execute(Box::new(move || o.lock().push((0, i)))).unwrap();
        }

        gate.store(true, Ordering::Release);
        pool.stop();

        let order = order.lock();
        assert_eq!(order.len(), 16);
        // All high-priority tasks ran before any low-priority one.
        let first_lo = order.iter().position(|&(lvl, _)| lvl == 1).unwrap();
        assert!(order[..first_lo].iter().all(|&(lvl, _)| lvl == 0));
        assert_eq!(first_lo, 8);
    }
}
