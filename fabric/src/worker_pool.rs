//! Worker Pool
//!
//! A pool of named OS threads draining a single bounded MPMC task queue.
//! Strands built on top of the pool provide sequentialization; the pool
//! itself runs whatever it pops, in parallel across workers.

use crate::{FabricError, TaskExecutor, UniqueTask};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Behaviour when the task queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Block the producer until space is available
    Block,
    /// Drop the task and log a warning
    Drop,
    /// Return `FabricError::QueueFull` to the producer
    Error,
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Thread name prefix
    pub name: String,
    /// Number of worker threads
    pub nof_workers: usize,
    /// Task queue capacity
    pub queue_size: usize,
    /// Full-queue policy
    pub policy: QueuePolicy,
    /// CPU ids the workers are allowed to run on; empty means unpinned
    pub cpu_affinity: Vec<usize>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "du-worker".to_string(),
            nof_workers: 4,
            queue_size: 2048,
            policy: QueuePolicy::Block,
            cpu_affinity: Vec::new(),
        }
    }
}

/// Shared state between the pool and its executor handles.
///
/// The sender lives behind a mutex so `stop()` can drop it; workers blocked
/// on `recv()` unblock naturally once the last transient clone is gone.
struct PoolShared {
    tx: Mutex<Option<Sender<UniqueTask>>>,
    policy: QueuePolicy,
}

impl PoolShared {
    fn submit(&self, task: UniqueTask) -> Result<(), FabricError> {
        // Clone the sender under the lock, send outside it so a blocking
        // send does not serialize all producers.
        let tx = match self.tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(FabricError::Stopped),
        };
        match self.policy {
            QueuePolicy::Block => tx.send(task).map_err(|_| FabricError::Stopped),
            QueuePolicy::Drop => match tx.try_send(task) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    warn!("worker pool queue full, dropping task");
                    Ok(())
                }
                Err(TrySendError::Disconnected(_)) => Err(FabricError::Stopped),
            },
            QueuePolicy::Error => match tx.try_send(task) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(FabricError::QueueFull),
                Err(TrySendError::Disconnected(_)) => Err(FabricError::Stopped),
            },
        }
    }
}

/// Pool of worker threads sharing one task queue
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    name: String,
}

impl WorkerPool {
    /// Spawn the worker threads
    pub fn new(config: WorkerPoolConfig) -> Result<Self, FabricError> {
        if config.nof_workers == 0 || config.queue_size == 0 {
            return Err(FabricError::InvalidConfig);
        }

        let (tx, rx) = bounded::<UniqueTask>(config.queue_size);

        let mut workers = Vec::with_capacity(config.nof_workers);
        for worker_id in 0..config.nof_workers {
            workers.push(spawn_worker(&config, worker_id, rx.clone()));
        }

        info!(
            "Worker pool \"{}\" started: {} workers, queue depth {}",
            config.name, config.nof_workers, config.queue_size
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                tx: Mutex::new(Some(tx)),
                policy: config.policy,
            }),
            workers: Mutex::new(workers),
            name: config.name,
        })
    }

    /// Get a cloneable executor handle onto this pool
    pub fn executor(&self) -> PoolExecutor {
        PoolExecutor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop accepting tasks, finish the queue and join the workers.
    ///
    /// Tasks already enqueued still run; workers exit once the queue drains.
    pub fn stop(&self) {
        {
            let mut tx = self.shared.tx.lock();
            if tx.take().is_none() {
                return;
            }
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        info!("Worker pool \"{}\" stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Unblock workers; threads are detached if stop() was never called.
        self.shared.tx.lock().take();
    }
}

/// Cloneable executor handle submitting into the pool queue
#[derive(Clone)]
pub struct PoolExecutor {
    shared: Arc<PoolShared>,
}

impl TaskExecutor for PoolExecutor {
    fn execute(&self, task: UniqueTask) -> Result<(), FabricError> {
        self.shared.submit(task)
    }

    fn defer(&self, task: UniqueTask) -> Result<(), FabricError> {
        self.shared.submit(task)
    }
}

fn spawn_worker(config: &WorkerPoolConfig, worker_id: usize, rx: Receiver<UniqueTask>) -> JoinHandle<()> {
    let name = format!("{}-{}", config.name, worker_id);
    let affinity = config.cpu_affinity.clone();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if !affinity.is_empty() {
                pin_current_thread(&affinity);
            }
            debug!("worker {} started", name);
            // Blocking pop; the loop exits when all senders are dropped.
            while let Ok(task) = rx.recv() {
                task();
            }
            debug!("worker {} exiting", name);
        })
        .expect("failed to spawn worker thread")
}

/// Pin the calling thread to the given CPU set
#[cfg(target_os = "linux")]
fn pin_current_thread(cpus: &[usize]) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!("failed to set CPU affinity: {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_cpus: &[usize]) {}
