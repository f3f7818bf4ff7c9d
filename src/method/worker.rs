//! Worker-thread offload method.
//!
//! Submission pushes handle indices onto a bounded MPMC queue and wakes a
//! worker; workers execute the syscall and complete the handle as a shared
//! completion. The submit path never blocks: when the queue is full (which
//! would need every handle in the system queued at once) the operation
//! falls back to inline execution.
//!
//! Workers hold only a `Weak` engine reference, so dropping the last
//! external `Arc<EngineControl>` tears the pool down: the method's `Drop`
//! raises the shutdown flag, wakes everyone, and joins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam_queue::ArrayQueue;

use crate::config::{EngineConfig, IoMethodKind};
use crate::engine::{Backend, EngineControl};
use crate::method::IoMethod;
use crate::ops;

struct WorkerShared {
    queue: ArrayQueue<u32>,
    mutex: Mutex<()>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

pub(crate) struct WorkerMethod {
    shared: Arc<WorkerShared>,
    threads: u32,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerMethod {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                queue: ArrayQueue::new(config.total_handles().max(1)),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            threads: config.io_worker_threads,
            workers: Mutex::new(Vec::new()),
        }
    }
}

impl IoMethod for WorkerMethod {
    fn kind(&self) -> IoMethodKind {
        IoMethodKind::Worker
    }

    fn start(&self, ctl: &Arc<EngineControl>) {
        let mut workers = self.workers.lock().unwrap();
        for i in 0..self.threads {
            let shared = Arc::clone(&self.shared);
            let ctl = Arc::downgrade(ctl);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("io-worker-{i}"))
                    .spawn(move || worker_main(shared, ctl))
                    .expect("spawn io worker"),
            );
        }
    }

    fn submit(&self, backend: &mut Backend, staged: &[u32]) -> usize {
        let ctl = backend.control().clone();
        for &index in staged {
            ctl.prepare_submit(index);
        }
        for &index in staged {
            match self.shared.queue.push(index) {
                Ok(()) => {
                    let _guard = self.shared.mutex.lock().unwrap();
                    self.shared.condvar.notify_one();
                }
                Err(_) => {
                    // Queue saturated; do the work ourselves rather than
                    // blocking the submit path.
                    tracing::debug!(io = index, "worker queue full, executing inline");
                    ops::perform_synchronously(&ctl, backend, index);
                }
            }
        }
        staged.len()
    }
}

impl Drop for WorkerMethod {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.mutex.lock().unwrap();
            self.shared.condvar.notify_all();
        }
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_main(shared: Arc<WorkerShared>, ctl: Weak<EngineControl>) {
    loop {
        if let Some(index) = shared.queue.pop() {
            let Some(ctl) = ctl.upgrade() else { break };
            let raw = ops::execute(&ctl, index);
            ctl.process_completion(None, index, raw, false);
            continue;
        }

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let guard = shared.mutex.lock().unwrap();
        if shared.queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
            // Spurious wakeups only cost a queue check.
            let _unused = shared.condvar.wait(guard).unwrap();
        }
    }
}
