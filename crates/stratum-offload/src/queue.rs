//! Background copy workers for the disk backend.
//!
//! A fixed pool of threads pulls tasks off one bounded FIFO channel. Each
//! submission returns a [`PendingCopy`] ticket; `synchronize` waits for the
//! pending counter to reach zero and surfaces every failure recorded since
//! the last call that no ticket has already reported. A failed task still
//! counts as finished, so the queue never stalls on it. Shutdown sends one
//! sentinel per worker and joins.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use stratum_core::{Region, Result, StratumError};
use tokio::sync::oneshot;

use crate::copy::{execute_copy, CopyOutcome, Relay};
use crate::handle::TensorHandle;

pub(crate) struct CopyTask {
    pub dst: TensorHandle,
    pub dst_region: Option<Region>,
    pub src: TensorHandle,
    pub src_region: Option<Region>,
}

enum Message {
    Copy(u64, CopyTask, oneshot::Sender<std::result::Result<(), String>>),
    /// Delete a moved-from handle once its copies have run.
    Release(TensorHandle, CopyOutcome),
    Shutdown,
}

/// Ticket for one queued copy.
#[derive(Debug)]
pub struct PendingCopy {
    id: u64,
    rx: oneshot::Receiver<std::result::Result<(), String>>,
    shared: Arc<Shared>,
}

impl PendingCopy {
    /// Block until this copy has run.
    ///
    /// A failure returned here is not reported again by `synchronize`.
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<()> {
        match self.rx.blocking_recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(first)) => {
                self.shared.failures.lock().retain(|(id, _)| *id != self.id);
                Err(StratumError::WorkerTaskFailure { count: 1, first })
            }
            Err(_) => Err(StratumError::WorkerTaskFailure {
                count: 1,
                first: "copy worker dropped the task".into(),
            }),
        }
    }
}

#[derive(Debug)]
struct Shared {
    pending: Mutex<usize>,
    drained: Condvar,
    /// Failed tasks by id, not yet reported through a ticket or `synchronize`.
    failures: Mutex<Vec<(u64, String)>>,
    next_id: AtomicU64,
}

impl Shared {
    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn record_failure(&self, id: u64, msg: String) {
        self.failures.lock().push((id, msg));
    }

    fn take_failures(&self) -> Result<()> {
        let failures = std::mem::take(&mut *self.failures.lock());
        let count = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some((_, first)) => Err(StratumError::WorkerTaskFailure { count, first }),
        }
    }
}

pub struct CopyQueue {
    sender: Mutex<Option<SyncSender<Message>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl CopyQueue {
    /// Spawn `num_threads` workers, each with its own staging buffer of `relay_bytes`.
    pub fn new(num_threads: usize, capacity: usize, relay_bytes: usize) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Message>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(Shared {
            pending: Mutex::new(0),
            drained: Condvar::new(),
            failures: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_threads.max(1));
        for id in 0..num_threads.max(1) {
            let rx = Arc::clone(&rx);
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("stratum-copy-{id}"))
                .spawn(move || worker_loop(id, rx, shared, relay_bytes))?;
            workers.push(handle);
        }
        tracing::debug!(threads = workers.len(), capacity, "copy queue started");

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shared,
        })
    }

    /// Enqueue a copy. Waits only if the channel is at capacity.
    pub(crate) fn submit(&self, task: CopyTask) -> Result<PendingCopy> {
        let sender = self.sender.lock().clone().ok_or(StratumError::QueueClosed)?;
        let (tx, rx) = oneshot::channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        *self.shared.pending.lock() += 1;
        if sender.send(Message::Copy(id, task, tx)).is_err() {
            self.shared.finish_one();
            return Err(StratumError::QueueClosed);
        }
        Ok(PendingCopy {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Delete `src` on a worker once every copy in `outcome` has run.
    ///
    /// Counts as pending until the release is done. If a copy failed the
    /// source is kept and the failure is reported by `synchronize`.
    pub(crate) fn release_after(&self, src: TensorHandle, outcome: CopyOutcome) -> Result<()> {
        let sender = self.sender.lock().clone().ok_or(StratumError::QueueClosed)?;
        *self.shared.pending.lock() += 1;
        if sender.send(Message::Release(src, outcome)).is_err() {
            self.shared.finish_one();
            return Err(StratumError::QueueClosed);
        }
        Ok(())
    }

    /// Number of submitted tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        *self.shared.pending.lock()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Wait for every submitted task, then report failures recorded since the last call.
    pub fn synchronize(&self) -> Result<()> {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.drained.wait(&mut pending);
        }
        drop(pending);
        self.shared.take_failures()
    }

    /// Stop accepting work, let workers drain the queue and join them.
    ///
    /// Idempotent. Outstanding failures are reported as by `synchronize`.
    pub fn close(&self) -> Result<()> {
        let Some(sender) = self.sender.lock().take() else {
            return Ok(());
        };
        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in 0..workers.len() {
            if sender.send(Message::Shutdown).is_err() {
                break;
            }
        }
        drop(sender);

        let current = thread::current().id();
        for handle in workers {
            // The last handle to a backend can be released by one of its own workers.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("copy worker exited abnormally");
            }
        }
        tracing::debug!("copy queue closed");
        self.shared.take_failures()
    }
}

impl Drop for CopyQueue {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("copy queue closed with failures: {e}");
        }
    }
}

fn worker_loop(id: usize, rx: Arc<Mutex<Receiver<Message>>>, shared: Arc<Shared>, relay_bytes: usize) {
    let mut relay = Relay::new(relay_bytes);
    loop {
        let msg = rx.lock().recv();
        let (task_id, task, done) = match msg {
            Ok(Message::Copy(task_id, task, done)) => (task_id, task, done),
            Ok(Message::Release(src, outcome)) => {
                release(id, &shared, src, outcome);
                shared.finish_one();
                continue;
            }
            Ok(Message::Shutdown) | Err(_) => {
                tracing::trace!(worker = id, "copy worker exiting");
                return;
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| execute_copy(&task, &mut relay)))
            .unwrap_or_else(|_| {
                Err(StratumError::Format(format!(
                    "copy {} -> {} panicked",
                    task.src.name(),
                    task.dst.name()
                )))
            })
            .map_err(|e| format!("{} -> {}: {e}", task.src.name(), task.dst.name()));

        if let Err(msg) = &result {
            tracing::warn!(worker = id, "copy task failed: {msg}");
            shared.record_failure(task_id, msg.clone());
        }
        drop(task);
        // Finish before delivering so `pending` has dropped once a waiter wakes.
        shared.finish_one();
        let _ = done.send(result);
    }
}

fn release(worker: usize, shared: &Shared, src: TensorHandle, outcome: CopyOutcome) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let result = outcome
        .wait()
        .map_err(|e| format!("move of {} kept its source: {e}", src.name()))
        .and_then(|()| src.delete().map_err(|e| format!("releasing {}: {e}", src.name())));
    match result {
        Ok(()) => tracing::trace!(worker, name = %src.name(), "moved source released"),
        Err(msg) => {
            tracing::warn!(worker, "{msg}");
            shared.record_failure(id, msg);
        }
    }
}
