//! Inference worker threads and the shared job queue

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use parking_lot::RwLock;

use super::session::SessionElement;

/// One queued inference: which session and which of its slots.
pub(crate) struct InferenceJob {
    pub session: Arc<SessionElement>,
    pub slot_index: usize,
}

/// Bounded lock-free MPMC queue of inference jobs.
///
/// The queue is swapped for a larger one when a prepare raises the total
/// slot count; swaps only happen while the affected audio side is
/// quiesced, so the outer read lock is practically uncontended.
pub(crate) struct JobQueue {
    inner: RwLock<Arc<ArrayQueue<InferenceJob>>>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Arc::new(ArrayQueue::new(capacity.max(1)))),
        }
    }

    /// Non-blocking enqueue. Returns false when the queue is full.
    pub fn push(&self, job: InferenceJob) -> bool {
        self.inner.read().push(job).is_ok()
    }

    pub fn pop(&self) -> Option<InferenceJob> {
        self.inner.read().pop()
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity()
    }

    /// Grow to at least `capacity`, carrying queued jobs over.
    pub fn ensure_capacity(&self, capacity: usize) {
        let mut guard = self.inner.write();
        if guard.capacity() >= capacity {
            return;
        }
        let bigger = Arc::new(ArrayQueue::new(capacity));
        while let Some(job) = guard.pop() {
            if bigger.push(job).is_err() {
                log::error!("Job queue migration overflow, dropping job");
            }
        }
        *guard = bigger;
    }

    /// Remove every job belonging to `session_id`, requeueing the rest in
    /// order. Caller must have quiesced the session first.
    pub fn drain_session(&self, session_id: u64) {
        let guard = self.inner.read();
        let mut keep = Vec::new();
        while let Some(job) = guard.pop() {
            if job.session.id != session_id {
                keep.push(job);
            }
        }
        for job in keep {
            if guard.push(job).is_err() {
                log::error!("Could not requeue job while draining session {}", session_id);
            }
        }
    }
}

/// Execute at most one queued job on the calling thread.
///
/// This is the loop body shared by owned workers and host-donated
/// threads. The `active_inferences` increment happens before the
/// `initialised` re-check; together with the SeqCst store in
/// `quiesce` this guarantees prepare/release never observe a quiesced
/// counter while a worker is about to touch the slots.
pub(crate) fn execute_one(queue: &JobQueue) -> bool {
    let Some(job) = queue.pop() else {
        return false;
    };

    let session = job.session;
    session.active_inferences.fetch_add(1, Ordering::SeqCst);

    if !session.initialised.load(Ordering::SeqCst) {
        session.active_inferences.fetch_sub(1, Ordering::SeqCst);
        // The session is tearing down; hand the job back so the drain
        // loop can collect it.
        queue.push(InferenceJob {
            session,
            slot_index: job.slot_index,
        });
        return true;
    }

    let claimed = {
        let slots = session.slots.read();
        match slots.get(job.slot_index) {
            Some(slot) => slot
                .ready
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            // Stale job from before a re-prepare shrank the slot vector
            None => false,
        }
    };

    if claimed {
        session.run_inference(job.slot_index);
    }

    session.active_inferences.fetch_sub(1, Ordering::SeqCst);
    true
}

/// Owned worker thread: dequeue, infer, park briefly when idle.
pub(crate) struct InferenceWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InferenceWorker {
    const IDLE_PARK: Duration = Duration::from_micros(100);

    pub fn spawn(queue: Arc<JobQueue>, global_stop: Arc<AtomicBool>, index: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name(format!("rtinfer-worker-{}", index))
            .spawn(move || {
                while !worker_stop.load(Ordering::Acquire) && !global_stop.load(Ordering::Acquire)
                {
                    if !execute_one(&queue) {
                        std::thread::park_timeout(Self::IDLE_PARK);
                    }
                }
            })
            .expect("failed to spawn inference worker");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
