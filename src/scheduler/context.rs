//! Process-wide inference context
//!
//! One context serves every session in the process: it owns the worker
//! threads and the job queue, registers live sessions, and shares backend
//! instances between sessions with identical configurations. The global
//! instance is created on first use and released when the last session is
//! gone; embedders that want explicit lifetimes can build a standalone
//! context instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{BackendFactory, BackendProcessor, InferenceBackend, pool::ProcessorPool};
use crate::backend::pool::ProcessorInstance;
use crate::config::{HostConfig, InferenceConfig};
use crate::error::Result;
use crate::processing::PrePostProcessor;

use super::session::SessionElement;
use super::worker::{InferenceJob, InferenceWorker, JobQueue, execute_one};

/// Lower bound on the job queue capacity.
const MIN_JOBS: usize = 512;

/// Construction parameters for a [`Context`].
#[derive(Clone)]
pub struct ContextConfig {
    /// Owned worker threads. May be zero when host-donated threads are
    /// used exclusively.
    pub num_threads: usize,
    /// Prefer host-donated threads over the owned pool.
    pub use_host_threads: bool,
    /// Master switch for the per-session `wait_in_process_block` option.
    pub enable_controlled_blocking: bool,
    /// Constructors for the built-in backend tags. Tags without a factory
    /// run the bypass path.
    pub backend_factories: HashMap<InferenceBackend, BackendFactory>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            num_threads: (num_cpus::get() / 2).max(1),
            use_host_threads: false,
            enable_controlled_blocking: true,
            backend_factories: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextConfig")
            .field("num_threads", &self.num_threads)
            .field("use_host_threads", &self.use_host_threads)
            .field("enable_controlled_blocking", &self.enable_controlled_blocking)
            .field(
                "backend_factories",
                &self.backend_factories.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ContextConfig {
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_host_threads(mut self, use_host_threads: bool) -> Self {
        self.use_host_threads = use_host_threads;
        self
    }

    pub fn with_controlled_blocking(mut self, enabled: bool) -> Self {
        self.enable_controlled_blocking = enabled;
        self
    }

    pub fn register_backend(mut self, backend: InferenceBackend, factory: BackendFactory) -> Self {
        self.backend_factories.insert(backend, factory);
        self
    }
}

static INSTANCE: Mutex<Option<Arc<Context>>> = Mutex::new(None);

/// Process-wide scheduler state shared by all sessions.
pub struct Context {
    config: Mutex<ContextConfig>,
    queue: Arc<JobQueue>,
    workers: Mutex<Vec<InferenceWorker>>,
    sessions: Mutex<Vec<Arc<SessionElement>>>,
    pool: Mutex<ProcessorPool>,
    next_session_id: AtomicU64,
    active_sessions: AtomicUsize,
    host_threads_active: AtomicBool,
    stop: Arc<AtomicBool>,
}

impl Context {
    /// Fetch the shared process-wide context, creating it on first use.
    ///
    /// Later acquisitions reconcile their requested configuration against
    /// the live one: mismatched backend sets or blocking options are
    /// reported as errors, a smaller thread count shrinks the pool, and
    /// host-thread usage can only be switched off.
    pub fn instance(config: &ContextConfig) -> Arc<Context> {
        let mut guard = INSTANCE.lock();
        match guard.as_ref() {
            Some(existing) => {
                existing.reconcile(config);
                existing.clone()
            }
            None => {
                log::info!("rtinfer version {}", crate::VERSION);
                let context = Arc::new(Context::build(config.clone()));
                *guard = Some(context.clone());
                context
            }
        }
    }

    /// Build a context that is not registered globally. Sessions created
    /// through it are isolated from the shared instance.
    pub fn standalone(config: &ContextConfig) -> Arc<Context> {
        Arc::new(Context::build(config.clone()))
    }

    fn build(config: ContextConfig) -> Self {
        Self {
            queue: Arc::new(JobQueue::new(MIN_JOBS)),
            workers: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            pool: Mutex::new(ProcessorPool::new()),
            next_session_id: AtomicU64::new(0),
            active_sessions: AtomicUsize::new(0),
            host_threads_active: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            config: Mutex::new(config),
        }
    }

    fn reconcile(&self, requested: &ContextConfig) {
        let mut config = self.config.lock();

        let mut live: Vec<_> = config.backend_factories.keys().collect();
        let mut wanted: Vec<_> = requested.backend_factories.keys().collect();
        live.sort();
        wanted.sort();
        if live != wanted {
            log::error!("Context already initialized with different backends enabled");
        }
        if config.enable_controlled_blocking != requested.enable_controlled_blocking {
            log::error!("Context already initialized with different controlled blocking option");
        }
        if !requested.use_host_threads && config.use_host_threads {
            // Can only be re-enabled once every session is released
            config.use_host_threads = false;
        }
        let shrink_to = if requested.num_threads < config.num_threads {
            config.num_threads = requested.num_threads;
            Some(requested.num_threads)
        } else {
            None
        };
        drop(config);
        if let Some(target) = shrink_to {
            self.shrink_workers(target);
        }
    }

    /// Register a new session and attach its backend processors. The
    /// config must already be resolved.
    pub(crate) fn create_session(
        &self,
        mut config: InferenceConfig,
        pp_processor: Arc<dyn PrePostProcessor>,
        custom_processor: Option<Box<dyn BackendProcessor>>,
    ) -> Result<Arc<SessionElement>> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;

        let num_threads = self.config.lock().num_threads;
        if num_threads > 0 && config.num_parallel_processors > num_threads {
            log::warn!(
                "Session {} requested {} parallel processors but the pool has {} threads, \
                 clamping",
                id,
                config.num_parallel_processors,
                num_threads
            );
            config.num_parallel_processors = num_threads;
        }

        let session = Arc::new(SessionElement::new(id, config, pp_processor));

        if let Some(processor) = custom_processor {
            let instance = ProcessorInstance::from_custom(&session.config, processor)?;
            session.set_processor(InferenceBackend::Custom, instance);
        }

        let factories = self.config.lock().backend_factories.clone();
        {
            let mut pool = self.pool.lock();
            for model in &session.config.model_data {
                if model.backend == InferenceBackend::Custom {
                    continue;
                }
                match factories.get(&model.backend) {
                    Some(factory) => {
                        let instance = pool.acquire(model.backend, &session.config, factory)?;
                        session.set_processor(model.backend, instance);
                    }
                    None => log::warn!(
                        "No factory registered for backend {}, selecting it will run the bypass",
                        model.backend
                    ),
                }
            }
        }

        self.sessions.lock().push(session.clone());
        self.active_sessions.fetch_add(1, Ordering::AcqRel);
        Ok(session)
    }

    /// Quiesce and unregister a session, returning its backend instances
    /// to the pool. Clears the global instance when this was the last
    /// session.
    pub(crate) fn release_session(&self, session: &Arc<SessionElement>) {
        self.quiesce_session(session);

        {
            let mut pool = self.pool.lock();
            for instance in session.take_processors() {
                pool.release(&instance);
            }
        }
        self.sessions.lock().retain(|s| s.id != session.id);

        if self.active_sessions.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut guard = INSTANCE.lock();
            if let Some(existing) = guard.as_ref() {
                if std::ptr::eq(Arc::as_ptr(existing), self) {
                    guard.take();
                }
            }
        }
    }

    /// Stop the fast paths, wait for in-flight inferences and sweep the
    /// session's queued jobs. The SeqCst store pairs with the worker-side
    /// increment-then-check in `execute_one`.
    pub(crate) fn quiesce_session(&self, session: &SessionElement) {
        session.initialised.store(false, Ordering::SeqCst);
        while session.active_inferences.load(Ordering::SeqCst) != 0 {
            std::thread::sleep(Duration::from_micros(50));
        }
        self.queue.drain_session(session.id);
    }

    /// Re-arm a prepared session: size the queue for the new slot total,
    /// settle the execution mode and reopen the fast paths.
    pub(crate) fn activate_session(&self, session: &Arc<SessionElement>, host: &HostConfig) {
        let total_slots: usize = self
            .sessions
            .lock()
            .iter()
            .map(|s| s.slots.read().len())
            .sum();
        self.queue.ensure_capacity(total_slots.max(MIN_JOBS));

        let use_host_threads = {
            let mut config = self.config.lock();
            if host.submit_task.is_none() {
                config.use_host_threads = false;
            }
            config.use_host_threads
        };

        if use_host_threads {
            self.host_threads_active.store(true, Ordering::Release);
        } else {
            self.host_threads_active.store(false, Ordering::Release);
            self.start_workers();
        }

        session.initialised.store(true, Ordering::SeqCst);
    }

    /// Enqueue one slot for inference. Non-blocking; false means the
    /// queue is full and the caller should drop the frame.
    pub(crate) fn submit_job(&self, session: &Arc<SessionElement>, slot_index: usize) -> bool {
        self.queue.push(InferenceJob {
            session: session.clone(),
            slot_index,
        })
    }

    /// Run at most one queued inference on the calling thread. This is
    /// the entry point for host-donated threads; it returns whether a job
    /// was executed.
    pub fn exec_inference(&self) -> bool {
        execute_one(&self.queue)
    }

    pub(crate) fn host_threads_active(&self) -> bool {
        self.host_threads_active.load(Ordering::Acquire)
    }

    /// Permanent fallback to the owned pool after a host callback failed.
    pub(crate) fn disable_host_threads(&self) {
        log::warn!("Host thread pool failed, falling back to owned workers");
        self.host_threads_active.store(false, Ordering::Release);
        self.start_workers();
    }

    pub(crate) fn controlled_blocking_enabled(&self) -> bool {
        self.config.lock().enable_controlled_blocking
    }

    pub fn num_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.lock().len()
    }

    fn start_workers(&self) {
        let target = self.config.lock().num_threads;
        let mut workers = self.workers.lock();
        while workers.len() < target {
            let id = workers.len();
            workers.push(InferenceWorker::spawn(
                self.queue.clone(),
                self.stop.clone(),
                id,
            ));
        }
    }

    fn shrink_workers(&self, target: usize) {
        let mut workers = self.workers.lock();
        while workers.len() > target {
            // Drop joins the worker
            workers.pop();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.workers.lock().clear();
    }
}
