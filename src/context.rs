//! The resolution context shared by all caller threads.
//!
//! # Lifecycle
//!
//! 1. [`Context::new`] creates the two channels and the allocators. Options
//!    can be changed freely at this point.
//! 2. The first query (or an explicit [`Context::finalize`]) builds the module
//!    pipeline, reserves the shared caches and starts the worker. From then on
//!    the configuration is frozen.
//! 3. Queries flow to the worker over the request channel and come back over
//!    the result channel, where they are matched to their caller by id.
//! 4. Dropping the context closes the request channel; the worker drains,
//!    parks its arena in the pool and exits.
//!
//! # Delivery
//!
//! In [`ConcurrencyMode::ThreadBased`] the application threads drain results
//! themselves: a synchronous caller, [`Context::process`] or
//! [`Context::wait`] takes the reader role, reads one frame, hands it to
//! whoever it belongs to and gives the role up again. In
//! [`ConcurrencyMode::ProcessBased`] a dispatcher thread does the draining.
//! Async callbacks run on the thread that drained their result and must not
//! block on this context.

use crate::arena::Allocators;
use crate::channel::Channel;
use crate::config::{ConcurrencyMode, ContextConfig, LocalData};
use crate::env::{Environment, Resolve};
use crate::error::{ChannelError, ContextError, Result};
use crate::query::{Answer, Query, RecordClass, RecordType};
use crate::registry::{Callback, Delivery, QueryId, QueryRegistry, ResultSlot};
use crate::wire::{Request, Response};
use crate::worker::{Worker, WorkerLink};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuration and finalize state, guarded by the config lock.
struct ConfigState {
    config: ContextConfig,
    resolver: Option<Arc<dyn Resolve>>,
    finalized: bool,
    env: Option<Arc<Environment>>,
    next_thread_num: u32,
    dispatcher_started: bool,
}

/// Coordination between threads waiting for results.
#[derive(Debug, Default)]
struct WaitState {
    /// Some thread is currently reading the result channel.
    reader_active: bool,
    /// The result channel reached end-of-stream or failed.
    closed: bool,
    /// Async callbacks taken out of the registry but not yet returned.
    running_callbacks: usize,
}

struct Shared {
    config: Mutex<ConfigState>,
    mode: OnceLock<ConcurrencyMode>,
    registry: Mutex<QueryRegistry>,
    requests: Arc<Channel>,
    results: Arc<Channel>,
    allocators: Arc<Mutex<Allocators>>,
    waiters: Mutex<WaitState>,
    wake: Condvar,
}

/// Handle through which applications submit and await queries.
///
/// `Context` is `Send + Sync`; share it between threads by reference or in
/// an `Arc`.
///
/// # Example
///
/// ```
/// use resolver_context::{Answer, Context, ContextConfig, Query, RecordClass, RecordType};
///
/// let resolver = |q: &Query| -> resolver_context::Result<Answer> {
///     Ok(Answer::for_query(q).with_data([127, 0, 0, 1]))
/// };
/// let ctx = Context::new(ContextConfig::new(), resolver)?;
///
/// let answer = ctx.resolve("example.test", RecordType::A, RecordClass::IN)?;
/// assert_eq!(answer.data, vec![vec![127, 0, 0, 1]]);
/// # Ok::<(), resolver_context::ContextError>(())
/// ```
pub struct Context {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Context {
    /// Creates a context whose worker answers through `resolver`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Transport`] if the channels cannot be created.
    pub fn new(config: ContextConfig, resolver: impl Resolve + 'static) -> Result<Self> {
        let resolver: Arc<dyn Resolve> = Arc::new(resolver);
        Self::build(config, Some(resolver))
    }

    /// Creates a context without a worker; the returned link is the worker
    /// side of the channels and must be served by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Transport`] if the channels cannot be created.
    pub fn detached(config: ContextConfig) -> Result<(Self, WorkerLink)> {
        let ctx = Self::build(config, None)?;
        let link = WorkerLink::new(
            Arc::clone(&ctx.shared.requests),
            Arc::clone(&ctx.shared.results),
        );
        Ok((ctx, link))
    }

    fn build(config: ContextConfig, resolver: Option<Arc<dyn Resolve>>) -> Result<Self> {
        let requests = Arc::new(Channel::new(config.max_frame_len).map_err(ChannelError::Io)?);
        let results = Arc::new(Channel::new(config.max_frame_len).map_err(ChannelError::Io)?);
        let registry = QueryRegistry::new(config.max_query_id);
        Ok(Self {
            shared: Arc::new(Shared {
                config: Mutex::new(ConfigState {
                    config,
                    resolver,
                    finalized: false,
                    env: None,
                    next_thread_num: 0,
                    dispatcher_started: false,
                }),
                mode: OnceLock::new(),
                registry: Mutex::new(registry),
                requests,
                results,
                allocators: Arc::new(Mutex::new(Allocators::default())),
                waiters: Mutex::new(WaitState::default()),
                wake: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Applies a libunbound-style option such as `("module-config:", "iterator")`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AfterFinal`] once finalized, or
    /// [`ContextError::Syntax`] for unknown keys and bad values.
    pub fn set_option(&self, key: &str, value: &str) -> Result<()> {
        self.configure(|config| config.set_option(key, value))
    }

    /// Selects the concurrency mode used from finalization on.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AfterFinal`] once finalized.
    pub fn set_concurrency(&self, mode: ConcurrencyMode) -> Result<()> {
        self.configure(|config| {
            config.mode = mode;
            Ok(())
        })
    }

    /// Adds a record served locally by the worker.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AfterFinal`] once finalized, or
    /// [`ContextError::Syntax`] if the owner name is malformed.
    pub fn add_local_data(&self, data: LocalData) -> Result<()> {
        Query::new(&data.name, data.rtype, data.class)?;
        self.configure(|config| {
            config.local_data.push(data);
            Ok(())
        })
    }

    fn configure(&self, change: impl FnOnce(&mut ContextConfig) -> Result<()>) -> Result<()> {
        let mut state = self.shared.config.lock();
        if state.finalized {
            return Err(ContextError::AfterFinal);
        }
        change(&mut state.config)
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Freezes the configuration and builds the shared state.
    ///
    /// Runs its side effects exactly once, however many threads call it.
    /// After a failure the context stays unfinalized and may be retried with
    /// a corrected configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::InitializationFailed`] if the module pipeline,
    /// the resolver's `init` or a thread spawn fails.
    pub fn finalize(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.config.lock();
        if state.finalized {
            return Ok(());
        }

        let env = {
            let mut allocators = shared.allocators.lock();
            Arc::new(Environment::build(&state.config, &mut allocators.root)?)
        };
        let mut started = match &state.resolver {
            Some(resolver) => resolver.init(&env.env, &env.modules),
            None => Ok(()),
        };
        if started.is_ok() {
            started = self.start_threads(&mut state, &env);
        }
        if let Err(e) = started {
            shared.release_environment(&env);
            return Err(e);
        }

        let mode = state.config.mode;
        *shared.registry.lock() = QueryRegistry::new(state.config.max_query_id);
        let _ = shared.mode.set(mode);
        tracing::info!(
            mode = ?mode,
            modules = %env.modules,
            local_zones = env.local_zones.len(),
            "Resolver context finalized"
        );
        state.env = Some(env);
        state.finalized = true;
        Ok(())
    }

    /// Starts the dispatcher (process mode, once) and the worker.
    fn start_threads(&self, state: &mut ConfigState, env: &Arc<Environment>) -> Result<()> {
        let shared = &self.shared;
        let mode = state.config.mode;

        if mode == ConcurrencyMode::ProcessBased && !state.dispatcher_started {
            let dispatcher = Arc::clone(shared);
            thread::Builder::new()
                .name("resolver-dispatch".into())
                .spawn(move || dispatcher.dispatch_loop())
                .map_err(|e| {
                    ContextError::InitializationFailed(format!("cannot start dispatcher: {e}"))
                })?;
            state.dispatcher_started = true;
        }

        if let Some(resolver) = state.resolver.clone() {
            let worker_env = match mode {
                ConcurrencyMode::ThreadBased => Arc::clone(env),
                ConcurrencyMode::ProcessBased => Arc::new((**env).clone()),
            };
            let num = state.next_thread_num;
            let handle = Worker {
                num,
                link: WorkerLink::new(Arc::clone(&shared.requests), Arc::clone(&shared.results)),
                env: worker_env,
                resolver,
                allocators: Arc::clone(&shared.allocators),
            }
            .spawn()
            .map_err(|e| ContextError::InitializationFailed(format!("cannot start worker: {e}")))?;
            state.next_thread_num += 1;
            self.workers.lock().push(handle);
        }
        Ok(())
    }

    /// Returns `true` once [`finalize`](Self::finalize) has succeeded.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.shared.config.lock().finalized
    }

    /// The environment built at finalization: module env, module pipeline
    /// and local zone data. `None` before that.
    #[must_use]
    pub fn environment(&self) -> Option<Arc<Environment>> {
        self.shared.config.lock().env.clone()
    }

    /// Concurrency mode, fixed at finalization. `None` before that.
    #[must_use]
    pub fn concurrency_mode(&self) -> Option<ConcurrencyMode> {
        self.shared.mode.get().copied()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Resolves a query and blocks until its answer arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Syntax`] for malformed parameters, any
    /// finalization error, [`ContextError::Transport`] if the worker is
    /// unreachable, or the failure the worker reported.
    pub fn resolve(&self, name: &str, rtype: RecordType, class: RecordClass) -> Result<Answer> {
        let query = Query::new(name, rtype, class)?;
        self.finalize()?;

        let slot = Arc::new(ResultSlot::default());
        let id = self.submit(query, Delivery::Sync(Arc::clone(&slot)))?;
        self.shared.await_slot(id, &slot)
    }

    /// Submits a query and returns immediately.
    ///
    /// `callback` runs exactly once with the outcome, or never if the query
    /// is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Syntax`] for malformed parameters, any
    /// finalization error, [`ContextError::Capacity`] if no id is free, or
    /// [`ContextError::Transport`] if the request cannot be sent.
    pub fn resolve_async<F>(
        &self,
        name: &str,
        rtype: RecordType,
        class: RecordClass,
        callback: F,
    ) -> Result<QueryId>
    where
        F: FnOnce(Result<Answer>) + Send + 'static,
    {
        let query = Query::new(name, rtype, class)?;
        self.finalize()?;
        self.submit(query, Delivery::Async(Box::new(callback)))
    }

    /// Stops caring about an async query. Its answer, if it still arrives,
    /// is discarded.
    ///
    /// Returns `false` if `id` is not a pending async query.
    pub fn cancel(&self, id: QueryId) -> bool {
        let shared = &self.shared;
        let _waiters = shared.waiters.lock();
        let found = shared.registry.lock().cancel(id).is_some();
        if found {
            shared.wake.notify_all();
            tracing::debug!(query_id = %id, "Cancelled query");
        }
        found
    }

    fn submit(&self, query: Query, delivery: Delivery) -> Result<QueryId> {
        let shared = &self.shared;
        let id = {
            let waiters = shared.waiters.lock();
            if waiters.closed {
                return Err(ChannelError::Closed.into());
            }
            shared
                .registry
                .lock()
                .allocate_and_insert(query.clone(), delivery)?
        };
        tracing::debug!(query_id = %id, query = %query, "Submitting query");

        let frame = Request { id, query }.encode();
        if let Err(e) = shared.requests.send(&frame) {
            let _waiters = shared.waiters.lock();
            // If the record is already gone, the worker's death has been
            // reported to it through its own delivery path.
            if shared.registry.lock().lookup_and_remove(id).is_some() {
                shared.wake.notify_all();
                tracing::warn!(query_id = %id, error = %e, "Failed to send request");
                return Err(e.into());
            }
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Result draining
    // -----------------------------------------------------------------------

    /// Delivers every result that is already available without blocking.
    ///
    /// Returns the number of frames handled. In process mode the dispatcher
    /// delivers results and this returns 0.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Transport`] if the result channel closed or
    /// carried a malformed frame.
    pub fn process(&self) -> Result<usize> {
        if self.concurrency_mode() != Some(ConcurrencyMode::ThreadBased) {
            return Ok(0);
        }
        let shared = &self.shared;
        let mut handled = 0;
        loop {
            {
                let mut waiters = shared.waiters.lock();
                if waiters.reader_active
                    || waiters.closed
                    || !shared.results.poll_readable(Some(Duration::ZERO))
                {
                    return Ok(handled);
                }
                waiters.reader_active = true;
            }
            shared.read_one()?;
            handled += 1;
        }
    }

    /// Blocks until no async query is outstanding and every callback has
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Transport`] if the result channel carried a
    /// malformed frame while this thread was reading it.
    pub fn wait(&self) -> Result<()> {
        let shared = &self.shared;
        let mut waiters = shared.waiters.lock();
        loop {
            if shared.registry.lock().async_pending() == 0 && waiters.running_callbacks == 0 {
                return Ok(());
            }
            if shared.may_read(&waiters) {
                waiters.reader_active = true;
                MutexGuard::unlocked(&mut waiters, || shared.read_one())?;
            } else {
                shared.wake.wait(&mut waiters);
            }
        }
    }

    /// Returns `true` if a result is ready to be read.
    #[must_use]
    pub fn poll(&self) -> bool {
        self.shared.results.poll_readable(Some(Duration::ZERO))
    }

    /// Number of outstanding queries, sync and async.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.registry.lock().len()
    }
}

impl AsRawFd for Context {
    /// Read end of the result channel; readable when [`Context::process`]
    /// has work to do.
    fn as_raw_fd(&self) -> RawFd {
        self.shared.results.as_raw_fd()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shared.requests.close_writer();
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }

        // Nobody else drains results in thread mode; keep the worker from
        // blocking on a full result pipe while it winds down.
        if self.shared.mode.get() == Some(&ConcurrencyMode::ThreadBased) {
            while self.shared.results.recv().is_ok() {}
        }
        for handle in workers {
            if handle.join().is_err() {
                tracing::warn!("Resolver worker panicked");
            }
        }
    }
}

impl Shared {
    fn is_thread_based(&self) -> bool {
        matches!(self.mode.get(), Some(ConcurrencyMode::ThreadBased))
    }

    fn may_read(&self, waiters: &WaitState) -> bool {
        self.is_thread_based() && !waiters.reader_active && !waiters.closed
    }

    /// Returns the cache reservations of an environment that never went live.
    fn release_environment(&self, env: &Environment) {
        let mut allocators = self.allocators.lock();
        allocators.root.release_shared(env.env.msg_cache);
        allocators.root.release_shared(env.env.rrset_cache);
    }

    /// Waits for `slot` to be filled, draining results while nobody else is.
    fn await_slot(&self, id: QueryId, slot: &ResultSlot) -> Result<Answer> {
        let mut waiters = self.waiters.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            if waiters.closed {
                drop(waiters);
                self.registry.lock().lookup_and_remove(id);
                return slot.take().unwrap_or_else(|| Err(ChannelError::Closed.into()));
            }
            if self.may_read(&waiters) {
                waiters.reader_active = true;
                MutexGuard::unlocked(&mut waiters, || self.read_one())?;
            } else {
                self.wake.wait(&mut waiters);
            }
        }
    }

    /// Reads and delivers one frame. The caller must hold the reader role;
    /// it is released before any async callback runs.
    fn read_one(&self) -> Result<()> {
        let frame = self.results.recv();
        let pending = frame.as_ref().ok().and_then(|f| self.route(f));
        {
            let mut waiters = self.waiters.lock();
            waiters.reader_active = false;
            self.wake.notify_all();
        }

        match frame {
            Ok(_) => {
                if let Some((callback, outcome)) = pending {
                    self.run_callback(callback, outcome);
                }
                Ok(())
            }
            Err(e) => {
                self.close(&e);
                Err(e.into())
            }
        }
    }

    /// Dispatcher thread body for process mode.
    fn dispatch_loop(&self) {
        tracing::debug!("Result dispatcher started");
        loop {
            match self.results.recv() {
                Ok(frame) => {
                    if let Some((callback, outcome)) = self.route(&frame) {
                        self.run_callback(callback, outcome);
                    }
                }
                Err(e) => {
                    self.close(&e);
                    break;
                }
            }
        }
        tracing::debug!("Result dispatcher stopped");
    }

    /// Matches a result frame to its record.
    ///
    /// Sync waiters are served on the spot; an async callback is returned so
    /// the caller can run it outside the reader role.
    fn route(&self, frame: &[u8]) -> Option<(Callback, Result<Answer>)> {
        let (id, outcome) = match Response::decode(frame) {
            Ok(response) => (response.id, response.outcome),
            Err(e) => match Response::peek_id(frame) {
                Ok(id) => (id, Err(e.into())),
                Err(_) => {
                    tracing::warn!(error = %e, "Dropping result frame without query id");
                    return None;
                }
            },
        };

        let mut waiters = self.waiters.lock();
        let Some(record) = self.registry.lock().lookup_and_remove(id) else {
            tracing::debug!(query_id = %id, "Discarding result for unknown or cancelled query");
            return None;
        };
        tracing::debug!(query_id = %id, ok = outcome.is_ok(), "Delivering result");
        match record.delivery {
            Delivery::Sync(slot) => {
                slot.fill(outcome);
                self.wake.notify_all();
                None
            }
            Delivery::Async(callback) => {
                waiters.running_callbacks += 1;
                Some((callback, outcome))
            }
        }
    }

    fn run_callback(&self, callback: Callback, outcome: Result<Answer>) {
        let _done = CallbackDone(self);
        callback(outcome);
    }

    /// Fails every pending query after the result channel broke.
    fn close(&self, cause: &ChannelError) {
        let mut callbacks = Vec::new();
        {
            let mut waiters = self.waiters.lock();
            if waiters.closed {
                return;
            }
            waiters.closed = true;
            for record in self.registry.lock().drain() {
                match record.delivery {
                    Delivery::Sync(slot) => slot.fill(Err(failure(cause).into())),
                    Delivery::Async(callback) => {
                        waiters.running_callbacks += 1;
                        callbacks.push(callback);
                    }
                }
            }
            self.wake.notify_all();
        }

        match cause {
            ChannelError::Closed => {
                tracing::info!(failed = callbacks.len(), "Result channel closed");
            }
            other => {
                tracing::warn!(error = %other, failed = callbacks.len(), "Result channel failed");
            }
        }
        for callback in callbacks {
            self.run_callback(callback, Err(failure(cause).into()));
        }
    }
}

/// The error handed to each query failed by `cause`.
fn failure(cause: &ChannelError) -> ChannelError {
    match cause {
        ChannelError::Closed => ChannelError::Closed,
        ChannelError::Protocol(msg) => ChannelError::Protocol(msg.clone()),
        ChannelError::Io(e) => ChannelError::Io(io::Error::new(e.kind(), e.to_string())),
    }
}

/// Marks an async callback as finished, even if it panicked.
struct CallbackDone<'a>(&'a Shared);

impl Drop for CallbackDone<'_> {
    fn drop(&mut self) {
        let mut waiters = self.0.waiters.lock();
        waiters.running_callbacks -= 1;
        self.0.wake.notify_all();
    }
}
