//! Elastic worker pool with shutdown + drain.
//!
//! The pool keeps between `min` and `max` OS threads. Work is queued FIFO with
//! no bound; a new worker is spawned on `schedule` when there are fewer idle
//! workers than queued actions and the pool is below `max`. Workers above `min`
//! that stay idle for `thread_ttl` exit.
//!
//! ## Lifecycle
//!
//! ```text
//! create ──▶ schedule* ──▶ shutdown ──▶ wait
//!                            │            │
//!                            │            └─ joins every worker
//!                            └─ queued work still runs
//! ```
//!
//! Scheduling after `shutdown` and calling `wait` without `shutdown` are
//! programmer errors and panic.

use log::{debug, error};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::api;
use crate::clock::lock;
use crate::domain::ThreadPoolError;

pub type Action = Box<dyn FnOnce() + Send + 'static>;

const MIN_THREAD_TTL: Duration = Duration::from_millis(1);

/// Construction parameters for [`ThreadPool::create_with_options`].
#[derive(Debug, Clone)]
pub struct ThreadPoolOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub thread_ttl: Duration,
    /// Wrap every action in a user-API scope. When off, workers never
    /// self-instrument.
    pub auto_profiling: bool,
    pub name: String,
}

impl Default for ThreadPoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 1,
            thread_ttl: Duration::from_secs(1),
            auto_profiling: false,
            name: "trawl-pool".to_string(),
        }
    }
}

struct PoolState {
    queue: VecDeque<Action>,
    workers: usize,
    idle: usize,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    options: ThreadPoolOptions,
    state: Mutex<PoolState>,
    work_available: Condvar,
    spawned: AtomicUsize,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Create a pool and eagerly spawn `min_size` workers.
    ///
    /// # Errors
    /// [`ThreadPoolError`] for invalid bounds, a TTL under 1 ms, or a failed spawn.
    pub fn create(
        min_size: usize,
        max_size: usize,
        thread_ttl: Duration,
    ) -> Result<Arc<Self>, ThreadPoolError> {
        Self::create_with_options(ThreadPoolOptions {
            min_size,
            max_size,
            thread_ttl,
            ..ThreadPoolOptions::default()
        })
    }

    /// # Errors
    /// See [`create`](Self::create).
    pub fn create_with_options(options: ThreadPoolOptions) -> Result<Arc<Self>, ThreadPoolError> {
        if options.min_size == 0 || options.max_size < options.min_size {
            return Err(ThreadPoolError::InvalidBounds {
                min: options.min_size,
                max: options.max_size,
            });
        }
        if options.thread_ttl < MIN_THREAD_TTL {
            return Err(ThreadPoolError::TtlTooShort);
        }

        let min_size = options.min_size;
        let shared = Arc::new(Shared {
            options,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: 0,
                idle: 0,
                shutdown: false,
                handles: Vec::new(),
            }),
            work_available: Condvar::new(),
            spawned: AtomicUsize::new(0),
        });

        {
            let mut state = lock(&shared.state);
            for _ in 0..min_size {
                spawn_worker(&shared, &mut state)?;
            }
        }

        Ok(Arc::new(Self { shared }))
    }

    /// Queue `action` for execution.
    ///
    /// # Panics
    /// Panics if the pool was shut down.
    pub fn schedule(&self, action: impl FnOnce() + Send + 'static) {
        let mut state = lock(&self.shared.state);
        assert!(!state.shutdown, "ThreadPool::schedule called after shutdown");

        state.queue.push_back(Box::new(action));
        if state.idle < state.queue.len() && state.workers < self.shared.options.max_size {
            if let Err(e) = spawn_worker(&self.shared, &mut state) {
                error!("{e}");
            }
        }
        drop(state);
        self.shared.work_available.notify_one();
    }

    /// Stop accepting work. Idempotent; queued actions still run.
    pub fn shutdown(&self) {
        let mut state = lock(&self.shared.state);
        state.shutdown = true;
        drop(state);
        self.shared.work_available.notify_all();
    }

    /// Join every worker.
    ///
    /// # Panics
    /// Panics if [`shutdown`](Self::shutdown) was not called first.
    pub fn wait(&self) {
        let handles = {
            let mut state = lock(&self.shared.state);
            assert!(state.shutdown, "ThreadPool::wait called without shutdown");
            std::mem::take(&mut state.handles)
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("{} worker panicked", self.shared.options.name);
            }
        }
    }

    pub fn shutdown_and_wait(&self) {
        self.shutdown();
        self.wait();
    }

    /// Number of live workers.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        lock(&self.shared.state).workers
    }

    #[must_use]
    pub fn number_of_busy_threads(&self) -> usize {
        let state = lock(&self.shared.state);
        state.workers - state.idle
    }

    #[must_use]
    pub fn idle_threads(&self) -> usize {
        lock(&self.shared.state).idle
    }

    #[must_use]
    pub fn queue_size(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    #[cfg(test)]
    fn tracked_handles(&self) -> usize {
        lock(&self.shared.state).handles.len()
    }
}

fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) -> Result<(), ThreadPoolError> {
    let n = shared.spawned.fetch_add(1, Ordering::Relaxed);
    let worker_shared = Arc::clone(shared);
    let handle = std::thread::Builder::new()
        .name(format!("{}-{n}", shared.options.name))
        .spawn(move || worker_loop(&worker_shared))
        .map_err(|e| ThreadPoolError::SpawnFailed(e.to_string()))?;

    // A new worker starts idle; it is counted before it runs so that
    // concurrent `schedule` calls see it.
    state.workers += 1;
    state.idle += 1;
    // Workers that expired on TTL are never joined; drop their handles here.
    state.handles.retain(|h| !h.is_finished());
    state.handles.push(handle);
    Ok(())
}

fn worker_loop(shared: &Shared) {
    if !shared.options.auto_profiling {
        api::set_thread_self_instrumentation(false);
    }

    loop {
        let action = {
            let mut state = lock(&shared.state);
            loop {
                if let Some(action) = state.queue.pop_front() {
                    state.idle -= 1;
                    break action;
                }
                if state.shutdown {
                    state.workers -= 1;
                    state.idle -= 1;
                    return;
                }
                let (guard, timeout) = shared
                    .work_available
                    .wait_timeout(state, shared.options.thread_ttl)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state = guard;
                if timeout.timed_out()
                    && state.queue.is_empty()
                    && !state.shutdown
                    && state.workers > shared.options.min_size
                {
                    state.workers -= 1;
                    state.idle -= 1;
                    debug!("{} worker exiting after idle TTL", shared.options.name);
                    return;
                }
            }
        };

        if shared.options.auto_profiling {
            let _scope = api::ScopeGuard::new("ThreadPool action");
            action();
        } else {
            action();
        }

        lock(&shared.state).idle += 1;
    }
}
