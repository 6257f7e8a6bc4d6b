//! Process-wide sink for user-API scopes.
//!
//! At most one listener is installed at a time. Scopes are copied and handed
//! to a single-thread pool so the instrumented thread never runs the user
//! callback. The pool's worker is marked "do not self-instrument", so a
//! callback that itself uses the API cannot feed scopes back into the
//! listener.
//!
//! Every deferred task re-checks, under the global mutex, that the listener
//! it was posted for is still installed. Scopes that race with teardown are
//! dropped.

use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::scope::Scope;
use crate::clock::lock;
use crate::concurrency::{ThreadPool, ThreadPoolOptions};
use crate::domain::ListenerError;

pub type ScopeCallback = Arc<dyn Fn(&Scope) + Send + Sync + 'static>;

struct InstalledListener {
    generation: u64,
    callback: ScopeCallback,
    pool: Arc<ThreadPool>,
}

static LISTENER: Mutex<Option<InstalledListener>> = Mutex::new(None);
static ACTIVE: AtomicBool = AtomicBool::new(false);
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Handle to the installed listener. Dropping it uninstalls the listener and
/// drains the scopes already posted.
pub struct TracingListener {
    generation: u64,
    pool: Arc<ThreadPool>,
}

impl TracingListener {
    /// # Errors
    /// [`ListenerError::AlreadyInstalled`] if another listener is active, or a
    /// pool creation error.
    pub fn install(
        callback: impl Fn(&Scope) + Send + Sync + 'static,
    ) -> Result<Self, ListenerError> {
        let mut slot = lock(&LISTENER);
        if slot.is_some() {
            return Err(ListenerError::AlreadyInstalled);
        }

        let pool = ThreadPool::create_with_options(ThreadPoolOptions {
            min_size: 1,
            max_size: 1,
            thread_ttl: Duration::from_millis(500),
            auto_profiling: false,
            name: "trawl-listener".to_string(),
        })?;
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);

        *slot = Some(InstalledListener {
            generation,
            callback: Arc::new(callback),
            pool: Arc::clone(&pool),
        });
        ACTIVE.store(true, Ordering::Release);
        debug!("Tracing listener #{generation} installed");

        Ok(Self { generation, pool })
    }

    #[must_use]
    pub fn is_active() -> bool {
        ACTIVE.load(Ordering::Acquire)
    }

    /// Block until every scope posted so far has reached the callback.
    pub fn flush(&self) {
        let (done, wait) = crossbeam_channel::bounded(1);
        self.pool.schedule(move || {
            let _ = done.send(());
        });
        let _ = wait.recv();
    }

    /// Post `scope` to the installed listener, if any.
    pub fn defer_scope_processing(scope: Scope) {
        if !Self::is_active() {
            return;
        }
        // Scheduling under the slot mutex orders this post before any
        // uninstall, so the pool is never shut down underneath it.
        let slot = lock(&LISTENER);
        let Some(listener) = slot.as_ref() else {
            return;
        };
        let generation = listener.generation;
        listener.pool.schedule(move || {
            let slot = lock(&LISTENER);
            if let Some(listener) = slot.as_ref() {
                if listener.generation == generation {
                    (listener.callback)(&scope);
                }
            }
        });
    }
}

impl Drop for TracingListener {
    fn drop(&mut self) {
        {
            let mut slot = lock(&LISTENER);
            if slot.as_ref().is_some_and(|l| l.generation == self.generation) {
                *slot = None;
                ACTIVE.store(false, Ordering::Release);
            }
        }
        self.pool.shutdown();
        self.pool.wait();
        debug!("Tracing listener #{} uninstalled", self.generation);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    /// The listener slot is process-wide; tests that install one serialize on this.
    static SERIAL: Mutex<()> = Mutex::new(());

    pub(crate) fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{self, ScopeKind};
    use crate::domain::Color;

    #[test]
    fn test_second_install_fails() {
        let _serial = test_support::serial();
        let first = TracingListener::install(|_| {}).unwrap();
        assert!(matches!(TracingListener::install(|_| {}), Err(ListenerError::AlreadyInstalled)));
        drop(first);
        assert!(!TracingListener::is_active());
        let again = TracingListener::install(|_| {}).unwrap();
        drop(again);
    }

    #[test]
    fn test_flush_delivers_posted_scopes() {
        let _serial = test_support::serial();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = TracingListener::install(move |scope: &Scope| {
            sink.lock().unwrap().push((scope.kind, scope.name.clone(), scope.depth));
        })
        .unwrap();

        std::thread::spawn(|| {
            api::start("outer", Color::default());
            api::start("inner", Color::default());
            api::stop();
            api::stop();
            api::start_async("load", 7, Color::default());
        })
        .join()
        .unwrap();
        listener.flush();
        drop(listener);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (ScopeKind::Start, "outer".to_string(), 0),
                (ScopeKind::Start, "inner".to_string(), 1),
                (ScopeKind::Stop, "inner".to_string(), 1),
                (ScopeKind::Stop, "outer".to_string(), 0),
                (ScopeKind::StartAsync, "load".to_string(), 0),
            ]
        );
    }

    #[test]
    fn test_scopes_after_uninstall_are_dropped() {
        let _serial = test_support::serial();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let listener = TracingListener::install(move |_: &Scope| {
            *sink.lock().unwrap() += 1;
        })
        .unwrap();
        drop(listener);
        api::track_value("ignored", trawl_common::TrackValue::Int(1));
        assert_eq!(*count.lock().unwrap(), 0);
    }
}
