//! Process-lifetime cleanup registry.
//!
//! Every sandbox invocation registers a removal action here so the container
//! is torn down even when the host process dies to a signal mid-run. Three
//! triggers feed the same cleanup pass: normal process exit, SIGINT, and
//! SIGTERM. Cleanup failures are logged and ignored, never escalated:
//! removal races host shutdown and the container may already be gone.

use std::collections::HashSet;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, OnceLock, PoisonError};
use std::thread;

use signal_hook::iterator::Signals;
use tracing::{debug, warn};

use crate::error::PlatformError;

/// Signals that trigger a cleanup pass before the process dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSignal {
    Interrupt,
    Terminate,
}

impl TriggerSignal {
    /// Conventional 128+signo exit code for a signal death.
    pub fn exit_code(self) -> i32 {
        match self {
            TriggerSignal::Interrupt => 130,
            TriggerSignal::Terminate => 143,
        }
    }

    fn signo(self) -> i32 {
        match self {
            TriggerSignal::Interrupt => libc::SIGINT,
            TriggerSignal::Terminate => libc::SIGTERM,
        }
    }

    fn from_signo(signo: i32) -> Option<Self> {
        match signo {
            libc::SIGINT => Some(TriggerSignal::Interrupt),
            libc::SIGTERM => Some(TriggerSignal::Terminate),
            _ => None,
        }
    }
}

/// Handle for a registered cleanup action; pass it back to
/// [`LifecycleRegistry::unregister`] on normal disposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupId(u64);

type CleanupFn = Box<dyn FnOnce() + Send + 'static>;

/// The process-like surface the registry drives when a trigger fires.
///
/// [`HostProcess`] talks to the real process; tests supply fakes so triggers
/// can fire without touching real signal state.
pub trait ProcessTarget: Send + Sync {
    /// Install the exit and signal triggers that feed `registry`.
    fn install_handlers(
        self: Arc<Self>,
        registry: Arc<LifecycleRegistry>,
    ) -> std::result::Result<(), PlatformError>;

    /// Exit code already recorded for this process, if any.
    fn exit_code(&self) -> Option<i32>;

    /// Record the exit code to use if the process has to be exited directly.
    fn set_exit_code(&self, code: i32);

    /// Re-deliver `sig` with default OS semantics so shell job control sees
    /// an ordinary signal death.
    fn reraise(&self, sig: TriggerSignal) -> io::Result<()>;

    /// Last resort when re-raising is unavailable or failed.
    fn force_exit(&self, code: i32);
}

/// Registry of pending cleanup actions and installed process handlers.
///
/// One process-wide instance backs the exit/signal path (see
/// [`LifecycleRegistry::global`]); tests construct their own instances so
/// concurrent suites do not interfere.
pub struct LifecycleRegistry {
    actions: Mutex<Vec<(CleanupId, CleanupFn)>>,
    next_id: AtomicU64,
    cleanup_running: AtomicBool,
    installed: Mutex<HashSet<usize>>,
}

impl LifecycleRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            actions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            cleanup_running: AtomicBool::new(false),
            installed: Mutex::new(HashSet::new()),
        })
    }

    /// The process-wide default instance backing the exit hook.
    pub fn global() -> &'static Arc<LifecycleRegistry> {
        static GLOBAL: OnceLock<Arc<LifecycleRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(LifecycleRegistry::new)
    }

    /// Register a cleanup action. It runs at most once: either through a
    /// triggered cleanup pass or directly by the owner after unregistering.
    pub fn register(&self, action: impl FnOnce() + Send + 'static) -> CleanupId {
        let id = CleanupId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_actions().push((id, Box::new(action)));
        id
    }

    /// Remove a pending action without running it. Returns `true` when the
    /// action was still pending.
    pub fn unregister(&self, id: CleanupId) -> bool {
        let mut actions = self.lock_actions();
        let before = actions.len();
        actions.retain(|(other, _)| *other != id);
        actions.len() != before
    }

    /// Number of actions still pending.
    pub fn pending(&self) -> usize {
        self.lock_actions().len()
    }

    /// Run every pending action once, in registration order.
    ///
    /// Re-entrant calls while a pass is in progress are ignored rather than
    /// queued. A failing or panicking action never stops the pass.
    pub fn run_pending(&self) {
        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let actions: Vec<(CleanupId, CleanupFn)> = self.lock_actions().drain(..).collect();
        for (id, action) in actions {
            debug!(id = id.0, "running cleanup action");
            if catch_unwind(AssertUnwindSafe(action)).is_err() {
                warn!(id = id.0, "cleanup action panicked; continuing");
            }
        }
        self.cleanup_running.store(false, Ordering::SeqCst);
    }

    /// Install exit/interrupt/termination triggers on `target`, once per
    /// distinct target. Targets are tracked by identity, not value: two
    /// distinct targets with identical state each get their own handlers.
    ///
    /// Returns `true` when handlers were installed by this call.
    pub fn ensure_handlers<T: ProcessTarget + 'static>(
        self: Arc<Self>,
        target: &Arc<T>,
    ) -> std::result::Result<bool, PlatformError> {
        let key = Arc::as_ptr(target) as usize;
        {
            let mut installed = lock(&self.installed);
            if !installed.insert(key) {
                return Ok(false);
            }
        }
        if let Err(e) = Arc::clone(target).install_handlers(Arc::clone(&self)) {
            lock(&self.installed).remove(&key);
            return Err(e);
        }
        Ok(true)
    }

    /// Signal-path trigger: run the cleanup pass, record the conventional
    /// exit code if none is set, then hand the signal back to the OS.
    /// Falls back to a direct exit only when re-raising fails.
    pub fn handle_signal(&self, sig: TriggerSignal, target: &dyn ProcessTarget) {
        self.run_pending();
        let code = match target.exit_code() {
            Some(code) => code,
            None => {
                target.set_exit_code(sig.exit_code());
                sig.exit_code()
            }
        };
        if target.reraise(sig).is_err() {
            target.force_exit(code);
        }
    }

    fn lock_actions(&self) -> MutexGuard<'_, Vec<(CleanupId, CleanupFn)>> {
        lock(&self.actions)
    }
}

// Cleanup must proceed even if a holder panicked mid-update.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The real process: a signal-hook watcher thread, an exit hook, and
/// `process::exit` as the re-raise fallback.
///
/// Use [`HostProcess::shared`] so repeated handler installation across call
/// sites stays a no-op.
pub struct HostProcess {
    exit_code: Mutex<Option<i32>>,
}

impl HostProcess {
    pub fn shared() -> Arc<HostProcess> {
        static SHARED: OnceLock<Arc<HostProcess>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| {
            Arc::new(HostProcess {
                exit_code: Mutex::new(None),
            })
        }))
    }
}

impl ProcessTarget for HostProcess {
    fn install_handlers(
        self: Arc<Self>,
        registry: Arc<LifecycleRegistry>,
    ) -> std::result::Result<(), PlatformError> {
        install_exit_hook();

        let mut signals = Signals::new([libc::SIGINT, libc::SIGTERM])
            .map_err(PlatformError::HandlerInstall)?;
        let handle = signals.handle();

        thread::Builder::new()
            .name("cagerun-signals".into())
            .spawn(move || {
                if let Some(signo) = signals.forever().next() {
                    // One shot: drop our registration before handing the
                    // signal back so a re-delivery cannot re-enter.
                    handle.close();
                    if let Some(sig) = TriggerSignal::from_signo(signo) {
                        debug!(signo, "signal received, running cleanup");
                        registry.handle_signal(sig, &*self);
                    }
                }
            })
            .map_err(PlatformError::HandlerInstall)?;

        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    fn set_exit_code(&self, code: i32) {
        *lock(&self.exit_code) = Some(code);
    }

    fn reraise(&self, sig: TriggerSignal) -> io::Result<()> {
        // Restores the default disposition and raises, so the process dies
        // with ordinary signal semantics.
        signal_hook::low_level::emulate_default_handler(sig.signo())
    }

    fn force_exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Drain the global registry when the process exits normally.
fn install_exit_hook() {
    static EXIT_HOOK: Once = Once::new();
    EXIT_HOOK.call_once(|| {
        extern "C" fn run_global_cleanup() {
            LifecycleRegistry::global().run_pending();
        }
        // SAFETY: registering a capture-free extern "C" function.
        unsafe {
            libc::atexit(run_global_cleanup);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TestProcess {
        exit_code: Mutex<Option<i32>>,
        installs: AtomicUsize,
        reraise_ok: bool,
        raised: Mutex<Vec<TriggerSignal>>,
        forced: Mutex<Option<i32>>,
    }

    impl TestProcess {
        fn new(reraise_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                exit_code: Mutex::new(None),
                installs: AtomicUsize::new(0),
                reraise_ok,
                raised: Mutex::new(Vec::new()),
                forced: Mutex::new(None),
            })
        }
    }

    impl ProcessTarget for TestProcess {
        fn install_handlers(
            self: Arc<Self>,
            _registry: Arc<LifecycleRegistry>,
        ) -> std::result::Result<(), PlatformError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn exit_code(&self) -> Option<i32> {
            *self.exit_code.lock().unwrap()
        }

        fn set_exit_code(&self, code: i32) {
            *self.exit_code.lock().unwrap() = Some(code);
        }

        fn reraise(&self, sig: TriggerSignal) -> io::Result<()> {
            self.raised.lock().unwrap().push(sig);
            if self.reraise_ok {
                Ok(())
            } else {
                Err(io::Error::other("reraise unavailable"))
            }
        }

        fn force_exit(&self, code: i32) {
            *self.forced.lock().unwrap() = Some(code);
        }
    }

    #[test]
    fn test_signal_exit_codes() {
        assert_eq!(TriggerSignal::Interrupt.exit_code(), 130);
        assert_eq!(TriggerSignal::Terminate.exit_code(), 143);
    }

    #[test]
    fn test_interrupt_runs_actions_once_and_sets_130() {
        let registry = LifecycleRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            registry.register(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let target = TestProcess::new(true);
        registry.handle_signal(TriggerSignal::Interrupt, &*target);

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(registry.pending(), 0);
        assert_eq!(target.exit_code(), Some(130));
        assert_eq!(*target.raised.lock().unwrap(), vec![TriggerSignal::Interrupt]);
        assert_eq!(*target.forced.lock().unwrap(), None);
    }

    #[test]
    fn test_double_trigger_runs_actions_once_total() {
        let registry = LifecycleRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            registry.register(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let target = TestProcess::new(true);
        registry.handle_signal(TriggerSignal::Interrupt, &*target);
        registry.handle_signal(TriggerSignal::Interrupt, &*target);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_existing_exit_code_is_preserved() {
        let registry = LifecycleRegistry::new();
        let target = TestProcess::new(false);
        target.set_exit_code(7);

        registry.handle_signal(TriggerSignal::Terminate, &*target);

        assert_eq!(target.exit_code(), Some(7));
        assert_eq!(*target.forced.lock().unwrap(), Some(7));
    }

    #[test]
    fn test_reraise_failure_forces_exit_with_signal_code() {
        let registry = LifecycleRegistry::new();
        let target = TestProcess::new(false);

        registry.handle_signal(TriggerSignal::Terminate, &*target);

        assert_eq!(target.exit_code(), Some(143));
        assert_eq!(*target.forced.lock().unwrap(), Some(143));
    }

    #[test]
    fn test_successful_reraise_skips_forced_exit() {
        let registry = LifecycleRegistry::new();
        let target = TestProcess::new(true);

        registry.handle_signal(TriggerSignal::Interrupt, &*target);

        assert_eq!(*target.forced.lock().unwrap(), None);
    }

    #[test]
    fn test_unregister_prevents_run() {
        let registry = LifecycleRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let first = {
            let counter = Arc::clone(&counter);
            registry.register(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        {
            let counter = Arc::clone(&counter);
            registry.register(move || {
                counter.fetch_add(10, Ordering::SeqCst);
            });
        }

        assert!(registry.unregister(first));
        assert!(!registry.unregister(first));
        registry.run_pending();

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_actions_run_in_registration_order() {
        let registry = LifecycleRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            registry.register(move || {
                order.lock().unwrap().push(i);
            });
        }

        registry.run_pending();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_panicking_action_does_not_stop_the_pass() {
        let registry = LifecycleRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(|| panic!("first action fails"));
        {
            let counter = Arc::clone(&counter);
            registry.register(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        registry.run_pending();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_reentrant_pass_is_ignored() {
        let registry = LifecycleRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let reg = Arc::clone(&registry);
        let count = Arc::clone(&counter);
        registry.register(move || {
            count.fetch_add(1, Ordering::SeqCst);
            // Cleanup work triggering another pass must not recurse.
            reg.register(|| {});
            reg.run_pending();
        });

        registry.run_pending();

        // The nested run_pending was ignored; the nested action stays queued.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending(), 1);
    }

    #[test]
    fn test_ensure_handlers_is_idempotent_per_target_identity() {
        let registry = LifecycleRegistry::new();
        let target = TestProcess::new(true);

        assert!(Arc::clone(&registry).ensure_handlers(&target).unwrap());
        assert!(!Arc::clone(&registry).ensure_handlers(&target).unwrap());
        assert_eq!(target.installs.load(Ordering::SeqCst), 1);

        // A distinct target with identical state installs separately.
        let other = TestProcess::new(true);
        assert!(Arc::clone(&registry).ensure_handlers(&other).unwrap());
        assert_eq!(other.installs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_registry_is_a_singleton() {
        let a = Arc::as_ptr(LifecycleRegistry::global());
        let b = Arc::as_ptr(LifecycleRegistry::global());
        assert_eq!(a, b);
    }
}
