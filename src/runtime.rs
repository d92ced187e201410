/*!
 * Signal Runtime
 *
 * Process-wide owner of the resolved signal set, the chain registry and the
 * suspend coordinator. Exactly one runtime is installed per process; the
 * dispatch trampoline reaches it through a lock-free global.
 */

use crate::core::config::{SignalSelection, SuspendConfig};
use crate::core::errors::{SuspendError, SuspendResult};
use crate::core::traits::{ContextCapture, InitiatorNotifier, ReclamationSlots, ThreadDirectory};
use crate::core::types::{signal_name, NativeThreadId, SignalNumber, SignalRole};
use crate::monitoring::{AtomicSuspendStats, SuspendStats};
use crate::signals::negotiator::{validate_explicit, PlatformPolicy, SignalNegotiator};
use crate::signals::{
    dispatch_trampoline, os, ChainRegistry, DispatchPolicy, RoleHandlers, SignalSet,
};
use crate::suspend::{
    restart_signal_handler, suspend_signal_handler, ForeignThreadOracle, HazardSlots,
    SemaphoreNotifier, SuspendCoordinator,
};
use crate::thread::{ThreadRecord, ThreadRegistry, UcontextCapture};
use nix::libc;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info};

static RUNTIME: OnceLock<SignalRuntime> = OnceLock::new();

/// Foreign-runtime predicate; settable before the runtime exists
static FOREIGN_THREADS: ForeignThreadOracle = ForeignThreadOracle::new();

const ENGINE_HANDLERS: RoleHandlers = RoleHandlers {
    suspend: suspend_signal_handler,
    restart: restart_signal_handler,
};

/// The installed runtime, if any; a single atomic load, usable from signal
/// context
#[inline]
pub fn installed() -> Option<&'static SignalRuntime> {
    RUNTIME.get()
}

/// Process-wide suspend engine
pub struct SignalRuntime {
    config: SuspendConfig,
    signals: SignalSet,
    chain: ChainRegistry,
    directory: Arc<dyn ThreadDirectory>,
    registry: Option<Arc<ThreadRegistry>>,
    reclamation: Arc<dyn ReclamationSlots>,
    coordinator: SuspendCoordinator,
    stats: Arc<AtomicSuspendStats>,
}

impl SignalRuntime {
    pub fn builder() -> SignalRuntimeBuilder {
        SignalRuntimeBuilder::new()
    }

    /// Build with default collaborators and install process-wide
    pub fn init(config: SuspendConfig) -> SuspendResult<&'static SignalRuntime> {
        Self::builder().with_config(config).install()
    }

    #[inline]
    pub fn config(&self) -> &SuspendConfig {
        &self.config
    }

    #[inline]
    pub fn signals(&self) -> &SignalSet {
        &self.signals
    }

    #[inline]
    pub fn chain(&self) -> &ChainRegistry {
        &self.chain
    }

    #[inline]
    pub fn coordinator(&self) -> &SuspendCoordinator {
        &self.coordinator
    }

    /// Default thread registry, unless a custom directory was supplied
    pub fn thread_registry(&self) -> Option<&Arc<ThreadRegistry>> {
        self.registry.as_ref()
    }

    pub fn stats(&self) -> SuspendStats {
        self.stats.snapshot()
    }

    /// View handed to the trampoline on every delivery
    #[inline]
    pub fn dispatch_policy(&self) -> DispatchPolicy<'_> {
        DispatchPolicy {
            chain: &self.chain,
            handlers: ENGINE_HANDLERS,
            directory: &*self.directory,
            reclamation: &*self.reclamation,
            signals: &self.signals,
            stats: &self.stats,
        }
    }

    /// Attach the calling thread to the default registry
    pub fn attach_current_thread(&self) -> SuspendResult<Arc<ThreadRecord>> {
        self.default_registry()?.attach()
    }

    /// Detach the calling thread from the default registry
    pub fn detach_current_thread(&self) -> SuspendResult<()> {
        self.default_registry()?.detach()
    }

    fn default_registry(&self) -> SuspendResult<&Arc<ThreadRegistry>> {
        self.registry.as_ref().ok_or_else(|| {
            SuspendError::InvalidConfig("runtime was built with a custom thread directory".into())
        })
    }

    /// Chain the engine handlers onto the three numbers and unblock them
    fn install_handlers(&self) -> SuspendResult<()> {
        let handler = |role| ENGINE_HANDLERS.for_role(role);
        self.chain.install(
            self.signals.suspend(),
            handler(SignalRole::Suspend),
            libc::SA_RESTART,
        )?;
        self.chain.install(
            self.signals.restart(),
            handler(SignalRole::Restart),
            libc::SA_RESTART,
        )?;
        // No SA_RESTART: the abort signal exists to break blocking syscalls
        self.chain
            .install(self.signals.abort(), handler(SignalRole::Abort), 0)?;

        os::unblock_signals(&self.signals.as_sigset());
        Ok(())
    }

    /// Re-install the handlers over whatever replaced them, reusing the
    /// numbers resolved at init
    pub fn reload(&self) -> SuspendResult<()> {
        self.install_handlers()?;
        self.stats.inc_reloads();
        info!(signals = ?self.signals, "Signal handlers reloaded");
        Ok(())
    }
}

/// Builder for [`SignalRuntime`]
pub struct SignalRuntimeBuilder {
    config: SuspendConfig,
    directory: Option<Arc<dyn ThreadDirectory>>,
    registry: Option<Arc<ThreadRegistry>>,
    capture: Option<Arc<dyn ContextCapture>>,
    reclamation: Option<Arc<dyn ReclamationSlots>>,
    notifier: Option<Arc<dyn InitiatorNotifier>>,
}

impl SignalRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: SuspendConfig::default(),
            directory: None,
            registry: None,
            capture: None,
            reclamation: None,
            notifier: None,
        }
    }

    pub fn with_config(mut self, config: SuspendConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing default registry
    pub fn with_registry(mut self, registry: Arc<ThreadRegistry>) -> Self {
        self.directory = Some(registry.clone());
        self.registry = Some(registry);
        self
    }

    /// Use an embedder-owned thread directory instead of the default registry
    pub fn with_directory(mut self, directory: Arc<dyn ThreadDirectory>) -> Self {
        self.directory = Some(directory);
        self.registry = None;
        self
    }

    pub fn with_capture(mut self, capture: Arc<dyn ContextCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_reclamation(mut self, reclamation: Arc<dyn ReclamationSlots>) -> Self {
        self.reclamation = Some(reclamation);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn InitiatorNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Resolve signal numbers and assemble the runtime without touching the
    /// OS signal table
    pub fn build(self) -> SuspendResult<SignalRuntime> {
        self.config.validate()?;
        let signals = SignalSet::new(resolve_numbers(&self.config)?);

        let (directory, registry) = match (self.directory, self.registry) {
            (Some(directory), registry) => (directory, registry),
            (None, _) => {
                let registry = Arc::new(ThreadRegistry::new());
                (registry.clone() as Arc<dyn ThreadDirectory>, Some(registry))
            }
        };
        let capture = self
            .capture
            .unwrap_or_else(|| Arc::new(UcontextCapture::new()) as Arc<dyn ContextCapture>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(SemaphoreNotifier::new()) as Arc<dyn InitiatorNotifier>);
        let reclamation = self
            .reclamation
            .unwrap_or_else(|| {
                Arc::new(HazardSlots::new(self.config.reclamation_slots)) as Arc<dyn ReclamationSlots>
            });
        let stats = Arc::new(AtomicSuspendStats::new());

        let coordinator = SuspendCoordinator::new(
            directory.clone(),
            capture,
            notifier,
            &FOREIGN_THREADS,
            self.config.mode,
            signals,
            stats.clone(),
        );

        Ok(SignalRuntime {
            config: self.config,
            signals,
            chain: ChainRegistry::new(dispatch_trampoline),
            directory,
            registry,
            reclamation,
            coordinator,
            stats,
        })
    }

    /// Build, publish process-wide, then install the handlers
    pub fn install(self) -> SuspendResult<&'static SignalRuntime> {
        if RUNTIME.get().is_some() {
            return Err(SuspendError::AlreadyInitialized);
        }

        let runtime = self.build()?;
        let mut published = false;
        let installed = RUNTIME.get_or_init(|| {
            published = true;
            runtime
        });
        if !published {
            return Err(SuspendError::AlreadyInitialized);
        }

        installed.install_handlers()?;
        info!(
            suspend = %signal_name(installed.signals.suspend()),
            restart = %signal_name(installed.signals.restart()),
            abort = %signal_name(installed.signals.abort()),
            mode = ?installed.config.mode,
            "Suspend signals initialized"
        );
        Ok(installed)
    }
}

impl Default for SignalRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_numbers(config: &SuspendConfig) -> SuspendResult<[SignalNumber; 3]> {
    match config.signals {
        SignalSelection::Platform => SignalNegotiator::new().resolve_all(),
        SignalSelection::Explicit {
            suspend,
            restart,
            abort,
        } => validate_explicit([suspend, restart, abort], PlatformPolicy::current().limit),
    }
}

// =============================================================================
// Process-level entry points
// =============================================================================

/// Initialize from the environment; aborts the process on failure
///
/// Returns the already installed runtime when called again.
pub fn init_signals() -> &'static SignalRuntime {
    if let Some(runtime) = installed() {
        debug!("Suspend signals already initialized");
        return runtime;
    }

    match SuspendConfig::from_env().and_then(SignalRuntime::init) {
        Ok(runtime) => runtime,
        Err(SuspendError::AlreadyInitialized) => match installed() {
            Some(runtime) => runtime,
            None => crate::core::fatal::fatal("suspend runtime vanished during init"),
        },
        Err(err) => {
            error!(error = %err, "Suspend signal initialization failed");
            crate::core::fatal::fatal("suspend signal initialization failed")
        }
    }
}

/// Re-install handlers after a runtime reload
pub fn reload_signal_handlers() -> SuspendResult<()> {
    installed().ok_or(SuspendError::NotInitialized)?.reload()
}

fn resolved(role: SignalRole) -> SuspendResult<SignalNumber> {
    installed()
        .map(|runtime| runtime.signals.get(role))
        .ok_or(SuspendError::NotInitialized)
}

pub fn get_suspend_signal() -> SuspendResult<SignalNumber> {
    resolved(SignalRole::Suspend)
}

pub fn get_restart_signal() -> SuspendResult<SignalNumber> {
    resolved(SignalRole::Restart)
}

pub fn get_abort_signal() -> SuspendResult<SignalNumber> {
    resolved(SignalRole::Abort)
}

/// Install the foreign-runtime ownership predicate
pub fn register_thread_checker<F>(checker: F)
where
    F: Fn(NativeThreadId) -> bool + Send + Sync + 'static,
{
    FOREIGN_THREADS.register(checker);
    debug!("Foreign thread checker registered");
}

pub fn is_owned_by_foreign_runtime(tid: NativeThreadId) -> bool {
    FOREIGN_THREADS.is_owned(tid)
}
