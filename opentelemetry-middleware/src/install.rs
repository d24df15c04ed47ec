//! Capture points for exceptions nobody handled: the process panic hook and
//! request-exception notifications of registered web frameworks.
//!
//! Everything installed here is owned by an [`InstallationState`]. Installing
//! and uninstalling are idempotent, and uninstalling restores the panic hook
//! that was in place before.
use crate::error::MiddlewareError;
use opentelemetry::{otel_debug, otel_warn};
use opentelemetry_exception::{Exception, ExceptionEnricher, ThreadLocalAmbient};
use std::cell::Cell;
use std::error::Error;
use std::fmt;
use std::panic::{self, PanicHookInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

// The panic hook is process wide, so only one state may own it at a time.
static PANIC_HOOK_OWNED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static IN_PANIC_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Handed to a [`FrameworkAdapter`] to report exceptions that escaped a
/// request handler.
#[derive(Clone, Debug)]
pub struct RequestExceptionSink {
    enricher: ExceptionEnricher,
}

impl RequestExceptionSink {
    /// Report through `enricher`.
    pub fn new(enricher: ExceptionEnricher) -> Self {
        RequestExceptionSink { enricher }
    }

    /// Record `exception` as escaping: on the active request span, or on a
    /// span named `span_name` when no span is active.
    pub fn report(&self, exception: &Exception, span_name: Option<&str>) {
        let _propagating = ThreadLocalAmbient::propagate(exception);
        self.enricher.record_exception(exception, span_name);
    }

    /// Capture `err` with the current stack and report it.
    #[inline(never)]
    pub fn report_error<E: Error>(&self, err: &E) {
        self.report(&Exception::capture(err), None);
    }
}

/// A web framework's "unhandled request exception" notification.
///
/// Hosts register the adapter of the framework they run on; nothing is
/// detected automatically.
pub trait FrameworkAdapter: Send + Sync + fmt::Debug {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Start forwarding unhandled request exceptions to `sink`.
    fn subscribe(&self, sink: RequestExceptionSink) -> Result<(), MiddlewareError>;

    /// Stop forwarding. Called once for each successful `subscribe`.
    fn unsubscribe(&self) {}
}

/// Owns the installed panic hook and framework subscriptions.
pub struct InstallationState {
    enricher: ExceptionEnricher,
    capture_panics: bool,
    adapters: Vec<Arc<dyn FrameworkAdapter>>,
    subscribed: Vec<Arc<dyn FrameworkAdapter>>,
    previous_hook: Option<Arc<PanicHook>>,
    installed: bool,
}

impl fmt::Debug for InstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationState")
            .field("capture_panics", &self.capture_panics)
            .field("adapters", &self.adapters)
            .field("installed", &self.installed)
            .field("panic_hook_installed", &self.panic_hook_installed())
            .finish()
    }
}

impl InstallationState {
    /// Nothing installed yet. Panics are captured once installed.
    pub fn new(enricher: ExceptionEnricher) -> Self {
        InstallationState {
            enricher,
            capture_panics: true,
            adapters: Vec::new(),
            subscribed: Vec::new(),
            previous_hook: None,
            installed: false,
        }
    }

    /// Whether [`install`](Self::install) sets the panic hook.
    pub fn with_panic_capture(mut self, enabled: bool) -> Self {
        self.capture_panics = enabled;
        self
    }

    /// Register `adapter`. It is subscribed right away if already installed.
    pub fn register_adapter(&mut self, adapter: Arc<dyn FrameworkAdapter>) {
        if self.installed {
            self.subscribe(&adapter);
        }
        self.adapters.push(adapter);
    }

    /// Whether [`install`](Self::install) ran without a matching
    /// [`uninstall`](Self::uninstall).
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Whether this state currently owns the process panic hook.
    pub fn panic_hook_installed(&self) -> bool {
        self.previous_hook.is_some()
    }

    /// Number of adapters currently subscribed.
    pub fn subscribed_adapters(&self) -> usize {
        self.subscribed.len()
    }

    /// Set the panic hook and subscribe every registered adapter. Calling it
    /// again does nothing.
    pub fn install(&mut self) {
        if self.installed {
            return;
        }
        self.installed = true;

        if self.capture_panics {
            self.install_panic_hook();
        }
        for adapter in self.adapters.clone() {
            self.subscribe(&adapter);
        }
    }

    /// Restore the previous panic hook and unsubscribe every adapter. Calling
    /// it again does nothing.
    ///
    /// A hook set by someone else after [`install`](Self::install) is
    /// replaced by the restored one.
    pub fn uninstall(&mut self) {
        if !self.installed {
            return;
        }
        self.installed = false;

        self.uninstall_panic_hook();
        for adapter in self.subscribed.drain(..) {
            adapter.unsubscribe();
        }
    }

    fn subscribe(&mut self, adapter: &Arc<dyn FrameworkAdapter>) {
        match adapter.subscribe(RequestExceptionSink::new(self.enricher.clone())) {
            Ok(()) => {
                otel_debug!(
                    name: "InstallationState.AdapterSubscribed",
                    adapter = adapter.name().to_string()
                );
                self.subscribed.push(Arc::clone(adapter));
            }
            Err(err) => {
                otel_debug!(
                    name: "InstallationState.AdapterSkipped",
                    adapter = adapter.name().to_string(),
                    reason = err.to_string()
                );
            }
        }
    }

    fn install_panic_hook(&mut self) {
        // set_hook panics when called from a panicking thread
        if thread::panicking() {
            return;
        }
        if PANIC_HOOK_OWNED.swap(true, Ordering::AcqRel) {
            otel_warn!(
                name: "InstallationState.PanicHookOwned",
                message = "Another installation already captures panics"
            );
            return;
        }

        let previous: Arc<PanicHook> = Arc::new(panic::take_hook());
        let chained = Arc::clone(&previous);
        let enricher = self.enricher.clone();
        panic::set_hook(Box::new(move |info| {
            // caught and reported by the enricher itself
            if ExceptionEnricher::is_enriching() {
                return;
            }
            on_panic(&enricher, info);
            (**chained)(info);
        }));
        self.previous_hook = Some(previous);
    }

    fn uninstall_panic_hook(&mut self) {
        let Some(previous) = self.previous_hook.take() else {
            return;
        };
        if thread::panicking() {
            self.previous_hook = Some(previous);
            return;
        }

        // drops our hook and with it the hook's handle on `previous`
        drop(panic::take_hook());
        match Arc::try_unwrap(previous) {
            Ok(hook) => panic::set_hook(hook),
            Err(shared) => panic::set_hook(Box::new(move |info| (**shared)(info))),
        }
        PANIC_HOOK_OWNED.store(false, Ordering::Release);
    }
}

fn on_panic(enricher: &ExceptionEnricher, info: &PanicHookInfo<'_>) {
    if IN_PANIC_HOOK.with(|flag| flag.replace(true)) {
        return;
    }

    let exception = Exception::from_panic(info);
    {
        let _propagating = ThreadLocalAmbient::propagate(&exception);
        enricher.record_exception(&exception, None);
    }

    IN_PANIC_HOOK.with(|flag| flag.set(false));
}
