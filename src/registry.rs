//! Change Registry
//!
//! Maps live handles to the callback that keeps them in sync, and turns a
//! change list into counted tasks.
//!
//! # Dispatch
//!
//! ```text
//! ChangeList { changed, closed }
//!        │
//!        ├── closed  ──► one task per handle: deregister + release cached object
//!        │
//!        └── changed ──► one task per registered handle: callback(fresh context)
//!                                  │
//!                                  └── nested calls ──► dispatch again (same barrier)
//! ```
//!
//! Callbacks for different handles run concurrently with no ordering between
//! them. A second change for a handle whose callback is still running starts
//! another invocation; the latest invocation reflects the latest state.

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::barrier::Barrier;
use crate::context::RequestContext;
use crate::error::{Result, SessionError};
use crate::request::RequestExecutor;
use crate::rpc::{ChangeList, Handle};

/// What a dispatched callback gets to work with.
pub struct CallbackContext {
    pub handle: Handle,
    /// Fresh context for this invocation, cancelled with the session.
    pub request: RequestContext,
    /// Entry point for further calls; their changes dispatch recursively.
    pub executor: RequestExecutor,
}

#[async_trait]
pub trait ChangeCallback: Send + Sync + 'static {
    async fn on_change(&self, cx: CallbackContext) -> Result<()>;
}

pub type DeregisterHook = Box<dyn FnOnce(Handle) + Send + 'static>;

pub struct Registration {
    handle: Handle,
    callback: Arc<dyn ChangeCallback>,
    fail_on_error: bool,
    counted_on: Option<Barrier>,
    on_deregister: Mutex<Option<DeregisterHook>>,
}

impl Registration {
    /// A registration failing the current action on callback errors.
    pub fn new(handle: Handle, callback: Arc<dyn ChangeCallback>) -> Self {
        Self {
            handle,
            callback,
            fail_on_error: true,
            counted_on: None,
            on_deregister: Mutex::new(None),
        }
    }

    /// `false` downgrades callback errors to logged warnings.
    pub fn fail_on_error(mut self, fail_on_error: bool) -> Self {
        self.fail_on_error = fail_on_error;
        self
    }

    /// Also count every dispatched invocation on `barrier`, taken when the
    /// invocation is scheduled.
    pub fn counted_on(mut self, barrier: Barrier) -> Self {
        self.counted_on = Some(barrier);
        self
    }

    pub fn on_deregister(self, hook: impl FnOnce(Handle) + Send + 'static) -> Self {
        *self.on_deregister.lock() = Some(Box::new(hook));
        self
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    fn run_deregister_hook(&self) {
        if let Some(hook) = self.on_deregister.lock().take() {
            hook(self.handle);
        }
    }
}

#[derive(Default)]
pub struct EventRegistry {
    registrations: DashMap<Handle, Arc<Registration>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register, replacing any existing registration for the handle.
    ///
    /// Returns `true` when a registration was replaced. The replaced
    /// registration's deregister hook is dropped without running.
    pub fn register(&self, registration: Registration) -> bool {
        let handle = registration.handle;
        let replaced = self
            .registrations
            .insert(handle, Arc::new(registration))
            .is_some();
        if replaced {
            debug!(handle, "Replaced change registration");
        }
        replaced
    }

    /// Register only if the handle has no registration yet.
    pub fn try_register(&self, registration: Registration) -> Result<()> {
        let handle = registration.handle;
        match self.registrations.entry(handle) {
            Entry::Occupied(_) => Err(SessionError::AlreadyRegistered(handle)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(registration));
                Ok(())
            }
        }
    }

    /// Remove the registration and run its deregister hook.
    ///
    /// Returns `false` for unknown handles. The hook runs at most once even
    /// when deregistrations race.
    pub fn deregister(&self, handle: Handle) -> bool {
        match self.registrations.remove(&handle) {
            Some((_, registration)) => {
                registration.run_deregister_hook();
                trace!(handle, "Deregistered");
                true
            }
            None => false,
        }
    }

    pub fn deregister_many(&self, handles: &[Handle]) {
        for &handle in handles {
            self.deregister(handle);
        }
    }

    /// Deregister everything, running every hook.
    pub fn clear(&self) {
        let handles: Vec<Handle> = self.handles();
        self.deregister_many(&handles);
    }

    pub fn is_registered(&self, handle: Handle) -> bool {
        self.registrations.contains_key(&handle)
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.registrations.iter().map(|r| *r.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Schedule the work a change list calls for, counted on the session
    /// barrier of `executor`.
    pub fn dispatch(self: &Arc<Self>, executor: &RequestExecutor, changes: ChangeList) {
        if changes.is_empty() {
            return;
        }
        trace!(changed = ?changes.changed(), closed = ?changes.closed(), "Dispatching changes");

        for &handle in changes.closed() {
            let registry = Arc::clone(self);
            let objects = Arc::clone(executor.objects());
            executor.spawn_counted("close handle", false, async move {
                registry.deregister(handle);
                objects.remove(handle);
                Ok(())
            });
        }

        for &handle in changes.changed() {
            let Some(registration) = self.registrations.get(&handle).map(|r| Arc::clone(r.value())) else {
                continue;
            };
            let held = registration.counted_on.as_ref().map(Barrier::enter);
            let callback_executor = executor.clone();
            executor.spawn_counted("change callback", registration.fail_on_error, async move {
                let _held = held;
                let cx = CallbackContext {
                    handle,
                    request: callback_executor.request_context(),
                    executor: callback_executor,
                };
                registration
                    .callback
                    .on_change(cx)
                    .await
                    .map_err(|e| e.context(format!("change callback for handle {}", handle)))
            });
        }
    }
}
