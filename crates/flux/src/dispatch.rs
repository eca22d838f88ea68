//! The action router.
//!
//! A [`Dispatcher`] keeps an ordered subscription list per action id and
//! delivers actions synchronously:
//!
//! 1. every handler subscribed to the action, in subscription order
//! 2. every handler subscribed to [`ActionId::ANY`]
//! 3. memento providers of the invoked handlers, when capturing
//! 4. one undo group for the collected mementos
//!
//! Any failure in those steps is turned into a [`DispatchDiagnostic`], logged,
//! and handed to the configured [`ErrorSink`].

use crate::action::ActionId;
use crate::error::{ErrorSink, FluxError};
use crate::memento::Memento;
use crate::undo::UndoManager;
use serde::Serialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, error, trace};

/// Action handler. Receives the real action id even when subscribed to
/// [`ActionId::ANY`].
pub type Handler = Rc<dyn Fn(ActionId, &[Value]) -> anyhow::Result<()>>;

/// Returns the mementos a handler wants stored for one dispatch.
pub type MementoProvider = Rc<dyn Fn(ActionId, &[Value]) -> anyhow::Result<Vec<Memento>>>;

#[derive(Clone)]
struct Subscription {
    handler: Handler,
    memento_provider: Option<MementoProvider>,
}

impl Subscription {
    fn is(&self, handler: &Handler) -> bool {
        same_handler(&self.handler, handler)
    }
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

/// Everything known about a failed dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchDiagnostic {
    pub action: ActionId,
    pub capture_mementos: bool,
    pub args: String,
    pub mementos: Vec<Memento>,
    pub message: String,
    pub chain: String,
}

impl DispatchDiagnostic {
    fn to_context(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.message.clone()))
    }
}

pub(crate) struct DispatcherInner {
    subscriptions: RefCell<HashMap<ActionId, Vec<Subscription>>>,
    disabled: RefCell<HashSet<ActionId>>,
    undoing: Cell<bool>,
    undo: RefCell<Option<UndoManager>>,
    sink: Rc<dyn ErrorSink>,
}

/// Process-wide action router. Cloning yields another handle to the same
/// router.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<DispatcherInner>,
}

/// Non-owning dispatcher handle held by collaborators the dispatcher owns.
#[derive(Clone)]
pub(crate) struct WeakDispatcher(Weak<DispatcherInner>);

impl WeakDispatcher {
    pub(crate) fn upgrade(&self) -> Result<Dispatcher, FluxError> {
        self.0
            .upgrade()
            .map(|inner| Dispatcher { inner })
            .ok_or(FluxError::Detached)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("actions", &self.inner.subscriptions.borrow().len())
            .field("disabled", &self.inner.disabled.borrow().len())
            .field("undoing", &self.inner.undoing.get())
            .finish()
    }
}

/// Resets the undoing flag to its previous value when dropped.
struct UndoingGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl Drop for UndoingGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

impl Dispatcher {
    pub fn new(sink: Rc<dyn ErrorSink>) -> Self {
        Self {
            inner: Rc::new(DispatcherInner {
                subscriptions: RefCell::new(HashMap::new()),
                disabled: RefCell::new(HashSet::new()),
                undoing: Cell::new(false),
                undo: RefCell::new(None),
                sink,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher(Rc::downgrade(&self.inner))
    }

    pub(crate) fn attach_undo_manager(&self, undo: UndoManager) {
        *self.inner.undo.borrow_mut() = Some(undo);
    }

    pub fn undo_manager(&self) -> Option<UndoManager> {
        self.inner.undo.borrow().clone()
    }

    pub fn error_sink(&self) -> Rc<dyn ErrorSink> {
        Rc::clone(&self.inner.sink)
    }

    /// True while an undo replay dispatch is running.
    pub fn is_undoing(&self) -> bool {
        self.inner.undoing.get()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe `handler` to `action`. Subscribing the same handler twice is
    /// a no-op.
    pub fn subscribe_action(
        &self,
        action: ActionId,
        handler: Handler,
        memento_provider: Option<MementoProvider>,
    ) {
        let mut subscriptions = self.inner.subscriptions.borrow_mut();
        let list = subscriptions.entry(action).or_default();
        if list.iter().any(|s| s.is(&handler)) {
            return;
        }
        trace!(%action, "subscribed handler");
        list.push(Subscription {
            handler,
            memento_provider,
        });
    }

    /// Subscribe a closure and return the handler for later unsubscription.
    pub fn subscribe_fn<F>(&self, action: ActionId, handler: F) -> Handler
    where
        F: Fn(ActionId, &[Value]) -> anyhow::Result<()> + 'static,
    {
        let handler: Handler = Rc::new(handler);
        self.subscribe_action(action, Rc::clone(&handler), None);
        handler
    }

    /// Remove `handler` from `action`. Unknown handlers are ignored.
    pub fn unsubscribe_action(&self, action: ActionId, handler: &Handler) {
        let mut subscriptions = self.inner.subscriptions.borrow_mut();
        if let Some(list) = subscriptions.get_mut(&action) {
            list.retain(|s| !s.is(handler));
            if list.is_empty() {
                subscriptions.remove(&action);
            }
        }
    }

    pub fn has_subscribers(&self, action: ActionId) -> bool {
        self.inner
            .subscriptions
            .borrow()
            .get(&action)
            .is_some_and(|list| !list.is_empty())
    }

    // ========================================================================
    // Enable / disable
    // ========================================================================

    pub fn disable_action(&self, action: ActionId) {
        self.inner.disabled.borrow_mut().insert(action);
    }

    pub fn enable_action(&self, action: ActionId) {
        self.inner.disabled.borrow_mut().remove(&action);
    }

    pub fn is_disabled(&self, action: ActionId) -> bool {
        self.inner.disabled.borrow().contains(&action)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Dispatch `action`, capturing mementos for undo.
    pub fn dispatch_action(&self, action: ActionId, args: &[Value]) -> Result<(), FluxError> {
        self.dispatch(true, action, args)
    }

    /// Dispatch `action` as part of an undo replay. Mementos are not
    /// collected and [`is_undoing`](Self::is_undoing) reports true for the
    /// duration of the call.
    pub fn dispatch_undo_action(&self, action: ActionId, args: &[Value]) -> Result<(), FluxError> {
        let _guard = UndoingGuard {
            flag: &self.inner.undoing,
            previous: self.inner.undoing.replace(true),
        };
        self.dispatch(false, action, args)
    }

    fn dispatch(&self, capture_mementos: bool, action: ActionId, args: &[Value]) -> Result<(), FluxError> {
        if action == ActionId::ANY {
            return self.inner.sink.fatal(
                "the wildcard action cannot be dispatched directly",
                &serde_json::json!({ "action": action }),
            );
        }
        if self.is_disabled(action) {
            trace!(%action, "action disabled, skipping dispatch");
            return Ok(());
        }

        debug!(%action, capture_mementos, args = args.len(), "dispatching action");

        let mut mementos = Vec::new();
        match self.deliver(capture_mementos, action, args, &mut mementos) {
            Ok(()) => Ok(()),
            Err(err) => self.report(capture_mementos, action, args, mementos, err),
        }
    }

    fn deliver(
        &self,
        capture_mementos: bool,
        action: ActionId,
        args: &[Value],
        mementos: &mut Vec<Memento>,
    ) -> Result<(), FluxError> {
        // Snapshot so handlers may (un)subscribe while being called.
        let (specific, wildcard) = {
            let subscriptions = self.inner.subscriptions.borrow();
            let specific = subscriptions.get(&action).cloned().unwrap_or_default();
            let wildcard = subscriptions
                .get(&ActionId::ANY)
                .cloned()
                .unwrap_or_default();
            (specific, wildcard)
        };

        let mut invoked = Vec::with_capacity(specific.len() + wildcard.len());
        for subscription in specific.into_iter().chain(wildcard) {
            (subscription.handler)(action, args)
                .map_err(|err| FluxError::from_handler(action, err))?;
            invoked.push(subscription);
        }

        if !capture_mementos {
            return Ok(());
        }

        for provider in invoked.iter().filter_map(|s| s.memento_provider.as_ref()) {
            let provided = provider(action, args).map_err(|err| FluxError::from_handler(action, err))?;
            mementos.extend(provided);
        }

        if mementos.is_empty() {
            return Ok(());
        }
        if let Some(undo) = self.undo_manager() {
            undo.store_mementos(std::mem::take(mementos), action, args.to_vec());
        }
        Ok(())
    }

    fn report(
        &self,
        capture_mementos: bool,
        action: ActionId,
        args: &[Value],
        mementos: Vec<Memento>,
        err: FluxError,
    ) -> Result<(), FluxError> {
        let diagnostic = DispatchDiagnostic {
            action,
            capture_mementos,
            args: Value::from(args.to_vec()).to_string(),
            mementos,
            message: err.to_string(),
            chain: format!("{err:?}"),
        };

        error!(
            %action,
            capture_mementos,
            args = %diagnostic.args,
            mementos = diagnostic.mementos.len(),
            error = %diagnostic.message,
            "dispatch failed"
        );

        self.inner
            .sink
            .framework("dispatch failed", err, &diagnostic.to_context())
    }
}
