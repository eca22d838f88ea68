//! Bracket execution engine.
//!
//! A [`PluginContainer`] lets several plugins wrap one action. The most
//! recently wrapped plugin is the outermost bracket: it runs first and
//! finishes last.
//!
//! ```text
//! wrap(C) wrap(D) wrap(E), dispatch
//!
//!   run E ─► run D ─► run C
//!                        │
//!   finish E ◄─ finish D ◄┘
//! ```
//!
//! # Protocol
//!
//! Each dispatch opens a round. Every started plugin owns one slot; a slot is
//! filled when the plugin completes, either right after `run` or later through
//! its [`PluginControl`]. Filled slots collapse only from the innermost pending
//! slot outward and only while they are contiguous, so an outer plugin never
//! sees `after_finish`/`after_abort` before every inner plugin that started
//! has completed.
//!
//! # Invariants
//!
//! 1. An action with an open round cannot be dispatched again.
//! 2. An abort raised while plugins are still being run aborts every started
//!    plugin, innermost first, and skips the plugins not yet run.
//! 3. A round that ends without abort commits its mementos as one undo group,
//!    unless it was started by an undo replay.

use crate::action::{ActionId, Payload};
use crate::dispatch::{Dispatcher, Handler};
use crate::error::FluxError;
use crate::memento::{Memento, RestoreFromMemento};
use crate::plugin::{same_plugin, ControlState, Plugin, PluginControl, PluginSpec};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

struct Slot {
    plugin: Rc<dyn Plugin>,
    control: Option<Rc<ControlState>>,
    /// Protocol entry: `Some(abort)` once the plugin has completed.
    outcome: Option<bool>,
}

/// Bookkeeping for one in-flight action.
struct Round {
    id: u64,
    args: Payload,
    /// Outermost first.
    slots: Vec<Slot>,
    /// Slots `0..pending` make up the running stack.
    pending: usize,
    /// Set while the run loop is still invoking plugins.
    running: bool,
    aborted: bool,
    /// Abort flag carried outward while collapsing.
    cascade: bool,
    replaying: bool,
    mementos: Vec<Memento>,
}

enum Step {
    Wait,
    Finalize,
    Pop {
        plugin: Rc<dyn Plugin>,
        aborted: bool,
        args: Payload,
    },
}

pub(crate) struct ContainerInner {
    dispatcher: Dispatcher,
    /// Wrap order: the last plugin is the outermost.
    plugins: RefCell<HashMap<ActionId, Vec<Rc<dyn Plugin>>>>,
    wildcard: RefCell<Vec<Rc<dyn Plugin>>>,
    handlers: RefCell<HashMap<ActionId, Handler>>,
    rounds: RefCell<HashMap<ActionId, Round>>,
    next_round: Cell<u64>,
}

/// Per-consumer engine running plugins as nested brackets around actions.
#[derive(Clone)]
pub struct PluginContainer {
    inner: Rc<ContainerInner>,
}

impl fmt::Debug for PluginContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContainer")
            .field("actions", &self.inner.plugins.borrow().len())
            .field("wildcard", &self.inner.wildcard.borrow().len())
            .field("in_flight", &self.inner.rounds.borrow().len())
            .finish()
    }
}

/// Routes a memento restore back to the plugin that produced it.
struct PluginRestorer {
    plugin: Rc<dyn Plugin>,
    container: Weak<ContainerInner>,
}

impl RestoreFromMemento for PluginRestorer {
    fn restore_from_memento(&self, memento: &Memento) -> anyhow::Result<()> {
        let inner = self.container.upgrade().ok_or(FluxError::Detached)?;
        self.plugin
            .restore_from_memento(&PluginContainer { inner }, memento)
    }
}

impl PluginContainer {
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            inner: Rc::new(ContainerInner {
                dispatcher: dispatcher.clone(),
                plugins: RefCell::new(HashMap::new()),
                wildcard: RefCell::new(Vec::new()),
                handlers: RefCell::new(HashMap::new()),
                rounds: RefCell::new(HashMap::new()),
                next_round: Cell::new(0),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<ContainerInner>) -> Self {
        Self { inner }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Whether `action` has an open round.
    pub fn is_running(&self, action: ActionId) -> bool {
        self.inner.rounds.borrow().contains_key(&action)
    }

    /// Plugins that would run for `action`, outermost first.
    pub fn plugins_for(&self, action: ActionId) -> Vec<Rc<dyn Plugin>> {
        let plugins = self.inner.plugins.borrow();
        let list = match plugins.get(&action) {
            Some(list) => list.clone(),
            None if action.is_reserved() => Vec::new(),
            None => self.inner.wildcard.borrow().clone(),
        };
        list.into_iter().rev().collect()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Wrap `plugin` around `action`, making it the outermost bracket.
    pub fn wrap(&self, action: ActionId, plugin: Rc<dyn Plugin>) {
        if action == ActionId::ANY {
            self.wrap_wildcard(plugin);
            return;
        }

        let created = match self.inner.plugins.borrow_mut().entry(action) {
            Entry::Occupied(mut entry) => {
                let list = entry.get_mut();
                if !list.iter().any(|p| same_plugin(p, &plugin)) {
                    list.push(plugin);
                }
                false
            }
            Entry::Vacant(entry) => {
                let mut list = self.inner.wildcard.borrow().clone();
                if !list.iter().any(|p| same_plugin(p, &plugin)) {
                    list.push(plugin);
                }
                entry.insert(list);
                true
            }
        };

        trace!(%action, "wrapped plugin");
        if created {
            self.subscribe(action);
        }
    }

    fn wrap_wildcard(&self, plugin: Rc<dyn Plugin>) {
        {
            let mut wildcard = self.inner.wildcard.borrow_mut();
            if wildcard.iter().any(|p| same_plugin(p, &plugin)) {
                return;
            }
            wildcard.push(Rc::clone(&plugin));
        }
        for list in self.inner.plugins.borrow_mut().values_mut() {
            if !list.iter().any(|p| same_plugin(p, &plugin)) {
                list.push(Rc::clone(&plugin));
            }
        }

        trace!("wrapped wildcard plugin");
        if !self.inner.handlers.borrow().contains_key(&ActionId::ANY) {
            self.subscribe(ActionId::ANY);
        }
    }

    /// Resolve and wrap every spec, returning the resolved plugins.
    pub fn configure<I>(&self, specs: I) -> Vec<Rc<dyn Plugin>>
    where
        I: IntoIterator<Item = (ActionId, PluginSpec)>,
    {
        specs
            .into_iter()
            .map(|(action, spec)| {
                let plugin = spec.resolve();
                self.wrap(action, Rc::clone(&plugin));
                plugin
            })
            .collect()
    }

    /// Remove `plugin` from `action`. Detaching from [`ActionId::ANY`] also
    /// removes it from every action it was wrapped into as a wildcard.
    pub fn detach(&self, action: ActionId, plugin: &Rc<dyn Plugin>) {
        if action == ActionId::ANY {
            self.inner
                .wildcard
                .borrow_mut()
                .retain(|p| !same_plugin(p, plugin));
            let actions: Vec<ActionId> = {
                let mut plugins = self.inner.plugins.borrow_mut();
                for list in plugins.values_mut() {
                    list.retain(|p| !same_plugin(p, plugin));
                }
                plugins.keys().copied().collect()
            };
            for action in actions {
                self.prune(action);
            }
            if self.inner.wildcard.borrow().is_empty() {
                self.unsubscribe(ActionId::ANY);
            }
        } else {
            if let Some(list) = self.inner.plugins.borrow_mut().get_mut(&action) {
                list.retain(|p| !same_plugin(p, plugin));
            }
            self.prune(action);
        }
        trace!(%action, "detached plugin");
    }

    /// Drop the list for `action` once only wildcard plugins remain in it.
    fn prune(&self, action: ActionId) {
        let empty = {
            let wildcard = self.inner.wildcard.borrow();
            let plugins = self.inner.plugins.borrow();
            plugins.get(&action).is_some_and(|list| {
                list.iter()
                    .all(|p| wildcard.iter().any(|w| same_plugin(w, p)))
            })
        };
        if empty {
            self.inner.plugins.borrow_mut().remove(&action);
            self.unsubscribe(action);
        }
    }

    /// Detach every plugin and wildcard plugin.
    pub fn destroy(&self) {
        let handlers: Vec<(ActionId, Handler)> =
            self.inner.handlers.borrow_mut().drain().collect();
        for (action, handler) in handlers {
            self.inner.dispatcher.unsubscribe_action(action, &handler);
        }
        self.inner.plugins.borrow_mut().clear();
        self.inner.wildcard.borrow_mut().clear();
        debug!("destroyed plugin container");
    }

    fn subscribe(&self, action: ActionId) {
        let weak = Rc::downgrade(&self.inner);
        let wildcard = action == ActionId::ANY;
        let handler: Handler = Rc::new(move |action: ActionId, args: &[Value]| {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            let container = PluginContainer { inner };
            if wildcard {
                container.handle_wildcard(action, args)?;
            } else {
                container.handle_action(action, args)?;
            }
            Ok(())
        });
        self.inner
            .dispatcher
            .subscribe_action(action, Rc::clone(&handler), None);
        self.inner.handlers.borrow_mut().insert(action, handler);
    }

    fn unsubscribe(&self, action: ActionId) {
        let handler = self.inner.handlers.borrow_mut().remove(&action);
        if let Some(handler) = handler {
            self.inner.dispatcher.unsubscribe_action(action, &handler);
        }
    }

    // ========================================================================
    // Dispatch entry points
    // ========================================================================

    fn handle_wildcard(&self, action: ActionId, args: &[Value]) -> Result<(), FluxError> {
        if action.is_reserved() || self.inner.plugins.borrow().contains_key(&action) {
            return Ok(());
        }
        self.handle_action(action, args)
    }

    /// Run the bracket for `action`. Any error aborts the round before it is
    /// returned.
    pub fn handle_action(&self, action: ActionId, args: &[Value]) -> Result<(), FluxError> {
        let plugins = self.plugins_for(action);
        if plugins.is_empty() {
            return Ok(());
        }

        let round = self.open_round(action, args, plugins)?;
        self.recover(action, round, self.run_round(action, round))
    }

    fn open_round(
        &self,
        action: ActionId,
        args: &[Value],
        plugins: Vec<Rc<dyn Plugin>>,
    ) -> Result<u64, FluxError> {
        let mut rounds = self.inner.rounds.borrow_mut();
        if rounds.contains_key(&action) {
            return Err(FluxError::Reentrant { action });
        }

        let id = self.inner.next_round.get();
        self.inner.next_round.set(id + 1);

        debug!(%action, round = id, plugins = plugins.len(), "opening round");
        rounds.insert(
            action,
            Round {
                id,
                args: args.to_vec(),
                pending: plugins.len(),
                slots: plugins
                    .into_iter()
                    .map(|plugin| Slot {
                        plugin,
                        control: None,
                        outcome: None,
                    })
                    .collect(),
                running: true,
                aborted: false,
                cascade: false,
                replaying: self.inner.dispatcher.is_undoing(),
                mementos: Vec::new(),
            },
        );
        Ok(id)
    }

    fn with_round<R>(&self, action: ActionId, round: u64, f: impl FnOnce(&mut Round) -> R) -> Option<R> {
        let mut rounds = self.inner.rounds.borrow_mut();
        rounds
            .get_mut(&action)
            .filter(|r| r.id == round)
            .map(f)
    }

    fn run_round(&self, action: ActionId, round: u64) -> Result<(), FluxError> {
        let total = self.with_round(action, round, |r| r.slots.len()).unwrap_or(0);

        for position in 0..total {
            let started = self
                .with_round(action, round, |r| {
                    if r.aborted {
                        return None;
                    }
                    let state = Rc::new(ControlState::default());
                    let slot = &mut r.slots[position];
                    slot.control = Some(Rc::clone(&state));
                    Some((Rc::clone(&slot.plugin), state, r.args.clone()))
                })
                .flatten();
            let Some((plugin, state, args)) = started else {
                break;
            };
            let control = PluginControl::new(
                Rc::downgrade(&self.inner),
                action,
                round,
                position,
                Rc::clone(&state),
            );

            let memento = plugin
                .get_memento(self, action, &args)
                .map_err(|err| FluxError::from_handler(action, err))?;
            if let Some(mut memento) = memento {
                memento.instance = Some(Rc::new(PluginRestorer {
                    plugin: Rc::clone(&plugin),
                    container: Rc::downgrade(&self.inner),
                }));
                self.with_round(action, round, |r| r.mementos.push(memento));
            }

            trace!(%action, position, "running plugin");
            plugin
                .run(self, &control, action, &args)
                .map_err(|err| FluxError::from_handler(action, err))?;

            match self.with_round(action, round, |r| r.aborted) {
                None => return Ok(()),
                Some(true) => return self.force_abort(action, round),
                Some(false) => {}
            }
            if state.settle() {
                self.complete(action, round, position, false)?;
            }
        }

        match self.with_round(action, round, |r| {
            r.running = false;
            r.aborted
        }) {
            Some(true) => self.force_abort(action, round),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Record the protocol entry for `position` and collapse what can be.
    pub(crate) fn complete(
        &self,
        action: ActionId,
        round: u64,
        position: usize,
        abort: bool,
    ) -> Result<(), FluxError> {
        let recorded = self.with_round(action, round, |r| {
            r.slots[position].outcome = Some(abort);
            if abort {
                r.aborted = true;
            }
        });
        if recorded.is_none() {
            return Ok(());
        }

        trace!(%action, position, abort, "plugin completed");
        let result = self.collapse(action, round);
        self.recover(action, round, result)
    }

    fn collapse(&self, action: ActionId, round: u64) -> Result<(), FluxError> {
        loop {
            let step = self.with_round(action, round, |r| {
                if r.pending == 0 {
                    return Step::Finalize;
                }
                let Some(abort) = r.slots[r.pending - 1].outcome else {
                    return Step::Wait;
                };
                // An abort raised by an earlier notification reaches every
                // plugin popped after it.
                r.cascade |= abort || r.aborted;
                r.pending -= 1;
                Step::Pop {
                    plugin: Rc::clone(&r.slots[r.pending].plugin),
                    aborted: r.cascade,
                    args: r.args.clone(),
                }
            });

            match step {
                None | Some(Step::Wait) => return Ok(()),
                Some(Step::Finalize) => return self.finalize(action, round),
                Some(Step::Pop {
                    plugin,
                    aborted,
                    args,
                }) => self.notify(&plugin, action, &args, aborted)?,
            }
        }
    }

    fn notify(
        &self,
        plugin: &Rc<dyn Plugin>,
        action: ActionId,
        args: &[Value],
        aborted: bool,
    ) -> Result<(), FluxError> {
        let result = if aborted {
            plugin.after_abort(self, action, args)
        } else {
            plugin.after_finish(self, action, args)
        };
        result.map_err(|err| FluxError::from_handler(action, err))
    }

    fn finalize(&self, action: ActionId, round: u64) -> Result<(), FluxError> {
        let closed = {
            let mut rounds = self.inner.rounds.borrow_mut();
            match rounds.get(&action) {
                Some(r) if r.id == round => rounds.remove(&action),
                _ => None,
            }
        };
        let Some(closed) = closed else {
            return Ok(());
        };

        if closed.aborted || closed.cascade {
            debug!(%action, round, "round aborted");
            return Ok(());
        }
        if closed.mementos.is_empty() {
            debug!(%action, round, "round finished");
            return Ok(());
        }
        if closed.replaying || self.inner.dispatcher.is_undoing() {
            debug!(%action, round, "round finished during undo replay, mementos dropped");
            return Ok(());
        }

        match self.inner.dispatcher.undo_manager() {
            Some(undo) => {
                debug!(%action, round, mementos = closed.mementos.len(), "round committed");
                undo.store_mementos(closed.mementos, action, closed.args);
            }
            None => trace!(%action, round, "no undo manager, mementos dropped"),
        }
        Ok(())
    }

    // ========================================================================
    // Abort
    // ========================================================================

    /// Abort `action`, or every in-flight action when `None`.
    pub fn abort(&self, action: Option<ActionId>) -> Result<(), FluxError> {
        let mut targets: Vec<(ActionId, u64)> = {
            let rounds = self.inner.rounds.borrow();
            match action {
                Some(action) => rounds.get(&action).map(|r| (action, r.id)).into_iter().collect(),
                None => rounds.iter().map(|(action, r)| (*action, r.id)).collect(),
            }
        };
        targets.sort_unstable();

        for (action, round) in targets {
            let running = self.with_round(action, round, |r| {
                r.aborted = true;
                r.running
            });
            // A round still in its run loop is aborted once the current plugin returns.
            if running == Some(false) {
                self.force_abort(action, round)?;
            }
        }
        Ok(())
    }

    /// Abort every started plugin still on the running stack, innermost
    /// first, then close the round.
    fn force_abort(&self, action: ActionId, round: u64) -> Result<(), FluxError> {
        let victims = self.with_round(action, round, |r| {
            r.aborted = true;
            r.running = false;
            let started: Vec<Rc<dyn Plugin>> = r.slots[..r.pending]
                .iter()
                .filter_map(|slot| {
                    let control = slot.control.as_ref()?;
                    control.force_complete();
                    Some(Rc::clone(&slot.plugin))
                })
                .rev()
                .collect();
            r.pending = 0;
            (started, r.args.clone())
        });
        let Some((victims, args)) = victims else {
            return Ok(());
        };

        debug!(%action, round, plugins = victims.len(), "force-aborting round");
        let mut first_error = None;
        for plugin in victims {
            if let Err(err) = self.notify(&plugin, action, &args, true) {
                warn!(%action, error = %err, "after_abort failed during forced abort");
                first_error.get_or_insert(err);
            }
        }

        self.finalize(action, round)?;
        first_error.map_or(Ok(()), Err)
    }

    /// Abort the round after a failure, then hand the failure back.
    fn recover(&self, action: ActionId, round: u64, result: Result<(), FluxError>) -> Result<(), FluxError> {
        if let Err(err) = result {
            if let Err(secondary) = self.force_abort(action, round) {
                self.inner.dispatcher.error_sink().error(
                    "abort after failure also failed",
                    &json!({ "action": action, "error": secondary.to_string() }),
                );
            }
            return Err(err);
        }
        Ok(())
    }
}
