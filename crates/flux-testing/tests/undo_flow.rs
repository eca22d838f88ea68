//! Undo/redo flows across the dispatcher, container and undo manager.

use flux_core::{
    ActionId, Flux, LogErrors, Memento, MementoProvider, Plugin, PluginContainer, PluginControl,
    Replay, UndoEvent,
};
use flux_testing::{Behavior, RecordingHandler, TraceLog, TracePlugin};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const ADD: ActionId = ActionId::new(1);
const SHOW: ActionId = ActionId::new(2);
const HIDE: ActionId = ActionId::new(3);

// =============================================================================
// Helpers
// =============================================================================

/// Counter plugin snapshotting its total before each run.
struct Counter {
    total: Cell<i64>,
}

impl Counter {
    fn new() -> Rc<Self> {
        Rc::new(Self { total: Cell::new(0) })
    }
}

impl Plugin for Counter {
    fn run(
        &self,
        _: &PluginContainer,
        _: &PluginControl,
        _: ActionId,
        args: &[Value],
    ) -> anyhow::Result<()> {
        let delta = args.first().and_then(Value::as_i64).unwrap_or(0);
        self.total.set(self.total.get() + delta);
        Ok(())
    }

    fn get_memento(
        &self,
        _: &PluginContainer,
        _: ActionId,
        _: &[Value],
    ) -> anyhow::Result<Option<Memento>> {
        Ok(Some(Memento::snapshot(json!(self.total.get()))))
    }

    fn restore_from_memento(&self, _: &PluginContainer, memento: &Memento) -> anyhow::Result<()> {
        let total = memento
            .data
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("counter memento is not a number"))?;
        self.total.set(total);
        Ok(())
    }
}

// =============================================================================
// Plugin mementos
// =============================================================================

#[test]
fn plugin_snapshots_undo_and_redo() {
    let flux = Flux::new();
    let container = flux.container();
    let counter = Counter::new();
    container.wrap(ADD, counter.clone());

    flux.dispatcher().dispatch_action(ADD, &[json!(5)]).unwrap();
    flux.dispatcher().dispatch_action(ADD, &[json!(2)]).unwrap();
    assert_eq!(counter.total.get(), 7);
    assert_eq!(flux.undo_manager().undo_len(), 2);

    assert!(flux.undo_manager().undo().unwrap());
    assert_eq!(counter.total.get(), 5);
    assert!(flux.undo_manager().undo().unwrap());
    assert_eq!(counter.total.get(), 0);
    assert!(!flux.undo_manager().undo().unwrap());

    assert_eq!(flux.undo_manager().redo_len(), 2);
    assert!(flux.undo_manager().redo().unwrap());
    assert_eq!(counter.total.get(), 5);
    assert_eq!(flux.undo_manager().undo_len(), 1);
    // History is linear: the re-committed group drops what was left to redo.
    assert!(!flux.undo_manager().can_redo());
}

#[test]
fn undo_action_is_routed_through_the_dispatcher() {
    let flux = Flux::new();
    let container = flux.container();
    let counter = Counter::new();
    container.wrap(ADD, counter.clone());

    flux.dispatcher().dispatch_action(ADD, &[json!(4)]).unwrap();
    flux.dispatcher().dispatch_action(ActionId::UNDO, &[]).unwrap();

    assert_eq!(counter.total.get(), 0);
    assert!(flux.undo_manager().can_redo());
}

#[test]
fn aborted_round_leaves_history_untouched() {
    let flux = Flux::new();
    let container = flux.container();
    let log = TraceLog::new();
    let counter = Counter::new();
    container.wrap(ADD, counter.clone());
    container.wrap(ADD, TracePlugin::new("gate", Behavior::Hold, &log));

    assert_eq!(container.plugins_for(ADD).len(), 2);

    // The outer gate holds while the counter runs inside it.
    flux.dispatcher().dispatch_action(ADD, &[json!(3)]).unwrap();
    assert_eq!(counter.total.get(), 3);
    assert_eq!(flux.undo_manager().undo_len(), 0);

    container.abort(Some(ADD)).unwrap();
    assert_eq!(log.trace(), "(1:r-gate-3)(1:a-gate)");
    assert!(!container.is_running(ADD));
    assert_eq!(flux.undo_manager().undo_len(), 0);
}

#[test]
fn held_round_commits_once_released() {
    let flux = Flux::new();
    let container = flux.container();
    let log = TraceLog::new();
    let counter = Counter::new();
    let gate = TracePlugin::new("gate", Behavior::Hold, &log);
    container.wrap(ADD, gate.clone());
    container.wrap(ADD, counter.clone());

    flux.dispatcher().dispatch_action(ADD, &[json!(3)]).unwrap();
    assert_eq!(counter.total.get(), 3);
    assert_eq!(flux.undo_manager().undo_len(), 0);

    gate.release().unwrap();
    assert_eq!(flux.undo_manager().undo_len(), 1);

    flux.undo_manager().undo().unwrap();
    assert_eq!(counter.total.get(), 0);
}

// =============================================================================
// Handler mementos
// =============================================================================

/// Visibility toggled by SHOW and HIDE, undone by dispatching the opposite.
fn visibility(flux: &Flux, log: &TraceLog) -> Rc<RefCell<bool>> {
    let visible = Rc::new(RefCell::new(false));

    for (action, opposite, value) in [(SHOW, HIDE, true), (HIDE, SHOW, false)] {
        let state = Rc::clone(&visible);
        let name = if value { "show" } else { "hide" };
        let record = RecordingHandler::create(name, log);
        let provider: MementoProvider = Rc::new(move |_: ActionId, _: &[Value]| {
            Ok(vec![Memento::replay(Replay::new(opposite, Vec::new()))])
        });
        flux.dispatcher().subscribe_action(
            action,
            Rc::new(move |action: ActionId, args: &[Value]| {
                record(action, args)?;
                *state.borrow_mut() = value;
                Ok(())
            }),
            Some(provider),
        );
    }

    visible
}

#[test]
fn replay_mementos_dispatch_the_opposite_action() {
    let flux = Flux::new();
    let log = TraceLog::new();
    let visible = visibility(&flux, &log);

    flux.dispatcher().dispatch_action(SHOW, &[]).unwrap();
    assert!(*visible.borrow());

    flux.undo_manager().undo().unwrap();
    assert!(!*visible.borrow());
    assert_eq!(log.trace(), "(2:h-show)(3:h-hide)");
    // Replaying an undo descriptor does not commit a new group.
    assert_eq!(flux.undo_manager().undo_len(), 0);

    flux.undo_manager().redo().unwrap();
    assert!(*visible.borrow());
    assert_eq!(flux.undo_manager().undo_len(), 1);
}

#[test]
fn new_commit_clears_redo() {
    let flux = Flux::new();
    let log = TraceLog::new();
    let _visible = visibility(&flux, &log);

    flux.dispatcher().dispatch_action(SHOW, &[]).unwrap();
    flux.undo_manager().undo().unwrap();
    assert!(flux.undo_manager().can_redo());

    flux.dispatcher().dispatch_action(HIDE, &[]).unwrap();
    assert!(!flux.undo_manager().can_redo());
}

#[test]
fn listeners_observe_history_changes() {
    let flux = Flux::new();
    let log = TraceLog::new();
    let _visible = visibility(&flux, &log);

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    flux.undo_manager()
        .subscribe(move |event| sink.borrow_mut().push(event.clone()));

    flux.dispatcher().dispatch_action(SHOW, &[]).unwrap();
    flux.undo_manager().undo().unwrap();
    flux.undo_manager().redo().unwrap();
    flux.undo_manager().clear();

    assert_eq!(
        *events.borrow(),
        vec![
            UndoEvent::MementoStored { action: SHOW, count: 1 },
            UndoEvent::Undo { action: SHOW },
            UndoEvent::MementoStored { action: SHOW, count: 1 },
            UndoEvent::Redo { action: SHOW },
            UndoEvent::Clear,
        ]
    );
}

// =============================================================================
// Errors and disabled actions
// =============================================================================

#[test]
fn disabled_action_neither_runs_nor_commits() {
    let flux = Flux::new();
    let container = flux.container();
    let counter = Counter::new();
    container.wrap(ADD, counter.clone());

    flux.dispatcher().disable_action(ADD);
    flux.dispatcher().dispatch_action(ADD, &[json!(9)]).unwrap();
    assert_eq!(counter.total.get(), 0);
    assert!(!flux.undo_manager().can_undo());

    flux.dispatcher().enable_action(ADD);
    flux.dispatcher().dispatch_action(ADD, &[json!(9)]).unwrap();
    assert_eq!(counter.total.get(), 9);
}

#[test]
fn log_errors_sink_keeps_the_host_running() {
    let flux = Flux::builder().with_error_sink(LogErrors).build();
    let container = flux.container();
    let counter = Counter::new();
    container.wrap(ADD, counter.clone());
    flux.dispatcher()
        .subscribe_fn(ADD, |_, _| anyhow::bail!("handler failed"));

    assert!(flux.dispatcher().dispatch_action(ADD, &[json!(1)]).is_ok());
    assert!(flux.dispatcher().dispatch_action(ActionId::ANY, &[]).is_ok());
    assert_eq!(counter.total.get(), 1);
}
