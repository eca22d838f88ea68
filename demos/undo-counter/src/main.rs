//! # Undo Counter Example
//!
//! A counter wrapped around a confirmation gate that holds each increment
//! until it is approved. Approved increments land in the undo history;
//! rejected ones are rolled back and leave no trace.

use anyhow::Result;
use flux_core::{ActionId, Flux, Memento, Plugin, PluginContainer, PluginControl};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const INCREMENT: ActionId = ActionId::new(1);

// ============================================================================
// Plugins
// ============================================================================

/// Holds every invocation until the user approves or rejects it.
#[derive(Default)]
struct Confirm {
    pending: RefCell<Option<PluginControl>>,
}

impl Confirm {
    fn approve(&self) -> Result<()> {
        let pending = self.pending.borrow_mut().take();
        if let Some(control) = pending {
            control.release()?;
        }
        Ok(())
    }

    fn reject(&self) -> Result<()> {
        let pending = self.pending.borrow_mut().take();
        if let Some(control) = pending {
            control.abort()?;
        }
        Ok(())
    }
}

impl Plugin for Confirm {
    fn run(
        &self,
        _: &PluginContainer,
        control: &PluginControl,
        _: ActionId,
        args: &[Value],
    ) -> Result<()> {
        println!("Confirm increment by {}?", args.first().unwrap_or(&Value::Null));
        control.hold();
        *self.pending.borrow_mut() = Some(control.clone());
        Ok(())
    }

    fn after_abort(&self, _: &PluginContainer, _: ActionId, _: &[Value]) -> Result<()> {
        println!("  rejected");
        Ok(())
    }
}

/// The counter itself; snapshots its value before each increment.
#[derive(Default)]
struct Counter {
    value: Cell<i64>,
    before: Cell<i64>,
}

impl Plugin for Counter {
    fn run(
        &self,
        _: &PluginContainer,
        _: &PluginControl,
        _: ActionId,
        args: &[Value],
    ) -> Result<()> {
        let by = args.first().and_then(Value::as_i64).unwrap_or(1);
        self.before.set(self.value.get());
        self.value.set(self.value.get() + by);
        Ok(())
    }

    fn after_finish(&self, _: &PluginContainer, _: ActionId, _: &[Value]) -> Result<()> {
        println!("  counter = {}", self.value.get());
        Ok(())
    }

    // The increment already ran; a rejected gate rolls it back.
    fn after_abort(&self, _: &PluginContainer, _: ActionId, _: &[Value]) -> Result<()> {
        self.value.set(self.before.get());
        println!("  counter = {}", self.value.get());
        Ok(())
    }

    fn get_memento(
        &self,
        _: &PluginContainer,
        _: ActionId,
        _: &[Value],
    ) -> Result<Option<Memento>> {
        Ok(Some(Memento::snapshot(json!(self.value.get()))))
    }

    fn restore_from_memento(&self, _: &PluginContainer, memento: &Memento) -> Result<()> {
        self.value.set(memento.data.as_i64().unwrap_or_default());
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let flux = Flux::new();
    let container = flux.container();

    let counter = Rc::new(Counter::default());
    let confirm = Rc::new(Confirm::default());
    // The counter wraps the gate, so it only finishes once the gate does.
    container.wrap(INCREMENT, confirm.clone());
    container.wrap(INCREMENT, counter.clone());

    flux.undo_manager().subscribe(|event| println!("  history: {event:?}"));

    flux.dispatcher().dispatch_action(INCREMENT, &[json!(5)])?;
    confirm.approve()?;

    flux.dispatcher().dispatch_action(INCREMENT, &[json!(3)])?;
    confirm.approve()?;

    flux.dispatcher().dispatch_action(INCREMENT, &[json!(100)])?;
    confirm.reject()?;

    println!("Undo");
    flux.undo_manager().undo()?;
    println!("  counter = {}", counter.value.get());

    println!("Redo");
    flux.undo_manager().redo()?;
    confirm.approve()?;

    println!("Final value: {}", counter.value.get());

    Ok(())
}
