//! Plugin contract and the per-invocation control handle.

use crate::action::ActionId;
use crate::container::{ContainerInner, PluginContainer};
use crate::error::FluxError;
use crate::memento::Memento;
use serde_json::Value;
use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

/// A behavior wrapped around one or more actions.
///
/// Plugins wrapped around the same action run outermost first and finish
/// innermost first. `run` receives a [`PluginControl`] that can defer
/// completion (`hold`) and later `release` or `abort` the invocation.
pub trait Plugin {
    fn run(
        &self,
        container: &PluginContainer,
        control: &PluginControl,
        action: ActionId,
        args: &[Value],
    ) -> anyhow::Result<()>;

    /// Called once every plugin inside this one has finished.
    fn after_finish(
        &self,
        container: &PluginContainer,
        action: ActionId,
        args: &[Value],
    ) -> anyhow::Result<()> {
        let _ = (container, action, args);
        Ok(())
    }

    /// Called instead of `after_finish` when this invocation or an inner one
    /// aborted.
    fn after_abort(
        &self,
        container: &PluginContainer,
        action: ActionId,
        args: &[Value],
    ) -> anyhow::Result<()> {
        let _ = (container, action, args);
        Ok(())
    }

    /// Snapshot taken right before `run`.
    fn get_memento(
        &self,
        container: &PluginContainer,
        action: ActionId,
        args: &[Value],
    ) -> anyhow::Result<Option<Memento>> {
        let _ = (container, action, args);
        Ok(None)
    }

    fn restore_from_memento(
        &self,
        container: &PluginContainer,
        memento: &Memento,
    ) -> anyhow::Result<()> {
        let _ = (container, memento);
        Ok(())
    }
}

pub(crate) fn same_plugin(a: &Rc<dyn Plugin>, b: &Rc<dyn Plugin>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

// ============================================================================
// Control handle
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct ControlState {
    held: Cell<bool>,
    completed: Cell<bool>,
}

impl ControlState {
    /// Complete on behalf of a plugin that returned from `run` without
    /// holding or completing. Returns whether it did.
    pub(crate) fn settle(&self) -> bool {
        if self.held.get() || self.completed.get() {
            return false;
        }
        self.completed.set(true);
        true
    }

    pub(crate) fn force_complete(&self) {
        self.held.set(false);
        self.completed.set(true);
    }
}

/// Handle given to a plugin for one invocation of one action.
///
/// Exactly one of [`release`](Self::release) or [`abort`](Self::abort) may
/// complete the invocation; the second call fails with
/// [`FluxError::DoubleCompletion`]. The handle is cheap to clone and may be
/// kept past `run` to complete the invocation later.
#[derive(Clone)]
pub struct PluginControl {
    container: Weak<ContainerInner>,
    action: ActionId,
    round: u64,
    position: usize,
    state: Rc<ControlState>,
}

impl PluginControl {
    pub(crate) fn new(
        container: Weak<ContainerInner>,
        action: ActionId,
        round: u64,
        position: usize,
        state: Rc<ControlState>,
    ) -> Self {
        Self {
            container,
            action,
            round,
            position,
            state,
        }
    }

    /// Keep the invocation open after `run` returns.
    pub fn hold(&self) {
        if !self.state.completed.get() {
            self.state.held.set(true);
        }
    }

    /// Complete the invocation successfully.
    pub fn release(&self) -> Result<(), FluxError> {
        self.complete(false)
    }

    /// Complete the invocation as aborted, aborting the whole action.
    pub fn abort(&self) -> Result<(), FluxError> {
        self.complete(true)
    }

    pub fn is_held(&self) -> bool {
        self.state.held.get()
    }

    pub fn is_completed(&self) -> bool {
        self.state.completed.get()
    }

    pub fn action(&self) -> ActionId {
        self.action
    }

    pub fn container(&self) -> Option<PluginContainer> {
        self.container.upgrade().map(PluginContainer::from_inner)
    }

    fn complete(&self, abort: bool) -> Result<(), FluxError> {
        if self.state.completed.replace(true) {
            return Err(FluxError::DoubleCompletion {
                action: self.action,
            });
        }
        self.state.held.set(false);

        let container = self.container().ok_or(FluxError::Detached)?;
        container.complete(self.action, self.round, self.position, abort)
    }
}

impl fmt::Debug for PluginControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginControl")
            .field("action", &self.action)
            .field("position", &self.position)
            .field("held", &self.is_held())
            .field("completed", &self.is_completed())
            .finish()
    }
}

// ============================================================================
// Plugin specs
// ============================================================================

/// A bare `run` function usable as a plugin.
pub type PluginFn = Rc<dyn Fn(&PluginContainer, &PluginControl, ActionId, &[Value]) -> anyhow::Result<()>>;

/// Adapts a [`PluginFn`] to the [`Plugin`] trait.
pub struct FnPlugin {
    run: PluginFn,
}

impl FnPlugin {
    pub fn new<F>(run: F) -> Self
    where
        F: Fn(&PluginContainer, &PluginControl, ActionId, &[Value]) -> anyhow::Result<()> + 'static,
    {
        Self { run: Rc::new(run) }
    }
}

impl Plugin for FnPlugin {
    fn run(
        &self,
        container: &PluginContainer,
        control: &PluginControl,
        action: ActionId,
        args: &[Value],
    ) -> anyhow::Result<()> {
        (self.run)(container, control, action, args)
    }
}

/// How a plugin is supplied at configuration time.
#[derive(Clone)]
pub enum PluginSpec {
    /// A ready instance, shared as-is.
    Instance(Rc<dyn Plugin>),
    /// Builds a fresh instance when resolved.
    Factory(Rc<dyn Fn() -> Rc<dyn Plugin>>),
    /// A plain run function.
    Function(PluginFn),
}

impl PluginSpec {
    pub fn instance(plugin: impl Plugin + 'static) -> Self {
        Self::Instance(Rc::new(plugin))
    }

    pub fn factory<P, F>(build: F) -> Self
    where
        P: Plugin + 'static,
        F: Fn() -> P + 'static,
    {
        Self::Factory(Rc::new(move || Rc::new(build()) as Rc<dyn Plugin>))
    }

    pub fn function<F>(run: F) -> Self
    where
        F: Fn(&PluginContainer, &PluginControl, ActionId, &[Value]) -> anyhow::Result<()> + 'static,
    {
        Self::Function(Rc::new(run))
    }

    pub fn resolve(self) -> Rc<dyn Plugin> {
        match self {
            Self::Instance(plugin) => plugin,
            Self::Factory(build) => build(),
            Self::Function(run) => Rc::new(FnPlugin { run }),
        }
    }
}

impl fmt::Debug for PluginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Instance(_) => "PluginSpec::Instance",
            Self::Factory(_) => "PluginSpec::Factory",
            Self::Function(_) => "PluginSpec::Function",
        })
    }
}
