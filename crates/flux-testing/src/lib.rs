//! Testing utilities for hosts built on `flux-core`.
//!
//! [`TracePlugin`] records every callback into a shared [`TraceLog`] using a
//! compact notation, so whole bracket runs can be compared as one string:
//!
//! ```text
//! (1:r-E-X)   run of plugin E for action 1 with first argument "X"
//! (1:f-E)     after_finish of plugin E
//! (1:a-E)     after_abort of plugin E
//! ```
//!
//! # Example
//!
//! ```ignore
//! let flux = Flux::new();
//! let container = flux.container();
//! let log = TraceLog::new();
//!
//! container.wrap(ONE, TracePlugin::new("C", Behavior::Finish, &log));
//! container.wrap(ONE, TracePlugin::new("D", Behavior::Finish, &log));
//! flux.dispatcher().dispatch_action(ONE, &[json!("X")])?;
//!
//! assert_eq!(log.trace(), "(1:r-D-X)(1:r-C-X)(1:f-C)(1:f-D)");
//! ```

use flux_core::{ActionId, Handler, Plugin, PluginContainer, PluginControl};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Shared, append-only call trace.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    entries: Rc<RefCell<Vec<String>>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    /// All entries concatenated.
    pub fn trace(&self) -> String {
        self.entries.borrow().concat()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

/// What a [`TracePlugin`] does inside `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Return and let the container complete the invocation.
    Finish,
    /// Abort the invocation from inside `run`.
    Abort,
    /// Hold the invocation; complete it later through [`TracePlugin::release`]
    /// or [`TracePlugin::abort`].
    Hold,
}

/// Plugin recording its callbacks into a [`TraceLog`].
pub struct TracePlugin {
    name: String,
    behavior: Behavior,
    log: TraceLog,
    held: RefCell<Vec<PluginControl>>,
}

impl TracePlugin {
    pub fn new(name: impl Into<String>, behavior: Behavior, log: &TraceLog) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            behavior,
            log: log.clone(),
            held: RefCell::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controls of invocations held so far, oldest first.
    pub fn held(&self) -> Vec<PluginControl> {
        self.held.borrow().clone()
    }

    /// Release the most recent held invocation.
    pub fn release(&self) -> anyhow::Result<()> {
        let control = self.last_held()?;
        control.release()?;
        Ok(())
    }

    /// Abort the most recent held invocation.
    pub fn abort(&self) -> anyhow::Result<()> {
        let control = self.last_held()?;
        control.abort()?;
        Ok(())
    }

    fn last_held(&self) -> anyhow::Result<PluginControl> {
        self.held
            .borrow()
            .last()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("plugin {} holds no invocation", self.name))
    }
}

impl Plugin for TracePlugin {
    fn run(
        &self,
        _: &PluginContainer,
        control: &PluginControl,
        action: ActionId,
        args: &[Value],
    ) -> anyhow::Result<()> {
        self.log
            .push(format!("({action}:r-{}-{})", self.name, first_arg(args)));
        match self.behavior {
            Behavior::Finish => {}
            Behavior::Abort => control.abort()?,
            Behavior::Hold => {
                control.hold();
                self.held.borrow_mut().push(control.clone());
            }
        }
        Ok(())
    }

    fn after_finish(&self, _: &PluginContainer, action: ActionId, _: &[Value]) -> anyhow::Result<()> {
        self.log.push(format!("({action}:f-{})", self.name));
        Ok(())
    }

    fn after_abort(&self, _: &PluginContainer, action: ActionId, _: &[Value]) -> anyhow::Result<()> {
        self.log.push(format!("({action}:a-{})", self.name));
        Ok(())
    }
}

fn first_arg(args: &[Value]) -> String {
    match args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Dispatcher handler recording `(action:h-NAME)` for every delivery.
pub struct RecordingHandler;

impl RecordingHandler {
    pub fn create(name: impl Into<String>, log: &TraceLog) -> Handler {
        let name = name.into();
        let log = log.clone();
        Rc::new(move |action: ActionId, _: &[Value]| {
            log.push(format!("({action}:h-{name})"));
            Ok(())
        })
    }
}
