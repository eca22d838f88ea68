//! # Flux core
//!
//! A Flux-style application core: an action router, a bracket-nested plugin
//! engine, and an undo/redo manager driven by mementos.
//!
//! ## Core Concepts
//!
//! - [`Dispatcher`] routes an [`ActionId`] plus an ordered payload to its
//!   subscribers, synchronously and in subscription order.
//! - [`PluginContainer`] lets several [`Plugin`]s wrap one action. They run as
//!   nested brackets: the outermost runs first and finishes last.
//! - [`UndoManager`] stores one undo group of [`Memento`]s per committed
//!   dispatch and replays them on undo.
//!
//! ## Architecture
//!
//! ```text
//! Host
//!   │
//!   ▼ dispatch_action()
//! Dispatcher ───────────────────────────────┐
//!   │                                       │
//!   ├─► specific handlers                   │
//!   │     └─► PluginContainer               │
//!   │           run(E) ─► run(D) ─► run(C)  │
//!   │           finish(C) ─► (D) ─► (E)     │
//!   │                  │                    │
//!   │                  ▼ commit             │
//!   ├─► __ANY__ handlers                    │
//!   │                                       │
//!   ▼                                       │
//! UndoManager ── undo() ─► dispatch_undo_action()
//!             └─ redo() ─► dispatch_action()
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Deterministic order** - handlers run in subscription order, plugins in
//!    wrap order (most recent first)
//! 2. **Inner before outer** - a plugin finishes only after every inner plugin
//!    that started has finished or aborted
//! 3. **No re-entry** - an action already in flight cannot be dispatched again
//! 4. **One dispatch = one undo group** - undone and redone atomically
//! 5. **Errors propagate** - unless the host installs an [`ErrorSink`] that
//!    says otherwise
//!
//! ## Example
//!
//! ```ignore
//! use flux_core::{ActionId, Flux, PluginSpec};
//! use serde_json::json;
//!
//! const SAVE: ActionId = ActionId::new(1);
//!
//! let flux = Flux::new();
//! let container = flux.container();
//!
//! container.configure([
//!     (SAVE, PluginSpec::function(|_, _, _, args| {
//!         println!("saving {args:?}");
//!         Ok(())
//!     })),
//!     (SAVE, PluginSpec::function(|_, control, _, _| {
//!         // Wait for a confirmation dialog; release() or abort() later.
//!         control.hold();
//!         Ok(())
//!     })),
//! ]);
//!
//! flux.dispatcher().dispatch_action(SAVE, &[json!("draft")])?;
//! ```
//!
//! ## Threading
//!
//! Everything is single-threaded and callback-driven. Shared state lives in
//! `Rc<RefCell<..>>`; a held plugin resumes the protocol from whatever later
//! callback owns its [`PluginControl`].

mod action;
mod container;
mod context;
mod dispatch;
mod error;
mod memento;
mod plugin;
mod undo;


pub use action::{ActionId, Payload};
pub use container::PluginContainer;
pub use context::{Flux, FluxBuilder, FluxConfig};
pub use dispatch::{DispatchDiagnostic, Dispatcher, Handler, MementoProvider};
pub use error::{ErrorSink, FluxError, LogErrors, PropagateErrors};
pub use memento::{Memento, Replay, RestoreFromMemento};
pub use plugin::{FnPlugin, Plugin, PluginControl, PluginFn, PluginSpec};
pub use undo::{ListenerId, RedoGroup, UndoEvent, UndoGroup, UndoManager};
