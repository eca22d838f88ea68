//! Undo/redo history built from memento groups.
//!
//! # Invariants
//!
//! 1. Every stored memento carries the `action` and `redo` descriptor of the
//!    dispatch that produced it.
//! 2. One committed dispatch is one undo group; groups are undone atomically.
//! 3. Storing a new group clears the redo stack, including the group a redo
//!    replay re-commits. History is linear.
//! 4. Undoing a group yields one redo group holding the redo descriptor of the
//!    group's first memento.

use crate::action::{ActionId, Payload};
use crate::dispatch::{Dispatcher, Handler, WeakDispatcher};
use crate::error::FluxError;
use crate::memento::{Memento, Replay};
use chrono::{DateTime, Utc};
use smallvec::{smallvec, SmallVec};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// Mementos committed by one dispatch.
#[derive(Debug, Clone)]
pub struct UndoGroup {
    pub mementos: Vec<Memento>,
    pub redo: Replay,
    pub stored_at: DateTime<Utc>,
}

/// Replays needed to redo one undone group.
pub type RedoGroup = SmallVec<[Replay; 1]>;

/// Notifications emitted by the undo manager.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoEvent {
    MementoStored { action: ActionId, count: usize },
    Undo { action: ActionId },
    Redo { action: ActionId },
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Rc<dyn Fn(&UndoEvent)>;

struct UndoInner {
    dispatcher: WeakDispatcher,
    undo_stack: RefCell<Vec<UndoGroup>>,
    redo_stack: RefCell<Vec<RedoGroup>>,
    limit: Option<usize>,
    listeners: RefCell<Vec<(ListenerId, Listener)>>,
    next_listener: Cell<u64>,
    /// This manager's `UNDO` subscription.
    undo_handler: RefCell<Option<Handler>>,
}

/// Owns the undo and redo stacks for one [`Dispatcher`].
#[derive(Clone)]
pub struct UndoManager {
    inner: Rc<UndoInner>,
}

impl fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoManager")
            .field("undo", &self.undo_len())
            .field("redo", &self.redo_len())
            .field("limit", &self.inner.limit)
            .finish()
    }
}

impl UndoManager {
    /// Create a manager bound to `dispatcher` and subscribe it to
    /// [`ActionId::UNDO`]. A manager previously bound to the same dispatcher
    /// is unsubscribed and replaced.
    pub fn new(dispatcher: &Dispatcher, limit: Option<usize>) -> Self {
        let manager = Self {
            inner: Rc::new(UndoInner {
                dispatcher: dispatcher.downgrade(),
                undo_stack: RefCell::new(Vec::new()),
                redo_stack: RefCell::new(Vec::new()),
                limit,
                listeners: RefCell::new(Vec::new()),
                next_listener: Cell::new(0),
                undo_handler: RefCell::new(None),
            }),
        };

        if let Some(previous) = dispatcher.undo_manager() {
            let handler = previous.inner.undo_handler.borrow_mut().take();
            if let Some(handler) = handler {
                dispatcher.unsubscribe_action(ActionId::UNDO, &handler);
            }
            debug!("replaced undo manager");
        }

        let weak: Weak<UndoInner> = Rc::downgrade(&manager.inner);
        let handler = dispatcher.subscribe_fn(ActionId::UNDO, move |_, _| {
            let inner = weak.upgrade().ok_or(FluxError::Detached)?;
            UndoManager { inner }.undo()?;
            Ok(())
        });
        *manager.inner.undo_handler.borrow_mut() = Some(handler);
        dispatcher.attach_undo_manager(manager.clone());

        manager
    }

    pub fn can_undo(&self) -> bool {
        !self.inner.undo_stack.borrow().is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.inner.redo_stack.borrow().is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.inner.undo_stack.borrow().len()
    }

    pub fn redo_len(&self) -> usize {
        self.inner.redo_stack.borrow().len()
    }

    /// Commit `mementos` as one undo group for the dispatch `(action, args)`.
    pub fn store_mementos(&self, mut mementos: Vec<Memento>, action: ActionId, args: Payload) {
        let redo = Replay::new(action, args);
        for memento in &mut mementos {
            memento.action = Some(action);
            memento.redo = Some(redo.clone());
        }
        let count = mementos.len();

        {
            let mut stack = self.inner.undo_stack.borrow_mut();
            stack.push(UndoGroup {
                mementos,
                redo,
                stored_at: Utc::now(),
            });
            if let Some(limit) = self.inner.limit {
                while stack.len() > limit {
                    stack.remove(0);
                    trace!(limit, "dropped oldest undo group");
                }
            }
        }
        self.inner.redo_stack.borrow_mut().clear();

        debug!(%action, count, "stored undo group");
        self.emit(&UndoEvent::MementoStored { action, count });
    }

    /// Undo the most recent group. Returns `false` when there was nothing to
    /// undo.
    pub fn undo(&self) -> Result<bool, FluxError> {
        let dispatcher = self.inner.dispatcher.upgrade()?;
        let Some(group) = self.inner.undo_stack.borrow_mut().pop() else {
            trace!("undo requested with empty history");
            return Ok(false);
        };

        for memento in &group.mementos {
            match (&memento.undo, &memento.instance) {
                (Some(undo), _) => dispatcher.dispatch_undo_action(undo.action, &undo.data)?,
                (None, Some(instance)) => instance
                    .restore_from_memento(memento)
                    .map_err(|err| FluxError::from_handler(group.redo.action, err))?,
                (None, None) => {
                    trace!(action = %group.redo.action, "memento has no replay path");
                }
            }
        }

        // The group is one redo unit; only the first memento's descriptor is kept.
        let redo = group
            .mementos
            .first()
            .and_then(|m| m.redo.clone())
            .unwrap_or_else(|| group.redo.clone());
        let action = redo.action;
        self.inner.redo_stack.borrow_mut().push(smallvec![redo]);

        debug!(%action, "undid group");
        self.emit(&UndoEvent::Undo { action });
        Ok(true)
    }

    /// Replay the most recently undone group. Returns `false` when there was
    /// nothing to redo.
    pub fn redo(&self) -> Result<bool, FluxError> {
        let dispatcher = self.inner.dispatcher.upgrade()?;
        let Some(group) = self.inner.redo_stack.borrow_mut().pop() else {
            trace!("redo requested with empty history");
            return Ok(false);
        };
        let Some(action) = group.first().map(|r| r.action) else {
            return Ok(false);
        };

        for replay in &group {
            dispatcher.dispatch_action(replay.action, &replay.data)?;
        }

        debug!(%action, "redid group");
        self.emit(&UndoEvent::Redo { action });
        Ok(true)
    }

    pub fn clear(&self) {
        self.inner.undo_stack.borrow_mut().clear();
        self.inner.redo_stack.borrow_mut().clear();
        debug!("cleared undo history");
        self.emit(&UndoEvent::Clear);
    }

    /// The undo groups, oldest first.
    pub fn history(&self) -> Vec<UndoGroup> {
        self.inner.undo_stack.borrow().clone()
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn subscribe(&self, listener: impl Fn(&UndoEvent) + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.get());
        self.inner.next_listener.set(id.0 + 1);
        self.inner.listeners.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.borrow_mut().retain(|(l, _)| *l != id);
    }

    fn emit(&self, event: &UndoEvent) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}
