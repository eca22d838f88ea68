//! Mementos: the snapshots plugins and handlers hand to the undo manager.

use crate::action::{ActionId, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::rc::Rc;

/// An `(action, data)` pair that can be dispatched again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replay {
    pub action: ActionId,
    pub data: Payload,
}

impl Replay {
    pub fn new(action: ActionId, data: impl Into<Payload>) -> Self {
        Self {
            action,
            data: data.into(),
        }
    }
}

/// Something able to put itself back into the state captured by a memento.
pub trait RestoreFromMemento {
    fn restore_from_memento(&self, memento: &Memento) -> anyhow::Result<()>;
}

/// Snapshot or undo descriptor captured before a handler runs.
///
/// Exactly one replay path is authoritative: when `undo` is set the undo
/// manager dispatches it, otherwise `instance` restores from `data`.
/// `action` and `redo` are stamped by the undo manager when the memento is
/// stored.
#[derive(Clone, Serialize)]
pub struct Memento {
    pub action: Option<ActionId>,
    pub data: Value,
    pub redo: Option<Replay>,
    pub undo: Option<Replay>,
    #[serde(skip)]
    pub instance: Option<Rc<dyn RestoreFromMemento>>,
}

impl Memento {
    /// Snapshot memento restored through an instance.
    pub fn snapshot(data: Value) -> Self {
        Self {
            action: None,
            data,
            redo: None,
            undo: None,
            instance: None,
        }
    }

    /// Memento undone by dispatching `undo`.
    pub fn replay(undo: Replay) -> Self {
        Self {
            action: None,
            data: Value::Null,
            redo: None,
            undo: Some(undo),
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: Rc<dyn RestoreFromMemento>) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_undo(mut self, undo: Replay) -> Self {
        self.undo = Some(undo);
        self
    }
}

impl fmt::Debug for Memento {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memento")
            .field("action", &self.action)
            .field("data", &self.data)
            .field("redo", &self.redo)
            .field("undo", &self.undo)
            .field("instance", &self.instance.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialization_skips_instance() {
        struct Noop;
        impl RestoreFromMemento for Noop {
            fn restore_from_memento(&self, _: &Memento) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let memento = Memento::snapshot(json!({"count": 3})).with_instance(Rc::new(Noop));
        let value = serde_json::to_value(&memento).unwrap();

        assert_eq!(value["data"], json!({"count": 3}));
        assert!(value.get("instance").is_none());
        assert_eq!(value["undo"], Value::Null);
    }

    #[test]
    fn replay_memento_has_no_snapshot_data() {
        let memento = Memento::replay(Replay::new(ActionId::new(4), vec![json!("x")]));
        assert_eq!(memento.data, Value::Null);
        assert_eq!(memento.undo.unwrap().action, ActionId::new(4));
    }
}
