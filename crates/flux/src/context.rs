//! The application context: one dispatcher and its undo manager.

use crate::container::PluginContainer;
use crate::dispatch::Dispatcher;
use crate::error::{ErrorSink, PropagateErrors};
use crate::undo::UndoManager;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// Settings a [`Flux`] context is built from.
#[derive(Clone)]
pub struct FluxConfig {
    /// Maximum retained undo groups. `None` keeps everything.
    pub undo_limit: Option<usize>,
    pub error_sink: Rc<dyn ErrorSink>,
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self {
            undo_limit: None,
            error_sink: Rc::new(PropagateErrors),
        }
    }
}

impl fmt::Debug for FluxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FluxConfig")
            .field("undo_limit", &self.undo_limit)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Flux`].
#[derive(Debug, Default)]
pub struct FluxBuilder {
    config: FluxConfig,
}

impl FluxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.config.error_sink = Rc::new(sink);
        self
    }

    pub fn with_undo_limit(mut self, limit: usize) -> Self {
        self.config.undo_limit = Some(limit);
        self
    }

    pub fn build(self) -> Flux {
        Flux::from_config(self.config)
    }
}

/// Explicit context threaded through the host: a [`Dispatcher`] and the
/// [`UndoManager`] subscribed to it.
#[derive(Clone, Debug)]
pub struct Flux {
    dispatcher: Dispatcher,
    undo: UndoManager,
    config: FluxConfig,
}

impl Default for Flux {
    fn default() -> Self {
        Self::new()
    }
}

impl Flux {
    pub fn new() -> Self {
        Self::from_config(FluxConfig::default())
    }

    pub fn builder() -> FluxBuilder {
        FluxBuilder::new()
    }

    pub fn from_config(config: FluxConfig) -> Self {
        let dispatcher = Dispatcher::new(Rc::clone(&config.error_sink));
        let undo = UndoManager::new(&dispatcher, config.undo_limit);
        Self {
            dispatcher,
            undo,
            config,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn undo_manager(&self) -> &UndoManager {
        &self.undo
    }

    pub fn config(&self) -> &FluxConfig {
        &self.config
    }

    /// New plugin container bound to this context's dispatcher.
    pub fn container(&self) -> PluginContainer {
        PluginContainer::new(&self.dispatcher)
    }

    /// Discard every subscription, flag and history entry by replacing the
    /// dispatcher and undo manager. Containers created earlier stay bound to
    /// the old dispatcher.
    pub fn reset(&mut self) {
        debug!("resetting flux context");
        *self = Self::from_config(self.config.clone());
    }
}
