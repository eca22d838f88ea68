//! Error types and the framework error hook.
//!
//! Re-entrancy and double-completion errors are returned straight to the
//! caller. Everything a handler or plugin raises is funnelled through the
//! dispatcher's diagnostic path and then handed to an [`ErrorSink`], which
//! decides whether the error propagates. The default sink propagates.

use crate::action::ActionId;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};

/// Errors raised by the dispatcher, the undo manager and plugin containers.
#[derive(Debug, Error)]
pub enum FluxError {
    /// The action is already in flight in this container.
    #[error("action {action} is already in flight")]
    Reentrant { action: ActionId },

    /// `release` or `abort` was called a second time for one plugin invocation.
    #[error("plugin released twice for action {action}")]
    DoubleCompletion { action: ActionId },

    /// A handler, plugin callback or memento restore failed.
    #[error("handler failed for action {action}: {source}")]
    Handler {
        action: ActionId,
        #[source]
        source: anyhow::Error,
    },

    /// Raised through [`ErrorSink::fatal`].
    #[error("fatal: {message}")]
    Fatal { message: String },

    /// The dispatcher or container backing a handle has been dropped.
    #[error("flux context has been dropped")]
    Detached,
}

impl FluxError {
    /// Convert a foreign error into a handler failure, passing `FluxError`s
    /// through unchanged.
    pub(crate) fn from_handler(action: ActionId, err: anyhow::Error) -> Self {
        match err.downcast::<FluxError>() {
            Ok(flux) => flux,
            Err(source) => FluxError::Handler { action, source },
        }
    }

    /// The action this error concerns, when there is one.
    pub fn action(&self) -> Option<ActionId> {
        match self {
            Self::Reentrant { action }
            | Self::DoubleCompletion { action }
            | Self::Handler { action, .. } => Some(*action),
            Self::Fatal { .. } | Self::Detached => None,
        }
    }
}

/// Host override point for error reporting.
///
/// Every method has a default; implement only what the host wants to change.
pub trait ErrorSink {
    /// Non-fatal report.
    fn error(&self, message: &str, context: &Value) {
        error!(reason = message, %context, "flux error");
    }

    /// Unrecoverable misuse. The returned error is propagated.
    fn fatal(&self, message: &str, context: &Value) -> Result<(), FluxError> {
        error!(reason = message, %context, "flux fatal");
        Err(FluxError::Fatal {
            message: message.to_string(),
        })
    }

    /// A handler failed during dispatch. Returning `Err` re-raises it.
    fn framework(&self, message: &str, err: FluxError, context: &Value) -> Result<(), FluxError> {
        let _ = (message, context);
        Err(err)
    }
}

/// Default sink: every framework error propagates to the dispatch caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropagateErrors;

impl ErrorSink for PropagateErrors {}

/// Logs framework and fatal errors and lets dispatch continue.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrors;

impl ErrorSink for LogErrors {
    fn fatal(&self, message: &str, context: &Value) -> Result<(), FluxError> {
        warn!(reason = message, %context, "flux fatal suppressed by host");
        Ok(())
    }

    fn framework(&self, message: &str, err: FluxError, context: &Value) -> Result<(), FluxError> {
        warn!(reason = message, error = %err, %context, "handler error suppressed by host");
        Ok(())
    }
}
