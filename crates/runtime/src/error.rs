use std::time::Duration;

use kolibri_core::{EventKind, SourceError};

/// Misconfiguration detected by [`crate::HandlerBuilder::build`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("no callbacks: at least one of on_create, on_change, on_delete is required")]
    NoCallbacks,
    #[error("{0} callback registered twice")]
    DuplicateCallback(EventKind),
    #[error("namespace scope set twice")]
    DuplicateNamespace,
    #[error("worker count must be at least 1")]
    InvalidWorkers,
    #[error("watch source: {0}")]
    Source(#[from] SourceError),
}

/// Why a running handler stopped early.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler {handler}: caches not synced after {timeout:?}")]
    CacheSyncTimeout { handler: String, timeout: Duration },
    #[error("handler {handler}: worker crashed: {reason}")]
    WorkerCrashed { handler: String, reason: String },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("a handler named {0} is already registered")]
    DuplicateName(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("handler {handler} failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: HandlerError,
    },
    #[error("handler task panicked: {0}")]
    Panicked(String),
}
