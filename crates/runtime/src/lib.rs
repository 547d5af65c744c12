//! Kolibri runtime – reconciliation handlers and the coordinator that runs them.
//!
//! A [`Handler`] binds one resource type to a watch source, an update policy,
//! and create/change/delete callbacks. Notifications are reduced to keys on an
//! [`EventQueue`](kolibri_queue::EventQueue) and drained by a pool of workers;
//! failed callbacks are retried with per-key backoff. A [`Coordinator`] runs
//! several handlers under one cancellation signal and stops them all on the
//! first fatal error.

#![forbid(unsafe_code)]

mod adapter;
mod builder;
mod callback;
mod context;
pub mod coordinator;
mod error;
mod handler;
mod options;
mod recorder;

pub use adapter::NotificationAdapter;
pub use builder::HandlerBuilder;
pub use callback::Callback;
pub use context::Context;
pub use coordinator::{Coordinator, Runnable};
pub use error::{BuildError, CoordinatorError, HandlerError, RegisterError};
pub use handler::Handler;
pub use options::HandlerOptions;
pub use recorder::LogRecorder;

pub mod prelude {
    pub use super::{Context, Coordinator, Handler, HandlerBuilder, HandlerOptions};
    pub use kolibri_core::prelude::*;
}
