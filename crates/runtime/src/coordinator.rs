//! Fail-fast group of handlers sharing one cancellation signal.

use futures::future::BoxFuture;
use kolibri_core::WatchSource;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{CoordinatorError, Handler, HandlerError, RegisterError};

/// Anything the coordinator can run: a named task that stops when its token
/// is cancelled.
pub trait Runnable: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<(), HandlerError>>;
}

impl<S: WatchSource> Runnable for Handler<S> {
    fn name(&self) -> &str { Handler::name(self) }

    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<(), HandlerError>> { Box::pin(Handler::run(self, cancel)) }
}

pub struct Coordinator {
    name: String,
    handlers: Vec<Box<dyn Runnable>>,
}

impl Coordinator {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), handlers: Vec::new() } }

    pub fn name(&self) -> &str { &self.name }

    /// Add a handler. Names must be unique within the coordinator.
    pub fn register(&mut self, handler: impl Runnable) -> Result<&mut Self, RegisterError> {
        if self.handlers.iter().any(|h| h.name() == handler.name()) {
            return Err(RegisterError::DuplicateName(handler.name().to_string()));
        }
        self.handlers.push(Box::new(handler));
        Ok(self)
    }

    pub fn handler_names(&self) -> Vec<&str> { self.handlers.iter().map(|h| h.name()).collect() }

    pub fn len(&self) -> usize { self.handlers.len() }

    pub fn is_empty(&self) -> bool { self.handlers.is_empty() }

    /// Run every handler concurrently until `cancel` fires or one of them
    /// fails. The first failure cancels the rest; it is returned once all
    /// handlers have unwound.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), CoordinatorError> {
        if self.handlers.is_empty() {
            warn!(coordinator = %self.name, "coordinator: no handlers registered");
            return Ok(());
        }
        let group = cancel.child_token();
        let mut tasks = JoinSet::new();
        info!(coordinator = %self.name, handlers = self.handlers.len(), "coordinator: starting");
        for handler in self.handlers {
            let token = group.clone();
            tasks.spawn(async move {
                let result = handler.run(token).await;
                (handler.name().to_string(), result)
            });
        }

        let mut first: Option<CoordinatorError> = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((handler, Err(source))) => CoordinatorError::Handler { handler, source },
                Err(e) => CoordinatorError::Panicked(e.to_string()),
            };
            if first.is_none() {
                error!(coordinator = %self.name, error = %err, "coordinator: handler failed, cancelling siblings");
                group.cancel();
                first = Some(err);
            } else {
                warn!(coordinator = %self.name, error = %err, "coordinator: additional handler failure");
            }
        }
        info!(coordinator = %self.name, "coordinator: stopped");
        first.map_or(Ok(()), Err)
    }
}
