//! Contract between the reconciliation engine and whatever produces change notifications.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{NamespaceScope, Object, ResourceKey};

/// Poll period used by the default cache-sync wait.
pub const SYNC_POLL: Duration = Duration::from_millis(100);

/// Lookup failures from a watch source.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("{0} not found")]
    NotFound(ResourceKey),
    #[error("watch source unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl SourceError {
    pub fn is_not_found(&self) -> bool { matches!(self, SourceError::NotFound(_)) }
}

/// Final state of a deleted object, as delivered with a delete notification.
#[derive(Debug, Clone)]
pub enum DeletedObject<K> {
    /// The object as last held in the source cache.
    Known(Arc<K>),
    /// The delete was observed after the object had already left the cache
    /// (e.g. missed while the watch was disconnected).
    Tombstone(Tombstone<K>),
}

/// Last known state of an object whose deletion was not directly observed.
#[derive(Debug, Clone)]
pub struct Tombstone<K> {
    /// Key string the source filed the object under.
    pub key: String,
    /// Last known object, if any survived.
    pub last_state: Option<Arc<K>>,
}

/// Receiver of raw notifications. Calls must not block: implementations only enqueue.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: Arc<K>);
    fn on_update(&self, old: Arc<K>, new: Arc<K>);
    fn on_delete(&self, obj: DeletedObject<K>);
}

/// Point lookup of the current state of an object.
pub trait ObjectLookup<K>: Send + Sync {
    fn get(&self, key: &ResourceKey) -> Result<Arc<K>, SourceError>;
}

/// Producer of notifications for one resource type.
///
/// Handlers are registered before `start`; `start` must be idempotent. The
/// cache is read-only from the engine's side.
#[async_trait::async_trait]
pub trait WatchSource: ObjectLookup<Self::Object> + 'static {
    type Object: Object;

    fn has_synced(&self) -> bool;

    fn add_event_handler(&self, handler: Arc<dyn EventHandler<Self::Object>>);

    /// Begin delivering notifications until `stop` is cancelled.
    fn start(&self, stop: CancellationToken);

    /// Wait until the initial listing is complete. Returns `false` if `stop`
    /// fires first.
    async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> bool {
        loop {
            if self.has_synced() {
                return true;
            }
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(SYNC_POLL) => {}
            }
        }
    }
}

/// Builds the watch source for a handler once its namespace scope is known.
pub trait SourceFactory {
    type Source: WatchSource;

    fn create(self, scope: &NamespaceScope) -> Result<Self::Source, SourceError>;
}

impl<S, F> SourceFactory for F
where
    S: WatchSource,
    F: FnOnce(&NamespaceScope) -> Result<S, SourceError>,
{
    type Source = S;

    fn create(self, scope: &NamespaceScope) -> Result<S, SourceError> { self(scope) }
}
