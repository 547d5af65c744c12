//! Kolibri core types: resource identity, queued work, and the watch-source contract.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use kube::Resource;
use serde::{Deserialize, Serialize};

mod key;
pub mod policy;
pub mod recorder;
pub mod source;

pub use key::{KeyError, ResourceKey};
pub use policy::{Always, GenerationChanged, ResourceVersionChanged, UpdatePolicy};
pub use recorder::{EventRecorder, EventType, RecordedEvent};
pub use source::{DeletedObject, EventHandler, ObjectLookup, SourceError, SourceFactory, Tombstone, WatchSource};

/// Watched object bound: a statically typed Kubernetes resource shared across tasks.
pub trait Object: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {}

impl<K> Object for K where K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {}

/// Kind of change a queued item stands for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Unit of work on the event queue. Carries identity only; the object is
/// re-read from the watch source when the item is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub key: ResourceKey,
    pub kind: EventKind,
}

impl WorkItem {
    pub fn new(key: ResourceKey, kind: EventKind) -> Self { Self { key, kind } }
}

/// Namespace restriction applied when a watch source is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NamespaceScope {
    /// Every namespace (and cluster-scoped objects).
    #[default]
    All,
    /// A single namespace. An empty name is the same as `All`.
    Namespace(String),
    /// The namespace the client is configured for.
    Current,
}

impl NamespaceScope {
    /// Resolve to a concrete namespace, `None` meaning all namespaces.
    /// `current` supplies the caller's namespace for `Current`.
    pub fn resolve(&self, current: &str) -> Option<String> {
        match self {
            NamespaceScope::All => None,
            NamespaceScope::Namespace(ns) if ns.is_empty() => None,
            NamespaceScope::Namespace(ns) => Some(ns.clone()),
            NamespaceScope::Current if current.is_empty() => None,
            NamespaceScope::Current => Some(current.to_string()),
        }
    }
}

pub mod prelude {
    pub use super::{
        DeletedObject, EventHandler, EventKind, EventRecorder, KeyError, NamespaceScope, Object, ObjectLookup,
        RecordedEvent, ResourceKey, SourceError, SourceFactory, Tombstone, UpdatePolicy, WatchSource, WorkItem,
    };
}
