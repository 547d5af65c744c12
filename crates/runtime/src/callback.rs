use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use kolibri_core::EventKind;

use crate::Context;

/// User reconciliation logic for one event kind.
///
/// Closures `Fn(Context<K>) -> impl Future<Output = anyhow::Result<()>>`
/// implement this directly; implement it by hand for stateful reconcilers.
pub trait Callback<K>: Send + Sync + 'static {
    fn call(&self, ctx: Context<K>) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<K, F, Fut> Callback<K> for F
where
    K: 'static,
    F: Fn(Context<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn call(&self, ctx: Context<K>) -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(self(ctx)) }
}

pub(crate) struct Callbacks<K> {
    create: Option<Arc<dyn Callback<K>>>,
    update: Option<Arc<dyn Callback<K>>>,
    delete: Option<Arc<dyn Callback<K>>>,
}

impl<K> Default for Callbacks<K> {
    fn default() -> Self { Self { create: None, update: None, delete: None } }
}

impl<K> Callbacks<K> {
    fn slot(&mut self, kind: EventKind) -> &mut Option<Arc<dyn Callback<K>>> {
        match kind {
            EventKind::Create => &mut self.create,
            EventKind::Update => &mut self.update,
            EventKind::Delete => &mut self.delete,
        }
    }

    /// Returns false if `kind` already had a callback.
    pub(crate) fn set(&mut self, kind: EventKind, cb: Arc<dyn Callback<K>>) -> bool {
        let slot = self.slot(kind);
        if slot.is_some() {
            return false;
        }
        *slot = Some(cb);
        true
    }

    pub(crate) fn get(&self, kind: EventKind) -> Option<&Arc<dyn Callback<K>>> {
        match kind {
            EventKind::Create => self.create.as_ref(),
            EventKind::Update => self.update.as_ref(),
            EventKind::Delete => self.delete.as_ref(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool { self.create.is_none() && self.update.is_none() && self.delete.is_none() }
}
