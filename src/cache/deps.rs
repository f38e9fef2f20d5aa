//! Dependency collector for targeted page invalidation.
//!
//! Renderers call [`record`] for every entity they read while producing a
//! response. The page cache middleware runs the handler inside
//! [`with_collector`] and registers the collected set with the stored page.

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;

use super::keys::EntityKey;

tokio::task_local! {
    static DEPS: RefCell<HashSet<EntityKey>>;
}

/// Record an entity dependency. A no-op outside a collector.
///
/// ```ignore
/// sitecache::cache::deps::record(EntityKey::Content(post.id));
/// ```
pub fn record(entity: EntityKey) {
    let _ = DEPS.try_with(|deps| {
        deps.borrow_mut().insert(entity);
    });
}

/// Dependencies recorded so far in the current collector, empty outside one.
pub fn collect() -> HashSet<EntityKey> {
    DEPS.try_with(|deps| deps.borrow().clone())
        .unwrap_or_default()
}

/// Run `f` with a fresh collector and return its output with the recorded set.
///
/// The set is read before the task-local scope ends.
pub async fn with_collector<F, R>(f: F) -> (R, HashSet<EntityKey>)
where
    F: Future<Output = R>,
{
    DEPS.scope(RefCell::new(HashSet::new()), async move {
        let result = f.await;
        let recorded = DEPS
            .try_with(|deps| deps.take())
            .unwrap_or_default();
        (result, recorded)
    })
    .await
}
