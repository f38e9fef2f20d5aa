//! Consumption plan generation.
//!
//! Merges a batch of events into the smallest set of invalidation actions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use super::events::{CacheEvent, Epoch, EventKind};
use super::keys::EntityKey;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConsumptionPlan {
    /// Drop every stored page; subsumes all other actions.
    pub purge_all: bool,
    /// Entities whose pages must be invalidated.
    pub invalidate_entities: HashSet<EntityKey>,
    /// Entities that no longer exist and should leave the registry.
    pub forget_entities: HashSet<EntityKey>,
    /// Absolute URLs to drop.
    pub purge_urls: BTreeSet<String>,
}

impl fmt::Display for ConsumptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConsumptionPlan {{ purge_all: {}, invalidate: {}, forget: {}, urls: {} }}",
            self.purge_all,
            self.invalidate_entities.len(),
            self.forget_entities.len(),
            self.purge_urls.len(),
        )
    }
}

impl ConsumptionPlan {
    /// Dedupe by event id, keep the latest epoch per content item, collapse
    /// everything into a full purge when one was requested.
    pub fn from_events(events: Vec<CacheEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();
        let mut latest_content: HashMap<u64, (Epoch, bool)> = HashMap::new();

        for event in events.into_iter().filter(|e| seen_ids.insert(e.id)) {
            match &event.kind {
                EventKind::ContentChanged { id } | EventKind::ContentDeleted { id } => {
                    let deleted = matches!(event.kind, EventKind::ContentDeleted { .. });
                    latest_content
                        .entry(*id)
                        .and_modify(|(epoch, was_deleted)| {
                            if event.epoch > *epoch {
                                *epoch = event.epoch;
                                *was_deleted = deleted;
                            }
                        })
                        .or_insert((event.epoch, deleted));
                }
                EventKind::TermChanged { id } => {
                    plan.invalidate_entities.insert(EntityKey::Term(*id));
                }
                EventKind::UrlPurged { url } => {
                    plan.purge_urls.insert(url.clone());
                }
                EventKind::EnvironmentChanged | EventKind::PurgeAll => {
                    plan.purge_all = true;
                }
            }
        }

        if plan.purge_all {
            plan.invalidate_entities.clear();
            plan.purge_urls.clear();
            return plan;
        }

        for (id, (_, deleted)) in latest_content {
            let entity = EntityKey::Content(id);
            if deleted {
                plan.forget_entities.insert(entity.clone());
            }
            plan.invalidate_entities.insert(entity);
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        !self.purge_all
            && self.invalidate_entities.is_empty()
            && self.forget_entities.is_empty()
            && self.purge_urls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, epoch: Epoch) -> CacheEvent {
        CacheEvent::new(kind, epoch)
    }

    #[test]
    fn empty_events_produce_empty_plan() {
        let plan = ConsumptionPlan::from_events(vec![]);
        assert!(plan.is_empty());
    }

    #[test]
    fn duplicate_event_ids_are_ignored() {
        let first = event(EventKind::UrlPurged { url: "https://a/x".into() }, 0);
        let mut duplicate = event(EventKind::UrlPurged { url: "https://a/y".into() }, 1);
        duplicate.id = first.id;

        let plan = ConsumptionPlan::from_events(vec![first, duplicate]);
        assert_eq!(plan.purge_urls.len(), 1);
        assert!(plan.purge_urls.contains("https://a/x"));
    }

    #[test]
    fn latest_epoch_wins_per_content_item() {
        let plan = ConsumptionPlan::from_events(vec![
            event(EventKind::ContentDeleted { id: 7 }, 1),
            event(EventKind::ContentChanged { id: 7 }, 2),
            event(EventKind::ContentChanged { id: 8 }, 3),
            event(EventKind::ContentDeleted { id: 8 }, 4),
        ]);
        assert!(plan.invalidate_entities.contains(&EntityKey::Content(7)));
        assert!(plan.invalidate_entities.contains(&EntityKey::Content(8)));
        assert!(!plan.forget_entities.contains(&EntityKey::Content(7)));
        assert!(plan.forget_entities.contains(&EntityKey::Content(8)));
    }

    #[test]
    fn out_of_order_epochs_keep_latest() {
        let plan = ConsumptionPlan::from_events(vec![
            event(EventKind::ContentDeleted { id: 1 }, 5),
            event(EventKind::ContentChanged { id: 1 }, 3),
        ]);
        assert!(plan.forget_entities.contains(&EntityKey::Content(1)));
    }

    #[test]
    fn environment_change_subsumes_everything() {
        let plan = ConsumptionPlan::from_events(vec![
            event(EventKind::ContentChanged { id: 1 }, 0),
            event(EventKind::TermChanged { id: 2 }, 1),
            event(EventKind::EnvironmentChanged, 2),
            event(EventKind::UrlPurged { url: "https://a/".into() }, 3),
        ]);
        assert!(plan.purge_all);
        assert!(plan.invalidate_entities.is_empty());
        assert!(plan.purge_urls.is_empty());
        assert!(!plan.is_empty());
    }

    #[test]
    fn term_changes_invalidate_terms() {
        let plan = ConsumptionPlan::from_events(vec![event(EventKind::TermChanged { id: 4 }, 0)]);
        assert_eq!(
            plan.invalidate_entities,
            HashSet::from([EntityKey::Term(4)])
        );
    }

    #[test]
    fn display_summarizes_counts() {
        let mut plan = ConsumptionPlan::default();
        plan.purge_urls.insert("https://a/".into());
        plan.invalidate_entities.insert(EntityKey::Content(1));
        assert_eq!(
            plan.to_string(),
            "ConsumptionPlan { purge_all: false, invalidate: 1, forget: 0, urls: 1 }"
        );
    }
}
