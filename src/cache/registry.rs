//! Bidirectional dependency registry.
//!
//! Tracks which stored pages were rendered from which entities so a content
//! change invalidates exactly the affected pages.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::keys::{EntityKey, PageKey};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

#[derive(Default)]
struct Maps {
    entity_to_pages: HashMap<EntityKey, HashSet<PageKey>>,
    page_to_entities: HashMap<PageKey, HashSet<EntityKey>>,
}

/// Entity → pages and page → entities, kept consistent under one lock.
#[derive(Default)]
pub struct CacheRegistry {
    maps: RwLock<Maps>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the entities a stored page depends on, replacing earlier ones.
    pub fn register(&self, page: PageKey, entities: HashSet<EntityKey>) {
        let mut maps = rw_write(&self.maps, SOURCE, "register");
        detach(&mut maps, &page);
        if entities.is_empty() {
            return;
        }
        for entity in &entities {
            maps.entity_to_pages
                .entry(entity.clone())
                .or_default()
                .insert(page.clone());
        }
        maps.page_to_entities.insert(page, entities);
    }

    pub fn pages_for_entity(&self, entity: &EntityKey) -> HashSet<PageKey> {
        rw_read(&self.maps, SOURCE, "pages_for_entity")
            .entity_to_pages
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn entities_for_page(&self, page: &PageKey) -> HashSet<EntityKey> {
        rw_read(&self.maps, SOURCE, "entities_for_page")
            .page_to_entities
            .get(page)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget a page that was invalidated.
    pub fn unregister(&self, page: &PageKey) {
        detach(&mut rw_write(&self.maps, SOURCE, "unregister"), page);
    }

    /// Remove an entity, returning the pages that depended on it.
    ///
    /// Pages keep their other dependencies.
    pub fn unregister_entity(&self, entity: &EntityKey) -> HashSet<PageKey> {
        let mut maps = rw_write(&self.maps, SOURCE, "unregister_entity");
        let affected = maps.entity_to_pages.remove(entity).unwrap_or_default();
        for page in &affected {
            if let Some(entities) = maps.page_to_entities.get_mut(page) {
                entities.remove(entity);
                if entities.is_empty() {
                    maps.page_to_entities.remove(page);
                }
            }
        }
        affected
    }

    pub fn clear(&self) {
        let mut maps = rw_write(&self.maps, SOURCE, "clear");
        maps.entity_to_pages.clear();
        maps.page_to_entities.clear();
    }

    pub fn entity_count(&self) -> usize {
        rw_read(&self.maps, SOURCE, "entity_count")
            .entity_to_pages
            .len()
    }

    pub fn page_count(&self) -> usize {
        rw_read(&self.maps, SOURCE, "page_count")
            .page_to_entities
            .len()
    }
}

fn detach(maps: &mut Maps, page: &PageKey) {
    let Some(entities) = maps.page_to_entities.remove(page) else {
        return;
    };
    for entity in entities {
        if let Some(pages) = maps.entity_to_pages.get_mut(&entity) {
            pages.remove(page);
            if pages.is_empty() {
                maps.entity_to_pages.remove(&entity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(entities: &[EntityKey]) -> HashSet<EntityKey> {
        entities.iter().cloned().collect()
    }

    #[test]
    fn register_and_lookup() {
        let registry = CacheRegistry::new();
        let page = PageKey::new("example.com", "/blog/hello-world");
        registry.register(page.clone(), deps(&[EntityKey::Content(42)]));

        assert!(
            registry
                .pages_for_entity(&EntityKey::Content(42))
                .contains(&page)
        );
        assert!(
            registry
                .entities_for_page(&page)
                .contains(&EntityKey::Content(42))
        );
    }

    #[test]
    fn reregistering_replaces_dependencies() {
        let registry = CacheRegistry::new();
        let page = PageKey::new("example.com", "/");
        registry.register(page.clone(), deps(&[EntityKey::Content(1)]));
        registry.register(page.clone(), deps(&[EntityKey::Content(2)]));

        assert!(registry.pages_for_entity(&EntityKey::Content(1)).is_empty());
        assert_eq!(registry.pages_for_entity(&EntityKey::Content(2)).len(), 1);
        assert_eq!(registry.entity_count(), 1);
    }

    #[test]
    fn unregister_cleans_up_mappings() {
        let registry = CacheRegistry::new();
        let page = PageKey::new("example.com", "/a");
        registry.register(
            page.clone(),
            deps(&[EntityKey::Content(1), EntityKey::Term(3)]),
        );
        assert_eq!(registry.page_count(), 1);
        assert_eq!(registry.entity_count(), 2);

        registry.unregister(&page);
        assert_eq!(registry.page_count(), 0);
        assert_eq!(registry.entity_count(), 0);
    }

    #[test]
    fn unregister_entity_returns_affected_pages() {
        let registry = CacheRegistry::new();
        let a = PageKey::new("example.com", "/a");
        let b = PageKey::new("example.com", "/b");
        registry.register(a.clone(), deps(&[EntityKey::Content(9)]));
        registry.register(
            b.clone(),
            deps(&[EntityKey::Content(9), EntityKey::Term(1)]),
        );

        let affected = registry.unregister_entity(&EntityKey::Content(9));
        assert_eq!(affected.len(), 2);
        assert!(affected.contains(&a) && affected.contains(&b));
        assert_eq!(registry.page_count(), 1);
        assert!(registry.pages_for_entity(&EntityKey::Term(1)).contains(&b));
    }

    #[test]
    fn empty_dependencies_are_not_tracked() {
        let registry = CacheRegistry::new();
        registry.register(PageKey::root("example.com"), HashSet::new());
        assert_eq!(registry.page_count(), 0);
    }

    #[test]
    fn clear_removes_all_mappings() {
        let registry = CacheRegistry::new();
        registry.register(PageKey::root("example.com"), deps(&[EntityKey::Content(1)]));
        registry.clear();
        assert_eq!(registry.page_count(), 0);
        assert_eq!(registry.entity_count(), 0);
    }
}
