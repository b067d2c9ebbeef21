use crate::model::{Category, GeoEntity};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Current known state of every entity, keyed by (category, id).
///
/// Plain data: no I/O and no interior locking. It is owned by the sync session and
/// only touched from its task.
#[derive(Debug, Default)]
pub struct GeoEntityStore {
    categories: HashMap<Category, BTreeMap<String, GeoEntity>>,
}

impl GeoEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, entity: GeoEntity) -> UpsertOutcome {
        let entries = self.categories.entry(entity.category).or_default();
        match entries.get_mut(&entity.id) {
            Some(existing) if *existing == entity => UpsertOutcome::Unchanged,
            Some(existing) => {
                *existing = entity;
                UpsertOutcome::Updated
            }
            None => {
                entries.insert(entity.id.clone(), entity);
                UpsertOutcome::Inserted
            }
        }
    }

    /// Drops every entry of `category` whose id is not in `present`. Returns the removed ids.
    pub fn remove_missing(&mut self, category: Category, present: &HashSet<String>) -> Vec<String> {
        let Some(entries) = self.categories.get_mut(&category) else {
            return Vec::new();
        };
        let stale: Vec<String> = entries
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            entries.remove(id);
        }
        stale
    }

    pub fn get(&self, category: Category) -> impl Iterator<Item = &GeoEntity> + '_ {
        self.categories
            .get(&category)
            .into_iter()
            .flat_map(|entries| entries.values())
    }

    pub fn entity(&self, category: Category, id: &str) -> Option<&GeoEntity> {
        self.categories.get(&category)?.get(id)
    }

    pub fn len(&self, category: Category) -> usize {
        self.categories.get(&category).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.categories.values().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LatLng;
    use serde_json::json;

    fn bin(id: &str, fill: i64) -> GeoEntity {
        let mut attributes = serde_json::Map::new();
        attributes.insert("filledPercentage".to_string(), json!(fill));
        GeoEntity {
            id: id.to_string(),
            category: Category::Bin,
            position: LatLng { lat: 28.46, lng: 77.02 },
            attributes,
        }
    }

    #[test]
    fn repeated_upserts_keep_one_entry_per_id() {
        let mut store = GeoEntityStore::new();
        assert_eq!(store.upsert(bin("b1", 10)), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(bin("b1", 10)), UpsertOutcome::Unchanged);
        assert_eq!(store.upsert(bin("b1", 80)), UpsertOutcome::Updated);
        assert_eq!(store.upsert(bin("b2", 5)), UpsertOutcome::Inserted);

        let ids: Vec<&str> = store.get(Category::Bin).map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
        assert_eq!(
            store.entity(Category::Bin, "b1").unwrap().attributes["filledPercentage"],
            json!(80)
        );
    }

    #[test]
    fn remove_missing_only_touches_one_category() {
        let mut store = GeoEntityStore::new();
        store.upsert(bin("b1", 1));
        store.upsert(bin("b2", 2));
        let mut plant = bin("p1", 0);
        plant.category = Category::Plant;
        store.upsert(plant);

        let present: HashSet<String> = ["b2".to_string()].into_iter().collect();
        assert_eq!(store.remove_missing(Category::Bin, &present), vec!["b1".to_string()]);
        assert_eq!(store.len(Category::Bin), 1);
        assert_eq!(store.len(Category::Plant), 1);

        assert_eq!(
            store.remove_missing(Category::Bin, &HashSet::new()),
            vec!["b2".to_string()]
        );
        assert_eq!(store.len(Category::Bin), 0);
        assert!(store.remove_missing(Category::Report, &HashSet::new()).is_empty());
        assert!(!store.is_empty());
    }
}
