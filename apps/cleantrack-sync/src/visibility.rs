use crate::model::Category;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryVisibility {
    pub bins: bool,
    pub plants: bool,
    pub reports: bool,
}

impl Default for CategoryVisibility {
    fn default() -> Self {
        Self {
            bins: true,
            plants: true,
            reports: true,
        }
    }
}

impl CategoryVisibility {
    pub fn none() -> Self {
        Self {
            bins: false,
            plants: false,
            reports: false,
        }
    }

    pub fn get(&self, category: Category) -> bool {
        match category {
            Category::Bin => self.bins,
            Category::Plant => self.plants,
            Category::Report => self.reports,
        }
    }

    pub fn set(&mut self, category: Category, visible: bool) {
        match category {
            Category::Bin => self.bins = visible,
            Category::Plant => self.plants = visible,
            Category::Report => self.reports = visible,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VisibilityFilter {
    layers: CategoryVisibility,
}

impl VisibilityFilter {
    pub fn new(layers: CategoryVisibility) -> Self {
        Self { layers }
    }

    pub fn set_visible(&mut self, category: Category, visible: bool) -> bool {
        if self.layers.get(category) == visible {
            return false;
        }
        self.layers.set(category, visible);
        true
    }

    pub fn is_visible(&self, category: Category) -> bool {
        self.layers.get(category)
    }

    pub fn show_only(&mut self, category: Category) -> Vec<Category> {
        Category::ALL
            .into_iter()
            .filter(|candidate| self.set_visible(*candidate, *candidate == category))
            .collect()
    }

    pub fn layers(&self) -> CategoryVisibility {
        self.layers
    }

    pub fn snapshot(&self) -> BTreeMap<Category, bool> {
        Category::ALL
            .into_iter()
            .map(|category| (category, self.is_visible(category)))
            .collect()
    }
}
