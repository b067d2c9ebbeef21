use crate::error::SyncError;
use crate::model::{Attributes, Category, GeoEntity, LatLng};
use crate::popup::render_popup;
use crate::store::GeoEntityStore;
use crate::surface::{MapSurface, MarkerHandle, MarkerSpec};
use crate::visibility::VisibilityFilter;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;

#[derive(Debug, Clone)]
pub(crate) struct RenderedMarker {
    pub(crate) handle: MarkerHandle,
    pub(crate) position: LatLng,
    pub(crate) attributes: Attributes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub moved: usize,
    pub removed: usize,
}

impl ReconcileStats {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign for ReconcileStats {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.moved += other.moved;
        self.removed += other.removed;
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub stats: ReconcileStats,
    pub violations: Vec<SyncError>,
}

impl ReconcileReport {
    fn merge(&mut self, other: ReconcileReport) {
        self.stats += other.stats;
        self.violations.extend(other.violations);
    }
}

/// Owns the id → marker association and keeps the surface equal to the filtered store.
#[derive(Debug, Default)]
pub struct MapProjector {
    rendered: HashMap<Category, HashMap<String, RenderedMarker>>,
}

impl MapProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile<S: MapSurface + ?Sized>(
        &mut self,
        store: &GeoEntityStore,
        visibility: &VisibilityFilter,
        surface: &mut S,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for category in Category::ALL {
            report.merge(self.reconcile_category(category, store, visibility, surface));
        }
        report
    }

    /// Diffs one category by id: create what is missing, remove what is no longer desired,
    /// refresh popups whose attributes changed. Unchanged markers are left untouched.
    pub fn reconcile_category<S: MapSurface + ?Sized>(
        &mut self,
        category: Category,
        store: &GeoEntityStore,
        visibility: &VisibilityFilter,
        surface: &mut S,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let desired: Vec<&GeoEntity> = if visibility.is_visible(category) {
            store.get(category).collect()
        } else {
            Vec::new()
        };
        let desired_ids: HashSet<&str> = desired.iter().map(|entity| entity.id.as_str()).collect();
        let rendered = self.rendered.entry(category).or_default();

        let stale: Vec<String> = rendered
            .keys()
            .filter(|id| !desired_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            let Some(marker) = rendered.remove(&id) else {
                continue;
            };
            if !surface.remove_marker(marker.handle) {
                report.violations.push(violation(
                    category,
                    format!("marker for {id} was already gone from the surface"),
                ));
            }
            report.stats.removed += 1;
        }

        for entity in desired {
            match rendered.get_mut(&entity.id) {
                None => {
                    let handle = surface.add_marker(marker_spec(entity));
                    rendered.insert(entity.id.clone(), rendered_marker(handle, entity));
                    report.stats.created += 1;
                }
                Some(marker) if marker.position != entity.position => {
                    if !surface.remove_marker(marker.handle) {
                        report.violations.push(violation(
                            category,
                            format!("moved marker for {} was missing from the surface", entity.id),
                        ));
                    }
                    let handle = surface.add_marker(marker_spec(entity));
                    *marker = rendered_marker(handle, entity);
                    report.stats.moved += 1;
                }
                Some(marker) if marker.attributes != entity.attributes => {
                    let popup = render_popup(category, &entity.id, &entity.attributes);
                    if surface.update_popup(marker.handle, popup, entity.attributes.clone()) {
                        marker.attributes = entity.attributes.clone();
                        report.stats.updated += 1;
                    } else {
                        report.violations.push(violation(
                            category,
                            format!("popup update for {} hit an unknown marker", entity.id),
                        ));
                        let handle = surface.add_marker(marker_spec(entity));
                        *marker = rendered_marker(handle, entity);
                        report.stats.created += 1;
                    }
                }
                Some(_) => {}
            }
        }

        if rendered.len() != desired_ids.len()
            || rendered.keys().any(|id| !desired_ids.contains(id.as_str()))
        {
            report.violations.push(violation(
                category,
                format!(
                    "rendered {} markers but {} are desired",
                    rendered.len(),
                    desired_ids.len()
                ),
            ));
        }

        for fault in &report.violations {
            tracing::error!(category = %category, error=%fault, "map reconciliation fault");
        }
        if !report.stats.is_noop() {
            tracing::debug!(
                category = %category,
                created = report.stats.created,
                updated = report.stats.updated,
                moved = report.stats.moved,
                removed = report.stats.removed,
                "reconciled map layer"
            );
        }
        report
    }

    pub fn clear<S: MapSurface + ?Sized>(&mut self, surface: &mut S) -> usize {
        let mut removed = 0;
        for (_, markers) in self.rendered.drain() {
            for (_, marker) in markers {
                surface.remove_marker(marker.handle);
                removed += 1;
            }
        }
        removed
    }

    pub fn rendered_count(&self, category: Category) -> usize {
        self.rendered.get(&category).map(HashMap::len).unwrap_or(0)
    }

    pub(crate) fn rendered(&self, category: Category) -> impl Iterator<Item = (&String, &RenderedMarker)> + '_ {
        self.rendered.get(&category).into_iter().flat_map(|markers| markers.iter())
    }
}

fn marker_spec(entity: &GeoEntity) -> MarkerSpec {
    MarkerSpec {
        category: entity.category,
        id: entity.id.clone(),
        position: entity.position,
        popup: render_popup(entity.category, &entity.id, &entity.attributes),
        attributes: entity.attributes.clone(),
    }
}

fn rendered_marker(handle: MarkerHandle, entity: &GeoEntity) -> RenderedMarker {
    RenderedMarker {
        handle,
        position: entity.position,
        attributes: entity.attributes.clone(),
    }
}

fn violation(category: Category, detail: String) -> SyncError {
    SyncError::ReconciliationInvariantViolation { category, detail }
}
