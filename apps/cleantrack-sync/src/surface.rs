use crate::model::{Attributes, Category, LatLng};
use crate::popup::PopupContent;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MarkerHandle(u64);

impl MarkerHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PolylineHandle(u64);

impl PolylineHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerSpec {
    pub category: Category,
    pub id: String,
    pub position: LatLng,
    pub popup: PopupContent,
    pub attributes: Attributes,
}

/// Drawing target for markers and route polylines.
///
/// `remove_*` and `update_popup` return false when the handle is unknown to the surface,
/// which the projector treats as a reconciliation fault.
pub trait MapSurface {
    fn add_marker(&mut self, marker: MarkerSpec) -> MarkerHandle;
    fn update_popup(&mut self, handle: MarkerHandle, popup: PopupContent, attributes: Attributes) -> bool;
    fn remove_marker(&mut self, handle: MarkerHandle) -> bool;
    fn add_polyline(&mut self, path: Vec<LatLng>) -> PolylineHandle;
    fn remove_polyline(&mut self, handle: PolylineHandle) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceOp {
    AddMarker { category: Category, id: String },
    UpdatePopup { category: Category, id: String },
    RemoveMarker { category: Category, id: String },
    AddPolyline { points: usize },
    RemovePolyline,
}

impl SurfaceOp {
    pub fn category(&self) -> Option<Category> {
        match self {
            SurfaceOp::AddMarker { category, .. }
            | SurfaceOp::UpdatePopup { category, .. }
            | SurfaceOp::RemoveMarker { category, .. } => Some(*category),
            SurfaceOp::AddPolyline { .. } | SurfaceOp::RemovePolyline => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySurface {
    markers: BTreeMap<MarkerHandle, MarkerSpec>,
    polylines: BTreeMap<PolylineHandle, Vec<LatLng>>,
    next_handle: u64,
    journal: Option<Vec<SurfaceOp>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recording() -> Self {
        Self {
            journal: Some(Vec::new()),
            ..Self::default()
        }
    }

    pub fn markers(&self) -> impl Iterator<Item = &MarkerSpec> + '_ {
        self.markers.values()
    }

    pub fn markers_in(&self, category: Category) -> Vec<&MarkerSpec> {
        self.markers
            .values()
            .filter(|marker| marker.category == category)
            .collect()
    }

    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    pub fn polylines(&self) -> impl Iterator<Item = &Vec<LatLng>> + '_ {
        self.polylines.values()
    }

    pub fn polyline_count(&self) -> usize {
        self.polylines.len()
    }

    pub fn take_journal(&mut self) -> Vec<SurfaceOp> {
        self.journal.as_mut().map(std::mem::take).unwrap_or_default()
    }

    fn next(&mut self) -> u64 {
        self.next_handle = self.next_handle.saturating_add(1);
        self.next_handle
    }

    fn record(&mut self, op: SurfaceOp) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(op);
        }
    }
}

impl MapSurface for MemorySurface {
    fn add_marker(&mut self, marker: MarkerSpec) -> MarkerHandle {
        let handle = MarkerHandle::new(self.next());
        self.record(SurfaceOp::AddMarker {
            category: marker.category,
            id: marker.id.clone(),
        });
        self.markers.insert(handle, marker);
        handle
    }

    fn update_popup(&mut self, handle: MarkerHandle, popup: PopupContent, attributes: Attributes) -> bool {
        let Some(marker) = self.markers.get_mut(&handle) else {
            return false;
        };
        marker.popup = popup;
        marker.attributes = attributes;
        let op = SurfaceOp::UpdatePopup {
            category: marker.category,
            id: marker.id.clone(),
        };
        self.record(op);
        true
    }

    fn remove_marker(&mut self, handle: MarkerHandle) -> bool {
        let Some(marker) = self.markers.remove(&handle) else {
            return false;
        };
        self.record(SurfaceOp::RemoveMarker {
            category: marker.category,
            id: marker.id,
        });
        true
    }

    fn add_polyline(&mut self, path: Vec<LatLng>) -> PolylineHandle {
        let handle = PolylineHandle::new(self.next());
        self.record(SurfaceOp::AddPolyline { points: path.len() });
        self.polylines.insert(handle, path);
        handle
    }

    fn remove_polyline(&mut self, handle: PolylineHandle) -> bool {
        if self.polylines.remove(&handle).is_none() {
            return false;
        }
        self.record(SurfaceOp::RemovePolyline);
        true
    }
}
