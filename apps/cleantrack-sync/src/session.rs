mod runtime;
mod view;

use crate::error::{RouteError, SyncError};
use crate::ingest::IngestEvent;
use crate::model::{Category, LatLng, MapViewport};
use crate::projector::{MapProjector, ReconcileReport};
use crate::records::{entity_from_record, record_id};
use crate::route::{RouteCompletion, RouteOverlay, RouteState, RouteTicket};
use crate::store::GeoEntityStore;
use crate::surface::MapSurface;
use crate::visibility::VisibilityFilter;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub use runtime::{spawn_session, RouteSummary, SessionCommand, SessionHandle, SessionOptions};
pub use view::{MapMarker, MapView};

pub type ErrorReporter = Arc<dyn Fn(&SyncError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Unsubscribed,
    Pending,
    Syncing,
    Live,
    /// Connection lost or not yet refreshed after a reconnect. Last known data stays on the map.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub state: StreamState,
    pub generation: Option<u64>,
    pub snapshots: u64,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub last_snapshot_skipped: usize,
    pub failed_attempts: u32,
    pub retry_in_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self {
            state: StreamState::Unsubscribed,
            generation: None,
            snapshots: 0,
            last_snapshot_at: None,
            last_snapshot_skipped: 0,
            failed_attempts: 0,
            retry_in_ms: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStatus {
    pub visible: bool,
    pub entities: usize,
    pub rendered: usize,
    pub stream: StreamStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub categories: BTreeMap<Category, CategoryStatus>,
    pub route: RouteState,
}

#[derive(Debug, Default)]
pub struct SnapshotOutcome {
    pub applied: usize,
    pub skipped: usize,
    pub removed: Vec<String>,
    pub report: ReconcileReport,
}

/// All map state for one dashboard view. Every method runs to completion and leaves the
/// surface reconciled; the runtime task is the only caller.
pub struct SyncSession<S: MapSurface> {
    store: GeoEntityStore,
    visibility: VisibilityFilter,
    projector: MapProjector,
    route: RouteOverlay,
    surface: S,
    viewport: MapViewport,
    streams: BTreeMap<Category, StreamStatus>,
    reporter: Option<ErrorReporter>,
}

impl<S: MapSurface> SyncSession<S> {
    pub fn new(surface: S, visibility: VisibilityFilter, viewport: MapViewport) -> Self {
        Self {
            store: GeoEntityStore::new(),
            visibility,
            projector: MapProjector::new(),
            route: RouteOverlay::new(),
            surface,
            viewport,
            streams: Category::ALL
                .into_iter()
                .map(|category| (category, StreamStatus::default()))
                .collect(),
            reporter: None,
        }
    }

    pub fn with_error_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn store(&self) -> &GeoEntityStore {
        &self.store
    }

    pub fn stream(&self, category: Category) -> StreamStatus {
        self.streams.get(&category).cloned().unwrap_or_default()
    }

    /// Marks a new subscription as current. Events tagged with any other generation are ignored.
    pub fn begin_subscription(&mut self, category: Category, generation: u64) {
        let stream = self.streams.entry(category).or_default();
        *stream = StreamStatus {
            state: StreamState::Pending,
            generation: Some(generation),
            ..StreamStatus::default()
        };
    }

    /// Detaches the category: nothing more is applied for it and its entities leave the map.
    pub fn end_subscription(&mut self, category: Category) -> ReconcileReport {
        if let Some(stream) = self.streams.get_mut(&category) {
            stream.state = StreamState::Unsubscribed;
            stream.generation = None;
            stream.retry_in_ms = None;
        }
        let removed = self.store.remove_missing(category, &HashSet::new());
        tracing::info!(category = %category, removed = removed.len(), "unsubscribed");
        self.reconcile_category(category)
    }

    pub fn handle_ingest_event(&mut self, event: IngestEvent) -> Option<ReconcileReport> {
        let category = event.category();
        let current = self.streams.get(&category).and_then(|stream| stream.generation);
        if current != Some(event.generation()) {
            tracing::debug!(
                category = %category,
                generation = event.generation(),
                "dropping event from a cancelled subscription"
            );
            return None;
        }

        match event {
            IngestEvent::Connected { .. } => {
                if let Some(stream) = self.streams.get_mut(&category) {
                    // Stale holds until the first snapshot after a failure.
                    if stream.state != StreamState::Stale {
                        stream.state = StreamState::Syncing;
                    }
                    stream.retry_in_ms = None;
                }
                None
            }
            IngestEvent::Snapshot { records, .. } => {
                let outcome = self.apply_snapshot(category, &records);
                Some(outcome.report)
            }
            IngestEvent::Failed {
                attempt,
                retry_in,
                error,
                ..
            } => {
                if let Some(stream) = self.streams.get_mut(&category) {
                    stream.state = StreamState::Stale;
                    stream.failed_attempts = attempt;
                    stream.retry_in_ms = Some(retry_in.as_millis() as u64);
                    stream.last_error = Some(error.to_string());
                }
                self.report(&SyncError::SubscriptionFailure {
                    category,
                    attempt,
                    retry_in,
                    source: error,
                });
                None
            }
        }
    }

    pub fn apply_snapshot(&mut self, category: Category, records: &[JsonValue]) -> SnapshotOutcome {
        let mut present = HashSet::with_capacity(records.len());
        let mut outcome = SnapshotOutcome::default();

        for record in records {
            match entity_from_record(category, record) {
                Ok(entity) => {
                    present.insert(entity.id.clone());
                    self.store.upsert(entity);
                    outcome.applied += 1;
                }
                Err(reason) => {
                    outcome.skipped += 1;
                    let positionless = reason.is_positionless();
                    let fault = SyncError::MalformedRecord {
                        category,
                        id: record_id(category, record),
                        reason,
                    };
                    if positionless {
                        tracing::debug!(category = %category, error=%fault, "record has no position");
                    } else {
                        tracing::warn!(category = %category, error=%fault, "skipping record");
                        self.report(&fault);
                    }
                }
            }
        }

        outcome.removed = self.store.remove_missing(category, &present);
        if let Some(stream) = self.streams.get_mut(&category) {
            stream.state = StreamState::Live;
            stream.snapshots = stream.snapshots.saturating_add(1);
            stream.last_snapshot_at = Some(Utc::now());
            stream.last_snapshot_skipped = outcome.skipped;
            stream.failed_attempts = 0;
            stream.retry_in_ms = None;
            stream.last_error = None;
        }
        outcome.report = self.reconcile_category(category);
        tracing::debug!(
            category = %category,
            applied = outcome.applied,
            skipped = outcome.skipped,
            removed = outcome.removed.len(),
            "applied snapshot"
        );
        outcome
    }

    pub fn set_visible(&mut self, category: Category, visible: bool) -> ReconcileReport {
        if self.visibility.set_visible(category, visible) {
            tracing::info!(category = %category, visible, "layer visibility changed");
        }
        self.reconcile()
    }

    pub fn show_only(&mut self, category: Category) -> ReconcileReport {
        let changed = self.visibility.show_only(category);
        tracing::info!(category = %category, changed = changed.len(), "showing single layer");
        self.reconcile()
    }

    pub fn is_visible(&self, category: Category) -> bool {
        self.visibility.is_visible(category)
    }

    pub fn reconcile(&mut self) -> ReconcileReport {
        let report = self
            .projector
            .reconcile(&self.store, &self.visibility, &mut self.surface);
        self.report_violations(&report);
        report
    }

    fn reconcile_category(&mut self, category: Category) -> ReconcileReport {
        let report = self.projector.reconcile_category(
            category,
            &self.store,
            &self.visibility,
            &mut self.surface,
        );
        self.report_violations(&report);
        report
    }

    pub fn begin_route(&mut self, start: LatLng, end: LatLng) -> RouteTicket {
        self.route.begin(start, end, &mut self.surface)
    }

    pub fn complete_route(
        &mut self,
        request_id: u64,
        result: Result<Vec<LatLng>, RouteError>,
    ) -> RouteCompletion {
        self.route.complete(request_id, result, &mut self.surface)
    }

    pub fn cancel_route(&mut self) -> Option<u64> {
        self.route.cancel(&mut self.surface)
    }

    pub fn status(&self) -> SessionStatus {
        let categories = Category::ALL
            .into_iter()
            .map(|category| {
                let status = CategoryStatus {
                    visible: self.visibility.is_visible(category),
                    entities: self.store.len(category),
                    rendered: self.projector.rendered_count(category),
                    stream: self.stream(category),
                };
                (category, status)
            })
            .collect();
        SessionStatus {
            categories,
            route: self.route.state().clone(),
        }
    }

    pub fn map_view(&self) -> MapView {
        MapView::build(&self.projector, &self.route, self.viewport)
    }

    /// Leaves the surface empty: route dropped, every marker removed, all data forgotten.
    /// Returns the number of markers removed.
    pub fn teardown(&mut self) -> usize {
        self.route.cancel(&mut self.surface);
        let removed = self.projector.clear(&mut self.surface);
        for category in Category::ALL {
            self.store.remove_missing(category, &HashSet::new());
            if let Some(stream) = self.streams.get_mut(&category) {
                stream.state = StreamState::Unsubscribed;
                stream.generation = None;
                stream.retry_in_ms = None;
            }
        }
        tracing::info!(markers = removed, "sync session torn down");
        removed
    }

    fn report_violations(&self, report: &ReconcileReport) {
        for fault in &report.violations {
            self.report(fault);
        }
    }

    fn report(&self, fault: &SyncError) {
        if let Some(reporter) = &self.reporter {
            reporter(fault);
        }
    }
}
