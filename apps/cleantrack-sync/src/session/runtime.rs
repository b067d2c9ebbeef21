use super::{MapView, SessionStatus, SyncSession};
use crate::error::RouteError;
use crate::ingest::{spawn_subscription, BackoffPolicy, IngestEvent, SnapshotSource, SubscriptionHandle};
use crate::model::{Category, LatLng};
use crate::projector::ReconcileStats;
use crate::route::{random_nearby_endpoints, RouteCompletion, RoutingProvider};
use crate::surface::MapSurface;
use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    pub backoff: BackoffPolicy,
    pub route_origin: LatLng,
    pub route_spread: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            route_origin: LatLng {
                lat: 28.61,
                lng: 77.20,
            },
            route_spread: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSummary {
    pub request_id: u64,
    pub start: LatLng,
    pub end: LatLng,
    pub path: Vec<LatLng>,
}

pub type RouteReply = oneshot::Sender<Result<RouteSummary, RouteError>>;

#[derive(Debug)]
pub enum SessionCommand {
    Subscribe {
        category: Category,
        respond_to: oneshot::Sender<u64>,
    },
    Unsubscribe {
        category: Category,
        respond_to: oneshot::Sender<ReconcileStats>,
    },
    SetVisible {
        category: Category,
        visible: bool,
        respond_to: oneshot::Sender<ReconcileStats>,
    },
    ShowOnly {
        category: Category,
        respond_to: oneshot::Sender<ReconcileStats>,
    },
    ShowRoute {
        start: Option<LatLng>,
        end: Option<LatLng>,
        respond_to: RouteReply,
    },
    GetStatus {
        respond_to: oneshot::Sender<SessionStatus>,
    },
    GetMapView {
        respond_to: oneshot::Sender<MapView>,
    },
    Shutdown {
        respond_to: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| anyhow!("sync session stopped"))?;
        rx.await.context("sync session dropped response")
    }

    pub async fn subscribe(&self, category: Category) -> Result<u64> {
        self.call(|respond_to| SessionCommand::Subscribe {
            category,
            respond_to,
        })
        .await
    }

    pub async fn unsubscribe(&self, category: Category) -> Result<ReconcileStats> {
        self.call(|respond_to| SessionCommand::Unsubscribe {
            category,
            respond_to,
        })
        .await
    }

    pub async fn set_visible(&self, category: Category, visible: bool) -> Result<ReconcileStats> {
        self.call(|respond_to| SessionCommand::SetVisible {
            category,
            visible,
            respond_to,
        })
        .await
    }

    pub async fn show_only(&self, category: Category) -> Result<ReconcileStats> {
        self.call(|respond_to| SessionCommand::ShowOnly {
            category,
            respond_to,
        })
        .await
    }

    /// Queues a route request and returns the receiver for its outcome. With neither endpoint
    /// given, two random points near the configured origin are used.
    pub fn request_route(
        &self,
        start: Option<LatLng>,
        end: Option<LatLng>,
    ) -> oneshot::Receiver<Result<RouteSummary, RouteError>> {
        let (tx, rx) = oneshot::channel();
        // On a closed session the command is dropped with its sender, which the receiver sees.
        let _ = self.tx.send(SessionCommand::ShowRoute {
            start,
            end,
            respond_to: tx,
        });
        rx
    }

    pub async fn show_route(&self, start: Option<LatLng>, end: Option<LatLng>) -> Result<RouteSummary, RouteError> {
        self.request_route(start, end)
            .await
            .unwrap_or(Err(RouteError::SessionClosed))
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.call(|respond_to| SessionCommand::GetStatus { respond_to })
            .await
    }

    pub async fn map_view(&self) -> Result<MapView> {
        self.call(|respond_to| SessionCommand::GetMapView { respond_to })
            .await
    }

    /// Cancels every subscription and the in-flight route, then clears the surface.
    /// Returns the number of markers removed.
    pub async fn shutdown(&self) -> Result<usize> {
        self.call(|respond_to| SessionCommand::Shutdown { respond_to })
            .await
    }
}

struct RouteOutcome {
    request_id: u64,
    result: Result<Vec<LatLng>, RouteError>,
}

struct PendingRoute {
    request_id: u64,
    start: LatLng,
    end: LatLng,
    task: JoinHandle<()>,
    respond_to: RouteReply,
}

struct SessionRuntime<S: MapSurface> {
    session: SyncSession<S>,
    source: Arc<dyn SnapshotSource>,
    router: Arc<dyn RoutingProvider>,
    options: SessionOptions,
    subscriptions: HashMap<Category, SubscriptionHandle>,
    next_generation: u64,
    ingest_tx: mpsc::UnboundedSender<IngestEvent>,
    route_tx: mpsc::UnboundedSender<RouteOutcome>,
    pending_route: Option<PendingRoute>,
    rng: StdRng,
}

/// Moves the session onto its own task. All mutations happen there, one event at a time.
pub fn spawn_session<S>(
    session: SyncSession<S>,
    source: Arc<dyn SnapshotSource>,
    router: Arc<dyn RoutingProvider>,
    options: SessionOptions,
) -> (SessionHandle, JoinHandle<()>)
where
    S: MapSurface + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
    let (route_tx, route_rx) = mpsc::unbounded_channel();
    let runtime = SessionRuntime {
        session,
        source,
        router,
        options,
        subscriptions: HashMap::new(),
        next_generation: 0,
        ingest_tx,
        route_tx,
        pending_route: None,
        rng: StdRng::from_entropy(),
    };
    let task = tokio::spawn(runtime.run(rx, ingest_rx, route_rx));
    (SessionHandle { tx }, task)
}

impl<S: MapSurface + Send + 'static> SessionRuntime<S> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut ingest_rx: mpsc::UnboundedReceiver<IngestEvent>,
        mut route_rx: mpsc::UnboundedReceiver<RouteOutcome>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("all session handles dropped");
                        self.teardown();
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(event) = ingest_rx.recv() => {
                    self.session.handle_ingest_event(event);
                }
                Some(outcome) = route_rx.recv() => {
                    self.finish_route(outcome);
                }
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Subscribe {
                category,
                respond_to,
            } => {
                let generation = self.subscribe(category);
                let _ = respond_to.send(generation);
            }
            SessionCommand::Unsubscribe {
                category,
                respond_to,
            } => {
                if let Some(handle) = self.subscriptions.remove(&category) {
                    handle.cancel();
                }
                let report = self.session.end_subscription(category);
                let _ = respond_to.send(report.stats);
            }
            SessionCommand::SetVisible {
                category,
                visible,
                respond_to,
            } => {
                let report = self.session.set_visible(category, visible);
                let _ = respond_to.send(report.stats);
            }
            SessionCommand::ShowOnly {
                category,
                respond_to,
            } => {
                let report = self.session.show_only(category);
                let _ = respond_to.send(report.stats);
            }
            SessionCommand::ShowRoute {
                start,
                end,
                respond_to,
            } => self.start_route(start, end, respond_to),
            SessionCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(self.session.status());
            }
            SessionCommand::GetMapView { respond_to } => {
                let _ = respond_to.send(self.session.map_view());
            }
            SessionCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(self.teardown());
                return false;
            }
        }
        true
    }

    fn subscribe(&mut self, category: Category) -> u64 {
        if let Some(previous) = self.subscriptions.remove(&category) {
            previous.cancel();
        }
        self.next_generation = self.next_generation.saturating_add(1);
        let generation = self.next_generation;
        self.session.begin_subscription(category, generation);
        let handle = spawn_subscription(
            self.source.clone(),
            category,
            generation,
            self.options.backoff,
            self.ingest_tx.clone(),
        );
        self.subscriptions.insert(category, handle);
        tracing::info!(category = %category, generation, "subscription started");
        generation
    }

    fn start_route(&mut self, start: Option<LatLng>, end: Option<LatLng>, respond_to: RouteReply) {
        let (start, end) = match resolve_endpoints(start, end) {
            Ok(Some(endpoints)) => endpoints,
            Ok(None) => random_nearby_endpoints(
                &mut self.rng,
                self.options.route_origin,
                self.options.route_spread,
            ),
            Err(err) => {
                let _ = respond_to.send(Err(err));
                return;
            }
        };

        let ticket = self.session.begin_route(start, end);
        if let Some(previous) = self.pending_route.take() {
            previous.task.abort();
            let _ = previous.respond_to.send(Err(RouteError::Superseded));
        }

        let request = self.router.route(start, end);
        let route_tx = self.route_tx.clone();
        let request_id = ticket.request_id;
        let task = tokio::spawn(async move {
            let result = request.await;
            let _ = route_tx.send(RouteOutcome { request_id, result });
        });
        self.pending_route = Some(PendingRoute {
            request_id,
            start,
            end,
            task,
            respond_to,
        });
    }

    fn finish_route(&mut self, outcome: RouteOutcome) {
        let completion = self.session.complete_route(outcome.request_id, outcome.result);
        let current = self.pending_route.as_ref().map(|pending| pending.request_id);
        if current != Some(outcome.request_id) {
            return;
        }
        let Some(pending) = self.pending_route.take() else {
            return;
        };
        let reply = match completion {
            RouteCompletion::Displayed(path) => Ok(RouteSummary {
                request_id: pending.request_id,
                start: pending.start,
                end: pending.end,
                path,
            }),
            RouteCompletion::Failed(err) => Err(err),
            RouteCompletion::Discarded => Err(RouteError::Superseded),
        };
        let _ = pending.respond_to.send(reply);
    }

    fn teardown(&mut self) -> usize {
        for (_, handle) in self.subscriptions.drain() {
            handle.cancel();
        }
        if let Some(pending) = self.pending_route.take() {
            pending.task.abort();
            let _ = pending.respond_to.send(Err(RouteError::SessionClosed));
        }
        self.session.teardown()
    }
}

/// Both endpoints, or neither (demo mode). Anything else is rejected.
fn resolve_endpoints(
    start: Option<LatLng>,
    end: Option<LatLng>,
) -> Result<Option<(LatLng, LatLng)>, RouteError> {
    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) => {
            for (name, point) in [("start", start), ("end", end)] {
                if !point.is_valid() {
                    return Err(RouteError::InvalidEndpoints(format!(
                        "{name} {},{} is outside WGS84 bounds",
                        point.lat, point.lng
                    )));
                }
            }
            Ok(Some((start, end)))
        }
        _ => Err(RouteError::InvalidEndpoints(
            "give both start and end, or neither".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::ingest::SnapshotStream;
    use crate::model::MapViewport;
    use crate::records::RecordBatch;
    use crate::route::RouteState;
    use crate::session::StreamState;
    use crate::surface::MemorySurface;
    use crate::visibility::VisibilityFilter;
    use futures::future::{BoxFuture, FutureExt};
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Default)]
    struct ChannelSource {
        feeds: Mutex<HashMap<Category, mpsc::UnboundedSender<Result<RecordBatch, SourceError>>>>,
    }

    impl ChannelSource {
        fn push(&self, category: Category, records: serde_json::Value) {
            let feeds = self.feeds.lock().unwrap();
            let feed = feeds.get(&category).expect("category subscribed");
            feed.send(Ok(records.as_array().cloned().unwrap_or_default()))
                .expect("subscription alive");
        }

        fn drop_feed(&self, category: Category) {
            self.feeds.lock().unwrap().remove(&category);
        }

        async fn wait_for_feed(&self, category: Category) {
            while !self.feeds.lock().unwrap().contains_key(&category) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    impl SnapshotSource for ChannelSource {
        fn subscribe(&self, category: Category) -> BoxFuture<'static, Result<SnapshotStream, SourceError>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().unwrap().insert(category, tx);
            futures::future::ready(Ok(UnboundedReceiverStream::new(rx).boxed())).boxed()
        }
    }

    #[derive(Default)]
    struct GatedRouter {
        gates: Mutex<Vec<oneshot::Sender<Result<Vec<LatLng>, RouteError>>>>,
    }

    impl RoutingProvider for GatedRouter {
        fn route(&self, _start: LatLng, _end: LatLng) -> BoxFuture<'static, Result<Vec<LatLng>, RouteError>> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().push(tx);
            async move { rx.await.unwrap_or(Err(RouteError::Provider("gate dropped".to_string()))) }.boxed()
        }
    }

    impl GatedRouter {
        fn calls(&self) -> usize {
            self.gates.lock().unwrap().len()
        }

        fn release(&self, index: usize, result: Result<Vec<LatLng>, RouteError>) {
            let mut gates = self.gates.lock().unwrap();
            let (tx, _) = oneshot::channel();
            let gate = std::mem::replace(&mut gates[index], tx);
            let _ = gate.send(result);
        }
    }

    fn path(offset: f64) -> Vec<LatLng> {
        vec![
            LatLng { lat: 28.60 + offset, lng: 77.20 },
            LatLng { lat: 28.62 + offset, lng: 77.22 },
        ]
    }

    fn start(
        source: Arc<ChannelSource>,
        router: Arc<GatedRouter>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let session = SyncSession::new(
            MemorySurface::new(),
            VisibilityFilter::default(),
            MapViewport::default(),
        );
        spawn_session(session, source, router, SessionOptions::default())
    }

    async fn wait_for<F: Fn(&SessionStatus) -> bool>(handle: &SessionHandle, check: F) -> SessionStatus {
        for _ in 0..200 {
            let status = handle.status().await.unwrap();
            if check(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached the expected status");
    }

    #[tokio::test]
    async fn snapshots_flow_to_the_map_and_visibility_hides_them() {
        let source = Arc::new(ChannelSource::default());
        let router = Arc::new(GatedRouter::default());
        let (handle, _task) = start(source.clone(), router);

        handle.subscribe(Category::Bin).await.unwrap();
        wait_for(&handle, |s| s.categories[&Category::Bin].stream.state == StreamState::Syncing).await;
        source.push(
            Category::Bin,
            json!([{"id": "b1", "lat": 28.45, "lng": 77.03, "filledPercentage": 80}]),
        );
        wait_for(&handle, |s| s.categories[&Category::Bin].rendered == 1).await;

        let view = handle.map_view().await.unwrap();
        assert_eq!(view.markers[0].popup.field("Fill"), Some("80%"));

        let stats = handle.set_visible(Category::Bin, false).await.unwrap();
        assert_eq!(stats.removed, 1);
        assert!(handle.map_view().await.unwrap().markers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscription_replaces_the_layer_with_the_fresh_snapshot() {
        let source = Arc::new(ChannelSource::default());
        let router = Arc::new(GatedRouter::default());
        let (handle, _task) = start(source.clone(), router);
        let bin_state = |s: &SessionStatus| s.categories[&Category::Bin].stream.state;

        handle.subscribe(Category::Bin).await.unwrap();
        wait_for(&handle, |s| bin_state(s) == StreamState::Syncing).await;
        source.push(
            Category::Bin,
            json!([{"id": "b1", "lat": 28.41, "lng": 77.0}, {"id": "b2", "lat": 28.42, "lng": 77.0}]),
        );
        wait_for(&handle, |s| bin_state(s) == StreamState::Live).await;

        source.drop_feed(Category::Bin);
        let status = wait_for(&handle, |s| bin_state(s) == StreamState::Stale).await;
        assert_eq!(status.categories[&Category::Bin].stream.retry_in_ms, Some(1000));
        assert_eq!(handle.map_view().await.unwrap().marker_count(Category::Bin), 2);

        source.wait_for_feed(Category::Bin).await;
        assert_eq!(bin_state(&handle.status().await.unwrap()), StreamState::Stale);
        source.push(
            Category::Bin,
            json!([{"id": "b2", "lat": 28.42, "lng": 77.0}, {"id": "b3", "lat": 28.43, "lng": 77.0}]),
        );
        let status = wait_for(&handle, |s| bin_state(s) == StreamState::Live).await;
        assert_eq!(status.categories[&Category::Bin].entities, 2);

        let ids: Vec<String> = handle
            .map_view()
            .await
            .unwrap()
            .markers
            .into_iter()
            .map(|marker| marker.id)
            .collect();
        assert_eq!(ids, ["b2", "b3"]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_layer_and_ignores_later_pushes() {
        let source = Arc::new(ChannelSource::default());
        let router = Arc::new(GatedRouter::default());
        let (handle, _task) = start(source.clone(), router);

        handle.subscribe(Category::Plant).await.unwrap();
        wait_for(&handle, |s| s.categories[&Category::Plant].stream.state == StreamState::Syncing).await;
        source.push(Category::Plant, json!([{"id": "p1", "lat": 28.4, "lng": 77.0}]));
        wait_for(&handle, |s| s.categories[&Category::Plant].entities == 1).await;

        let stats = handle.unsubscribe(Category::Plant).await.unwrap();
        assert_eq!(stats.removed, 1);
        let status = handle.status().await.unwrap();
        assert_eq!(status.categories[&Category::Plant].stream.state, StreamState::Unsubscribed);
        assert_eq!(status.categories[&Category::Plant].entities, 0);
    }

    #[tokio::test]
    async fn newer_route_supersedes_the_in_flight_one() {
        let source = Arc::new(ChannelSource::default());
        let router = Arc::new(GatedRouter::default());
        let (handle, _task) = start(source, router.clone());

        let first = handle.request_route(None, None);
        let second = handle.request_route(None, None);
        for _ in 0..200 {
            if router.calls() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(first.await.unwrap(), Err(RouteError::Superseded));

        router.release(1, Ok(path(0.0)));
        let summary = second.await.unwrap().unwrap();
        assert_eq!(summary.path, path(0.0));
        // The first request's task was aborted, so releasing its gate changes nothing.
        router.release(0, Ok(path(0.01)));

        let view = handle.map_view().await.unwrap();
        assert_eq!(view.route, Some(path(0.0)));
        let status = handle.status().await.unwrap();
        assert!(matches!(status.route, RouteState::Displayed { request_id, .. } if request_id == summary.request_id));
    }

    #[tokio::test]
    async fn provider_failure_is_returned_and_leaves_no_overlay() {
        let source = Arc::new(ChannelSource::default());
        let router = Arc::new(GatedRouter::default());
        let (handle, _task) = start(source, router.clone());

        let pending = handle.request_route(
            Some(LatLng { lat: 28.61, lng: 77.2 }),
            Some(LatLng { lat: 28.64, lng: 77.23 }),
        );
        for _ in 0..200 {
            if router.calls() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        router.release(0, Err(RouteError::Timeout));
        assert_eq!(pending.await.unwrap(), Err(RouteError::Timeout));
        assert!(handle.map_view().await.unwrap().route.is_none());
        assert!(matches!(handle.status().await.unwrap().route, RouteState::Failed { .. }));
    }

    #[tokio::test]
    async fn a_single_endpoint_is_rejected() {
        let source = Arc::new(ChannelSource::default());
        let router = Arc::new(GatedRouter::default());
        let (handle, _task) = start(source, router.clone());

        let result = handle
            .show_route(Some(LatLng { lat: 28.61, lng: 77.2 }), None)
            .await;
        assert!(matches!(result, Err(RouteError::InvalidEndpoints(_))));
        assert_eq!(router.calls(), 0);
    }

    #[tokio::test]
    async fn shutdown_clears_everything_and_closes_the_handle() {
        let source = Arc::new(ChannelSource::default());
        let router = Arc::new(GatedRouter::default());
        let (handle, task) = start(source.clone(), router);

        handle.subscribe(Category::Report).await.unwrap();
        wait_for(&handle, |s| s.categories[&Category::Report].stream.state == StreamState::Syncing).await;
        source.push(Category::Report, json!([{"id": "r1", "lat": 28.4, "lng": 77.0, "title": "Spill"}]));
        wait_for(&handle, |s| s.categories[&Category::Report].rendered == 1).await;

        assert_eq!(handle.shutdown().await.unwrap(), 1);
        task.await.unwrap();
        assert!(handle.status().await.is_err());
        assert_eq!(
            handle.show_route(None, None).await,
            Err(RouteError::SessionClosed)
        );
    }
}
