use crate::error::RouteError;
use crate::model::LatLng;
use crate::surface::{MapSurface, PolylineHandle};
use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;

/// External path finder. Implementations must not touch the map; the overlay does that.
pub trait RoutingProvider: Send + Sync + 'static {
    fn route(&self, start: LatLng, end: LatLng) -> BoxFuture<'static, Result<Vec<LatLng>, RouteError>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RouteState {
    Idle,
    Requesting {
        request_id: u64,
        start: LatLng,
        end: LatLng,
    },
    Displayed {
        request_id: u64,
        start: LatLng,
        end: LatLng,
        points: usize,
    },
    Failed {
        request_id: u64,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteTicket {
    pub request_id: u64,
    pub start: LatLng,
    pub end: LatLng,
    /// In-flight request this one replaced; its response must be dropped.
    pub superseded: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteCompletion {
    Displayed(Vec<LatLng>),
    Failed(RouteError),
    Discarded,
}

#[derive(Debug)]
struct DisplayedRoute {
    handle: PolylineHandle,
    path: Vec<LatLng>,
}

/// At most one route polyline on the map, driven by `Idle → Requesting → {Displayed | Failed}`.
#[derive(Debug)]
pub struct RouteOverlay {
    state: RouteState,
    displayed: Option<DisplayedRoute>,
    last_request_id: u64,
}

impl Default for RouteOverlay {
    fn default() -> Self {
        Self {
            state: RouteState::Idle,
            displayed: None,
            last_request_id: 0,
        }
    }
}

impl RouteOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &RouteState {
        &self.state
    }

    pub fn displayed_path(&self) -> Option<&[LatLng]> {
        self.displayed.as_ref().map(|route| route.path.as_slice())
    }

    pub fn begin<S: MapSurface + ?Sized>(&mut self, start: LatLng, end: LatLng, surface: &mut S) -> RouteTicket {
        let superseded = match self.state {
            RouteState::Requesting { request_id, .. } => Some(request_id),
            _ => None,
        };
        self.remove_displayed(surface);

        self.last_request_id = self.last_request_id.saturating_add(1);
        let request_id = self.last_request_id;
        self.state = RouteState::Requesting {
            request_id,
            start,
            end,
        };
        if let Some(previous) = superseded {
            tracing::debug!(request_id, previous, "route request superseded an in-flight request");
        }
        RouteTicket {
            request_id,
            start,
            end,
            superseded,
        }
    }

    /// Applies a provider response. Responses for anything but the current request are dropped.
    pub fn complete<S: MapSurface + ?Sized>(
        &mut self,
        request_id: u64,
        result: Result<Vec<LatLng>, RouteError>,
        surface: &mut S,
    ) -> RouteCompletion {
        let (start, end) = match self.state {
            RouteState::Requesting {
                request_id: current,
                start,
                end,
            } if current == request_id => (start, end),
            _ => {
                tracing::debug!(request_id, "discarding stale route response");
                return RouteCompletion::Discarded;
            }
        };

        match result.and_then(validate_path) {
            Ok(path) => {
                self.remove_displayed(surface);
                let handle = surface.add_polyline(path.clone());
                self.state = RouteState::Displayed {
                    request_id,
                    start,
                    end,
                    points: path.len(),
                };
                self.displayed = Some(DisplayedRoute {
                    handle,
                    path: path.clone(),
                });
                tracing::info!(request_id, points = path.len(), "route overlay displayed");
                RouteCompletion::Displayed(path)
            }
            Err(err) => {
                self.remove_displayed(surface);
                self.state = RouteState::Failed {
                    request_id,
                    error: err.to_string(),
                };
                tracing::warn!(request_id, error=%err, "route request failed");
                RouteCompletion::Failed(err)
            }
        }
    }

    pub fn cancel<S: MapSurface + ?Sized>(&mut self, surface: &mut S) -> Option<u64> {
        let pending = match self.state {
            RouteState::Requesting { request_id, .. } => Some(request_id),
            _ => None,
        };
        self.remove_displayed(surface);
        self.state = RouteState::Idle;
        pending
    }

    fn remove_displayed<S: MapSurface + ?Sized>(&mut self, surface: &mut S) {
        if let Some(route) = self.displayed.take() {
            if !surface.remove_polyline(route.handle) {
                tracing::error!(handle = route.handle.raw(), "route polyline was already gone from the surface");
            }
        }
    }
}

fn validate_path(path: Vec<LatLng>) -> Result<Vec<LatLng>, RouteError> {
    if path.len() < 2 {
        return Err(RouteError::NoRoute(format!(
            "provider returned {} points",
            path.len()
        )));
    }
    if path.iter().any(|point| !point.is_valid()) {
        return Err(RouteError::Provider(
            "provider returned invalid coordinates".to_string(),
        ));
    }
    Ok(path)
}

/// Two points within `spread` degrees north-east of `origin`, as the dashboard demo does.
pub fn random_nearby_endpoints<R: Rng + ?Sized>(rng: &mut R, origin: LatLng, spread: f64) -> (LatLng, LatLng) {
    let spread = if spread.is_finite() && spread > 0.0 { spread } else { 0.05 };
    let mut point = || LatLng {
        lat: (origin.lat + rng.gen::<f64>() * spread).clamp(-90.0, 90.0),
        lng: (origin.lng + rng.gen::<f64>() * spread).clamp(-180.0, 180.0),
    };
    let start = point();
    let end = point();
    (start, end)
}
