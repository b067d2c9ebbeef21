use crate::error::RouteError;
use crate::model::LatLng;
use crate::route::RoutingProvider;
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone)]
pub struct OsrmRoutingProvider {
    base_url: String,
    profile: String,
    http: reqwest::Client,
}

impl OsrmRoutingProvider {
    pub fn new(base_url: &str, profile: &str, timeout: Duration) -> Result<Self, RouteError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RouteError::Provider(format!("failed to build http client: {err}")))?;
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            profile: profile.trim().to_string(),
            http,
        })
    }

    pub fn route_url(&self, start: LatLng, end: LatLng) -> String {
        // OSRM takes lng,lat pairs.
        format!(
            "{}/route/v1/{}/{},{};{},{}?overview=full&geometries=geojson",
            self.base_url, self.profile, start.lng, start.lat, end.lng, end.lat
        )
    }
}

impl RoutingProvider for OsrmRoutingProvider {
    fn route(&self, start: LatLng, end: LatLng) -> BoxFuture<'static, Result<Vec<LatLng>, RouteError>> {
        let http = self.http.clone();
        let url = self.route_url(start, end);
        async move {
            tracing::debug!(url = %url, "requesting route");
            let resp = http.get(&url).send().await.map_err(request_error)?;
            let status = resp.status();
            let body = resp.bytes().await.map_err(request_error)?;
            // OSRM answers 400 with a JSON body for NoRoute/NoSegment, so parse before
            // looking at the status.
            match parse_osrm_response(&body) {
                Err(RouteError::Provider(_)) if !status.is_success() => Err(RouteError::Provider(
                    format!("routing provider returned {status}"),
                )),
                other => other,
            }
        }
        .boxed()
    }
}

fn request_error(err: reqwest::Error) -> RouteError {
    if err.is_timeout() {
        RouteError::Timeout
    } else {
        RouteError::Provider(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: OsrmGeometry,
}

#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    coordinates: Vec<[f64; 2]>,
}

pub fn parse_osrm_response(body: &[u8]) -> Result<Vec<LatLng>, RouteError> {
    let parsed: OsrmResponse = serde_json::from_slice(body)
        .map_err(|err| RouteError::Provider(format!("unreadable routing response: {err}")))?;
    if parsed.code != "Ok" {
        let message = parsed.message.unwrap_or_else(|| parsed.code.clone());
        return Err(RouteError::NoRoute(message));
    }
    let Some(route) = parsed.routes.into_iter().next() else {
        return Err(RouteError::NoRoute("response contained no routes".to_string()));
    };
    route
        .geometry
        .coordinates
        .into_iter()
        .map(|[lng, lat]| {
            LatLng::new(lat, lng).ok_or_else(|| {
                RouteError::Provider(format!("route point {lat},{lng} is out of range"))
            })
        })
        .collect()
}
