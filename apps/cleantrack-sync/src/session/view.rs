use crate::model::{Attributes, Category, LatLng, MapViewport};
use crate::popup::{render_popup, PopupContent};
use crate::projector::MapProjector;
use crate::route::RouteOverlay;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapMarker {
    pub category: Category,
    pub id: String,
    pub position: LatLng,
    pub popup: PopupContent,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapView {
    pub viewport: MapViewport,
    pub markers: Vec<MapMarker>,
    pub route: Option<Vec<LatLng>>,
}

impl MapView {
    pub(super) fn build(projector: &MapProjector, route: &RouteOverlay, viewport: MapViewport) -> Self {
        let mut markers = Vec::new();
        for category in Category::ALL {
            let mut layer: Vec<MapMarker> = projector
                .rendered(category)
                .map(|(id, marker)| MapMarker {
                    category,
                    id: id.clone(),
                    position: marker.position,
                    popup: render_popup(category, id, &marker.attributes),
                    attributes: marker.attributes.clone(),
                })
                .collect();
            layer.sort_by(|a, b| a.id.cmp(&b.id));
            markers.extend(layer);
        }
        Self {
            viewport,
            markers,
            route: route.displayed_path().map(<[LatLng]>::to_vec),
        }
    }

    pub fn marker_count(&self, category: Category) -> usize {
        self.markers
            .iter()
            .filter(|marker| marker.category == category)
            .count()
    }

    /// GeoJSON FeatureCollection. Coordinates are `[lng, lat]`; the viewport rides along as a
    /// foreign member.
    pub fn to_geojson(&self) -> JsonValue {
        let mut features: Vec<JsonValue> = self
            .markers
            .iter()
            .map(|marker| {
                json!({
                    "type": "Feature",
                    "id": format!("{}/{}", marker.category.collection(), marker.id),
                    "geometry": {
                        "type": "Point",
                        "coordinates": [marker.position.lng, marker.position.lat],
                    },
                    "properties": {
                        "category": marker.category,
                        "id": marker.id,
                        "popup": marker.popup,
                        "attributes": marker.attributes,
                    },
                })
            })
            .collect();

        if let Some(path) = &self.route {
            let coordinates: Vec<[f64; 2]> = path.iter().map(|point| [point.lng, point.lat]).collect();
            features.push(json!({
                "type": "Feature",
                "id": "route",
                "geometry": {"type": "LineString", "coordinates": coordinates},
                "properties": {"kind": "route", "points": path.len()},
            }));
        }

        json!({
            "type": "FeatureCollection",
            "viewport": self.viewport,
            "features": features,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{Category, LatLng, MapViewport};
    use crate::session::SyncSession;
    use crate::surface::MemorySurface;
    use crate::visibility::VisibilityFilter;
    use serde_json::json;

    #[test]
    fn geojson_lists_markers_and_route_in_lng_lat_order() {
        let mut session = SyncSession::new(
            MemorySurface::new(),
            VisibilityFilter::default(),
            MapViewport::default(),
        );
        session.begin_subscription(Category::Plant, 1);
        session.apply_snapshot(
            Category::Plant,
            &[json!({"id": "p2", "lat": 28.5, "lng": 77.1, "city": "Gurgaon"}),
              json!({"id": "p1", "lat": 28.4, "lng": 77.0, "city": "Delhi"})],
        );
        let ticket = session.begin_route(LatLng { lat: 28.6, lng: 77.2 }, LatLng { lat: 28.62, lng: 77.22 });
        session.complete_route(
            ticket.request_id,
            Ok(vec![LatLng { lat: 28.6, lng: 77.2 }, LatLng { lat: 28.62, lng: 77.22 }]),
        );

        let view = session.map_view();
        assert_eq!(view.marker_count(Category::Plant), 2);
        assert_eq!(view.markers[0].id, "p1");

        let geojson = view.to_geojson();
        assert_eq!(geojson["type"], "FeatureCollection");
        assert_eq!(geojson["viewport"]["zoom"], 12.0);
        let features = geojson["features"].as_array().unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[0]["geometry"]["coordinates"], json!([77.0, 28.4]));
        assert_eq!(features[0]["properties"]["popup"]["title"], "Plant p1");
        assert_eq!(features[2]["geometry"]["type"], "LineString");
        assert_eq!(features[2]["geometry"]["coordinates"][1], json!([77.22, 28.62]));
    }

    #[test]
    fn hidden_layers_are_not_in_the_view() {
        let mut session = SyncSession::new(
            MemorySurface::new(),
            VisibilityFilter::default(),
            MapViewport::default(),
        );
        session.begin_subscription(Category::Bin, 1);
        session.apply_snapshot(Category::Bin, &[json!({"id": "b1", "lat": 28.4, "lng": 77.0})]);
        session.set_visible(Category::Bin, false);
        let view = session.map_view();
        assert!(view.markers.is_empty());
        assert!(view.route.is_none());
    }
}
