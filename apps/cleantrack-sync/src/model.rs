use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

pub type Attributes = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "bins", alias = "bin")]
    Bin,
    #[serde(rename = "plants", alias = "plant")]
    Plant,
    #[serde(rename = "reports", alias = "report")]
    Report,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Bin, Category::Plant, Category::Report];

    pub fn collection(self) -> &'static str {
        match self {
            Category::Bin => "bins",
            Category::Plant => "plants",
            Category::Report => "reports",
        }
    }

    /// Field holding the dashboard-assigned id when a record has no `id`.
    pub fn id_field(self) -> &'static str {
        match self {
            Category::Bin => "binId",
            Category::Plant => "plantId",
            Category::Report => "reportId",
        }
    }

    /// Accepts collection names, singular names and the dashboard's layer names
    /// (`complaints` is the report layer toggle).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "bins" | "bin" => Some(Category::Bin),
            "plants" | "plant" => Some(Category::Plant),
            "reports" | "report" | "complaints" | "complaint" => Some(Category::Report),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let point = Self { lat, lng };
        point.is_valid().then_some(point)
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoEntity {
    pub id: String,
    pub category: Category,
    pub position: LatLng,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MapViewport {
    pub center: LatLng,
    pub zoom: f64,
}

impl Default for MapViewport {
    fn default() -> Self {
        Self {
            center: LatLng {
                lat: 28.4595,
                lng: 77.0266,
            },
            zoom: 12.0,
        }
    }
}
