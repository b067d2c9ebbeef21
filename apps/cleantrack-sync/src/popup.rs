use crate::model::{Attributes, Category};
use serde::Serialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopupField {
    pub label: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopupContent {
    pub title: String,
    pub fields: Vec<PopupField>,
}

impl PopupContent {
    pub fn field(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.label == label)
            .map(|field| field.value.as_str())
    }
}

pub fn render_popup(category: Category, id: &str, attributes: &Attributes) -> PopupContent {
    match category {
        Category::Bin => {
            let bin_id = text_or(attributes, &["binId"], "-");
            PopupContent {
                title: format!("Bin {}", if bin_id == "-" { id } else { bin_id.as_str() }),
                fields: vec![
                    field("Bin ID", bin_id.clone()),
                    field("Fill", format!("{}%", text_or(attributes, &["filledPercentage"], "0"))),
                    field("Area", format!("{} km²", text_or(attributes, &["coveredArea"], "-"))),
                ],
            }
        }
        Category::Plant => {
            let plant_id = text_or(attributes, &["plantId"], "-");
            PopupContent {
                title: format!("Plant {}", if plant_id == "-" { id } else { plant_id.as_str() }),
                fields: vec![
                    field("Plant", plant_id.clone()),
                    field("City", text_or(attributes, &["city"], "-")),
                    field(
                        "Trucks",
                        format!(
                            "{}/{}",
                            text_or(attributes, &["trucksAvailable"], "0"),
                            text_or(attributes, &["numTrucks"], "0")
                        ),
                    ),
                    field("Bins", text_or(attributes, &["numBins"], "0")),
                ],
            }
        }
        Category::Report => {
            let title = text_or(attributes, &["title"], "Issue");
            PopupContent {
                title: format!("Report: {title}"),
                fields: vec![
                    field("Report", title.clone()),
                    field("Status", text_or(attributes, &["status"], "Open")),
                    field("Details", text_or(attributes, &["description", "details"], "")),
                ],
            }
        }
    }
}

fn field(label: &'static str, value: String) -> PopupField {
    PopupField { label, value }
}

fn text_or(attributes: &Attributes, keys: &[&str], default: &str) -> String {
    keys.iter()
        .filter_map(|key| attributes.get(*key))
        .find_map(display_value)
        .unwrap_or_else(|| default.to_string())
}

fn display_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null | JsonValue::Bool(false) => None,
        JsonValue::Bool(true) => Some("true".to_string()),
        JsonValue::String(raw) if raw.trim().is_empty() => None,
        JsonValue::String(raw) => Some(raw.trim().to_string()),
        JsonValue::Number(num) => {
            if num.as_f64() == Some(0.0) {
                None
            } else {
                Some(num.to_string())
            }
        }
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: JsonValue) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn bin_popup_uses_dashboard_defaults() {
        let popup = render_popup(Category::Bin, "doc-1", &attrs(json!({})));
        assert_eq!(popup.title, "Bin doc-1");
        assert_eq!(popup.field("Bin ID"), Some("-"));
        assert_eq!(popup.field("Fill"), Some("0%"));
        assert_eq!(popup.field("Area"), Some("- km²"));
    }

    #[test]
    fn bin_popup_shows_fill_and_area() {
        let popup = render_popup(
            Category::Bin,
            "doc-1",
            &attrs(json!({"binId": "BIN-12", "filledPercentage": 80, "coveredArea": 1.5})),
        );
        assert_eq!(popup.title, "Bin BIN-12");
        assert_eq!(popup.field("Fill"), Some("80%"));
        assert_eq!(popup.field("Area"), Some("1.5 km²"));
    }

    #[test]
    fn plant_popup_formats_truck_availability() {
        let popup = render_popup(
            Category::Plant,
            "p1",
            &attrs(json!({"plantId": "PL-1", "city": "Delhi", "trucksAvailable": 3, "numTrucks": 5})),
        );
        assert_eq!(popup.field("Trucks"), Some("3/5"));
        assert_eq!(popup.field("Bins"), Some("0"));
        assert_eq!(popup.field("City"), Some("Delhi"));
    }

    #[test]
    fn report_popup_falls_back_to_citizen_details() {
        let popup = render_popup(
            Category::Report,
            "r1",
            &attrs(json!({"status": "", "details": "Overflowing bin near gate"})),
        );
        assert_eq!(popup.field("Report"), Some("Issue"));
        assert_eq!(popup.field("Status"), Some("Open"));
        assert_eq!(popup.field("Details"), Some("Overflowing bin near gate"));
    }
}
