use crate::error::{RecordError, SourceError};
use crate::model::{Attributes, Category, GeoEntity, LatLng};
use serde::Deserialize;
use serde_json::Value as JsonValue;

pub type RecordBatch = Vec<JsonValue>;

const RESERVED_KEYS: [&str; 4] = ["id", "lat", "lng", "location"];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotEnvelope {
    Records(Vec<JsonValue>),
    Wrapped { records: Vec<JsonValue> },
}

/// Decodes a snapshot payload. Accepts a bare JSON array of records or `{"records": [...]}`.
pub fn decode_snapshot(payload: &mut [u8]) -> Result<RecordBatch, SourceError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(SourceError::Decode("empty payload".to_string()));
    }
    let envelope: SnapshotEnvelope =
        simd_json::serde::from_slice(payload).map_err(|err| SourceError::Decode(err.to_string()))?;
    Ok(match envelope {
        SnapshotEnvelope::Records(records) => records,
        SnapshotEnvelope::Wrapped { records } => records,
    })
}

pub fn record_id(category: Category, record: &JsonValue) -> Option<String> {
    let object = record.as_object()?;
    object
        .get("id")
        .and_then(id_string)
        .or_else(|| object.get(category.id_field()).and_then(id_string))
}

pub fn entity_from_record(category: Category, record: &JsonValue) -> Result<GeoEntity, RecordError> {
    let object = record.as_object().ok_or(RecordError::NotAnObject)?;
    let id = record_id(category, record).ok_or(RecordError::MissingId)?;
    let position = record_position(object)?;

    let attributes: Attributes = object
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(GeoEntity {
        id,
        category,
        position,
        attributes,
    })
}

fn id_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

fn record_position(object: &Attributes) -> Result<LatLng, RecordError> {
    let nested = object.get("location").and_then(JsonValue::as_object);

    let lat = object
        .get("lat")
        .or_else(|| nested.and_then(|loc| loc.get("lat").or_else(|| loc.get("latitude"))));
    let lng = object
        .get("lng")
        .or_else(|| nested.and_then(|loc| loc.get("lng").or_else(|| loc.get("longitude"))));

    let (Some(lat), Some(lng)) = (lat, lng) else {
        return Err(RecordError::MissingCoordinates);
    };
    if lat.is_null() || lng.is_null() {
        return Err(RecordError::MissingCoordinates);
    }

    let lat = coordinate("lat", lat)?;
    let lng = coordinate("lng", lng)?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err(RecordError::OutOfRange { field: "lat", value: lat });
    }
    if !(-180.0..=180.0).contains(&lng) {
        return Err(RecordError::OutOfRange { field: "lng", value: lng });
    }
    LatLng::new(lat, lng).ok_or(RecordError::MissingCoordinates)
}

fn coordinate(field: &'static str, value: &JsonValue) -> Result<f64, RecordError> {
    let parsed = match value {
        JsonValue::Number(num) => num.as_f64(),
        JsonValue::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| RecordError::InvalidCoordinate {
            field,
            raw: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_bare_and_wrapped_snapshots() {
        let mut bare = br#"[{"id":"b1","lat":28.4,"lng":77.0}]"#.to_vec();
        assert_eq!(decode_snapshot(&mut bare).unwrap().len(), 1);

        let mut wrapped = br#"{"records":[{"id":"p1"},{"id":"p2"}]}"#.to_vec();
        assert_eq!(decode_snapshot(&mut wrapped).unwrap().len(), 2);

        let mut empty_list = b"[]".to_vec();
        assert!(decode_snapshot(&mut empty_list).unwrap().is_empty());
    }

    #[test]
    fn rejects_garbage_payloads() {
        let mut garbage = b"not json".to_vec();
        assert!(matches!(
            decode_snapshot(&mut garbage),
            Err(SourceError::Decode(_))
        ));
        let mut blank = b"  ".to_vec();
        assert!(decode_snapshot(&mut blank).is_err());
    }

    #[test]
    fn non_numeric_latitude_is_rejected() {
        let err = entity_from_record(Category::Bin, &json!({"id": "b2", "lat": "x", "lng": 77.0}))
            .unwrap_err();
        assert!(matches!(err, RecordError::InvalidCoordinate { field: "lat", .. }));
    }

    #[test]
    fn missing_longitude_is_positionless() {
        let err = entity_from_record(Category::Bin, &json!({"id": "b2", "lat": 28.4})).unwrap_err();
        assert!(err.is_positionless());
        let err = entity_from_record(
            Category::Report,
            &json!({"id": "r1", "location": null, "title": "Overflow"}),
        )
        .unwrap_err();
        assert!(err.is_positionless());
    }

    #[test]
    fn reads_nested_location_and_numeric_strings() {
        let entity = entity_from_record(
            Category::Plant,
            &json!({
                "plantId": "PL-7",
                "location": {"lat": "28.47", "lng": " 77.05 "},
                "city": "Gurugram",
                "numTrucks": 6
            }),
        )
        .unwrap();
        assert_eq!(entity.id, "PL-7");
        assert_eq!(entity.position, LatLng { lat: 28.47, lng: 77.05 });
        assert_eq!(entity.attributes.get("city"), Some(&json!("Gurugram")));
        assert!(!entity.attributes.contains_key("location"));
        assert_eq!(entity.attributes.get("plantId"), Some(&json!("PL-7")));
    }

    #[test]
    fn reads_geopoint_style_location() {
        let entity = entity_from_record(
            Category::Report,
            &json!({"id": "r9", "location": {"latitude": 28.5, "longitude": 77.1}}),
        )
        .unwrap();
        assert_eq!(entity.position, LatLng { lat: 28.5, lng: 77.1 });
    }

    #[test]
    fn rejects_out_of_range_and_idless_records() {
        let err = entity_from_record(Category::Bin, &json!({"id": "b3", "lat": 128.0, "lng": 7.0}))
            .unwrap_err();
        assert_eq!(err, RecordError::OutOfRange { field: "lat", value: 128.0 });

        let err = entity_from_record(Category::Bin, &json!({"lat": 28.0, "lng": 77.0})).unwrap_err();
        assert_eq!(err, RecordError::MissingId);

        let err = entity_from_record(Category::Bin, &json!(["b4", 28.0, 77.0])).unwrap_err();
        assert_eq!(err, RecordError::NotAnObject);
    }

    #[test]
    fn numeric_ids_are_stringified() {
        let entity =
            entity_from_record(Category::Bin, &json!({"id": 42, "lat": 1.0, "lng": 2.0})).unwrap();
        assert_eq!(entity.id, "42");
    }
}
