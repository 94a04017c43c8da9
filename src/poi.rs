//! Points of interest.
//!
//! POIs are named circular regions monitored by the host's geofencing
//! service. The engine only keeps the registry and forwards region
//! transitions for known names to the application.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::ValidationError;

/// Radius in meters used when a POI definition leaves it blank.
pub const DEFAULT_POI_RADIUS: f32 = 50.0;

/// A named circular region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Meters.
    pub radius: f32,
    /// Beacon UUID deployed inside the region, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beacon_uuid: Option<String>,
}

impl Poi {
    /// Parses a JSON array of POI definitions.
    ///
    /// Numeric fields may be given as numbers or as numeric strings; an
    /// empty or missing radius falls back to [`DEFAULT_POI_RADIUS`].
    ///
    /// ```
    /// use proxmesh::Poi;
    ///
    /// let pois = Poi::parse_list(
    ///     r#"[{"name": "hall", "latitude": "45.47", "longitude": "9.23", "radius": ""}]"#,
    /// ).unwrap();
    /// assert_eq!(pois[0].radius, 50.0);
    /// ```
    pub fn parse_list(json: &str) -> Result<Vec<Self>, ValidationError> {
        let value: JsonValue = serde_json::from_str(json).map_err(|e| ValidationError::InvalidPoi {
            reason: e.to_string(),
        })?;
        let JsonValue::Array(items) = value else {
            return Err(ValidationError::InvalidPoi {
                reason: "expected a JSON array".to_string(),
            });
        };
        items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                let obj = item.as_object().ok_or_else(|| ValidationError::InvalidPoi {
                    reason: format!("entry {idx} is not an object"),
                })?;
                Self::from_object(obj)
            })
            .collect()
    }

    fn from_object(obj: &Map<String, JsonValue>) -> Result<Self, ValidationError> {
        let name = obj
            .get("name")
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ValidationError::MissingField {
                field: "name".to_string(),
            })?
            .to_string();
        let latitude = required_number(obj, "latitude")?;
        let longitude = required_number(obj, "longitude")?;
        #[allow(clippy::cast_possible_truncation)]
        let radius = optional_number(obj, "radius")?.map_or(DEFAULT_POI_RADIUS, |r| r as f32);
        let beacon_uuid = obj
            .get("beacon_uuid")
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        Ok(Self {
            name,
            latitude,
            longitude,
            radius,
            beacon_uuid,
        })
    }
}

fn required_number(obj: &Map<String, JsonValue>, field: &str) -> Result<f64, ValidationError> {
    optional_number(obj, field)?.ok_or_else(|| ValidationError::MissingField {
        field: field.to_string(),
    })
}

fn optional_number(obj: &Map<String, JsonValue>, field: &str) -> Result<Option<f64>, ValidationError> {
    let invalid = || ValidationError::InvalidPoi {
        reason: format!("field '{field}' is not numeric"),
    };
    match obj.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => n.as_f64().map(Some).ok_or_else(invalid),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}
