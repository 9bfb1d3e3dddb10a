//! Conversion of Firestore typed values into plain JSON.
//!
//! Firestore's REST API wraps every field in a single-key object naming its
//! type (`{"stringValue": "x"}`, `{"integerValue": "42"}`, ...). Records are
//! decoded with serde, so the wrappers are stripped first.

use serde_json::{Map, Value, json};

/// Convert one Firestore value into plain JSON.
///
/// Value kinds this worker does not understand, and malformed values, are
/// kept as their raw JSON so that one odd field never hides a whole document.
/// Typed decoding of the fields a record needs reports the problem instead.
pub fn decode_value(value: &Value) -> Value {
    let Some((kind, inner)) = value.as_object().and_then(|obj| obj.iter().next()) else {
        return value.clone();
    };

    match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" | "stringValue" | "timestampValue" | "referenceValue" | "bytesValue"
        | "geoPointValue" => inner.clone(),
        // int64 is transported as a decimal string
        "integerValue" => match inner {
            Value::String(s) => s
                .parse::<i64>()
                .map(|n| json!(n))
                .unwrap_or_else(|_| inner.clone()),
            _ => inner.clone(),
        },
        // "NaN" / "Infinity" arrive as strings and stay that way
        "doubleValue" => inner.clone(),
        "arrayValue" => match inner.get("values") {
            Some(Value::Array(values)) => Value::Array(values.iter().map(decode_value).collect()),
            _ => Value::Array(Vec::new()),
        },
        "mapValue" => decode_fields(inner.get("fields")),
        other => {
            tracing::debug!(kind = other, "Keeping unsupported Firestore value as raw JSON");
            value.clone()
        }
    }
}

/// Convert a Firestore field map (possibly absent) into a JSON object.
///
/// A field map that is not an object is returned unchanged.
pub fn decode_fields(fields: Option<&Value>) -> Value {
    match fields {
        None => Value::Object(Map::new()),
        Some(Value::Object(obj)) => Value::Object(
            obj.iter()
                .map(|(name, value)| (name.clone(), decode_value(value)))
                .collect(),
        ),
        Some(other) => other.clone(),
    }
}

/// Wrap a string for use in a structured query filter.
pub fn encode_string(value: &str) -> Value {
    json!({ "stringValue": value })
}
