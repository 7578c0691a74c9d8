//! Conversion between plain JSON and Firestore's typed value format.
//!
//! Firestore wraps every value in a single-key object naming its type:
//! `{"stringValue": "x"}`, `{"integerValue": "42"}`, `{"mapValue": {"fields": {..}}}`.

use serde_json::{json, Map, Number, Value};

use crate::error::{Result, SyncError};

/// Encode a JSON object as a Firestore `fields` map.
pub fn encode_fields(data: &Value) -> Result<Value> {
  match data {
    Value::Object(map) => encode_map(map).map(Value::Object),
    other => Err(SyncError::validation(format!(
      "document data must be an object, got {}",
      other
    ))),
  }
}

fn encode_map(map: &Map<String, Value>) -> Result<Map<String, Value>> {
  map
    .iter()
    .map(|(k, v)| encode_value(v).map(|v| (k.clone(), v)))
    .collect()
}

/// Integers must fit the store's signed 64-bit type.
pub fn encode_value(value: &Value) -> Result<Value> {
  Ok(match value {
    Value::Null => json!({ "nullValue": null }),
    Value::Bool(b) => json!({ "booleanValue": b }),
    Value::Number(n) => match n.as_i64() {
      // 64-bit integers travel as strings
      Some(i) => json!({ "integerValue": i.to_string() }),
      None if n.is_u64() => {
        return Err(SyncError::validation(format!(
          "integer {} is out of range for a 64-bit signed value",
          n
        )))
      }
      None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
    },
    Value::String(s) => json!({ "stringValue": s }),
    Value::Array(items) => json!({
      "arrayValue": { "values": items.iter().map(encode_value).collect::<Result<Vec<_>>>()? }
    }),
    Value::Object(map) => json!({
      "mapValue": { "fields": encode_map(map)? }
    }),
  })
}

/// Decode a Firestore `fields` map into a plain JSON object.
pub fn decode_fields(fields: &Value) -> Result<Value> {
  match fields {
    Value::Null => Ok(Value::Object(Map::new())),
    Value::Object(map) => map
      .iter()
      .map(|(k, v)| decode_value(v).map(|v| (k.clone(), v)))
      .collect::<Result<Map<_, _>>>()
      .map(Value::Object),
    other => Err(SyncError::Decode(format!("expected fields map, got {}", other))),
  }
}

pub fn decode_value(value: &Value) -> Result<Value> {
  let Some((kind, inner)) = value.as_object().and_then(|m| m.iter().next()) else {
    return Err(SyncError::Decode(format!("expected typed value, got {}", value)));
  };

  match kind.as_str() {
    "nullValue" => Ok(Value::Null),
    "booleanValue" => Ok(Value::Bool(inner.as_bool().unwrap_or_default())),
    "integerValue" => {
      let parsed = match inner {
        Value::String(s) => s.parse::<i64>().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
      };
      parsed
        .map(|i| Value::Number(i.into()))
        .ok_or_else(|| SyncError::Decode(format!("bad integerValue {}", inner)))
    }
    "doubleValue" => {
      let parsed = match inner {
        Value::Number(n) => n.as_f64(),
        // NaN and infinities arrive as strings
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
      };
      Ok(
        parsed
          .and_then(Number::from_f64)
          .map(Value::Number)
          .unwrap_or(Value::Null),
      )
    }
    "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => Ok(inner.clone()),
    "geoPointValue" => Ok(json!({
      "latitude": inner.get("latitude").cloned().unwrap_or(Value::Null),
      "longitude": inner.get("longitude").cloned().unwrap_or(Value::Null),
    })),
    "arrayValue" => inner
      .get("values")
      .and_then(Value::as_array)
      .map(|items| items.iter().map(decode_value).collect::<Result<Vec<_>>>())
      .unwrap_or_else(|| Ok(Vec::new()))
      .map(Value::Array),
    "mapValue" => decode_fields(inner.get("fields").unwrap_or(&Value::Null)),
    other => Err(SyncError::Decode(format!("unsupported value type {}", other))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;

  #[test]
  fn test_decode_nested_document() {
    let fields = json!({
      "title": {"stringValue": "Essay"},
      "maxScore": {"integerValue": "100"},
      "weight": {"doubleValue": 0.5},
      "isGroup": {"booleanValue": false},
      "dueDate": {"timestampValue": "2026-11-01T09:00:00Z"},
      "tags": {"arrayValue": {"values": [{"stringValue": "writing"}]}},
      "empty": {"arrayValue": {}},
      "rubric": {"mapValue": {"fields": {"clarity": {"integerValue": "5"}}}},
      "deleted": {"nullValue": null}
    });

    let decoded = decode_fields(&fields).unwrap();
    assert_eq!(
      decoded,
      json!({
        "title": "Essay",
        "maxScore": 100,
        "weight": 0.5,
        "isGroup": false,
        "dueDate": "2026-11-01T09:00:00Z",
        "tags": ["writing"],
        "empty": [],
        "rubric": {"clarity": 5},
        "deleted": null
      })
    );
  }

  #[test]
  fn test_encode_uses_string_integers() {
    let encoded = encode_fields(&json!({"grade": 9, "ratio": 0.25, "ids": ["a"]})).unwrap();
    assert_eq!(encoded["grade"], json!({"integerValue": "9"}));
    assert_eq!(encoded["ratio"], json!({"doubleValue": 0.25}));
    assert_eq!(
      encoded["ids"],
      json!({"arrayValue": {"values": [{"stringValue": "a"}]}})
    );
  }

  #[test]
  fn test_rejects_untyped_values() {
    assert!(matches!(
      decode_value(&json!("plain")),
      Err(SyncError::Decode(_))
    ));
    assert!(encode_fields(&json!([1, 2])).is_err());
  }

  #[test]
  fn test_unsigned_overflow_is_rejected() {
    let too_big = encode_value(&json!(u64::MAX)).unwrap_err();
    assert_eq!(too_big.kind(), ErrorKind::Validation);

    let nested = encode_fields(&json!({"scores": [1, {"total": u64::MAX}]}));
    assert!(matches!(nested, Err(SyncError::Validation(_))));

    assert_eq!(
      encode_value(&json!(i64::MAX as u64)).unwrap(),
      json!({"integerValue": i64::MAX.to_string()})
    );
  }
}
