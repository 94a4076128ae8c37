use mongodb::bson::{self, Bson, Document};
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::error::AppError;

/// Renders a stored document as plain JSON: ids as hex strings, dates as RFC 3339.
pub fn to_json(doc: Document) -> Value {
    let mut map = Map::with_capacity(doc.len());
    for (key, value) in doc {
        map.insert(key, bson_to_json(value));
    }
    Value::Object(map)
}

/// Same as [`to_json`] for any serializable model.
pub fn present<T: Serialize>(model: &T) -> Result<Value, AppError> {
    Ok(to_json(bson::to_document(model)?))
}

fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::String(s) => Value::String(s),
        Bson::Int32(n) => Value::from(n),
        Bson::Int64(n) => Value::from(n),
        Bson::Double(n) => Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
        Bson::ObjectId(id) => Value::String(id.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or_else(|_| Value::from(dt.timestamp_millis())),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(doc) => to_json(doc),
        other => other.into_relaxed_extjson(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId, DateTime};
    use serde_json::json;

    #[test]
    fn ids_and_dates_become_strings() {
        let id = ObjectId::new();
        let doc = doc! {
            "_id": id,
            "createdAt": DateTime::from_millis(1_609_459_200_000),
            "guides": [id],
            "price": 497.0,
            "duration": 5,
            "startLocation": { "type": "Point", "coordinates": [-80.18, 25.77] },
        };

        assert_eq!(
            to_json(doc),
            json!({
                "_id": id.to_hex(),
                "createdAt": "2021-01-01T00:00:00Z",
                "guides": [id.to_hex()],
                "price": 497.0,
                "duration": 5,
                "startLocation": { "type": "Point", "coordinates": [-80.18, 25.77] },
            })
        );
    }
}
