//! Shared serialization utilities for backend payloads.

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value;

use crate::{prelude::*, Error};

/// Deserialize an identifier that the backend may send either as a string or
/// as a number.
pub fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Num(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Str(s) => s,
        RawId::Num(n) => n.to_string(),
    })
}

/// Same as [`deserialize_id`] but for fields that may be absent or null.
pub fn deserialize_opt_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

/// Keys under which list endpoints may wrap their payload.
const ENVELOPE_KEYS: &[&str] = &["data", "orders", "messages", "items", "users"];

/// Field names entity types accept for their identifier.
const ID_KEYS: &[&str] = &["id", "_id", "orderId", "messageId"];

/// Decode a list response.
///
/// The backend's list endpoints return either a JSON array of entities or an
/// object mapping identifier to entity. In the mapping form the key is the
/// identifier and is injected into the payload when it carries no identifier
/// field of its own.
pub fn entities_from_value<E: DeserializeOwned>(value: Value) -> Result<Vec<E>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(|e| Error::json_parse(e.to_string())))
            .collect(),
        Value::Object(map) => {
            // Envelopes such as {"orders": [...]} or {"data": {...}}
            if map.len() == 1 {
                if let Some((key, inner)) = map.iter().next() {
                    let is_envelope = inner.is_array()
                        || (ENVELOPE_KEYS.contains(&key.as_str()) && inner.is_object());
                    if is_envelope {
                        let inner = inner.clone();
                        return entities_from_value(inner);
                    }
                }
            }
            map.into_iter()
                .map(|(key, mut item)| {
                    if let Value::Object(fields) = &mut item {
                        if !ID_KEYS.iter().any(|k| fields.contains_key(*k)) {
                            fields.insert("id".to_string(), Value::String(key));
                        }
                    }
                    serde_json::from_value(item).map_err(|e| Error::json_parse(e.to_string()))
                })
                .collect()
        }
        other => Err(Error::json_parse(format!(
            "expected list or map of entities, got {}",
            type_name(&other)
        ))),
    }
}

/// Decode a single-entity response, accepting `{"<key>": {...}}` as well as
/// the bare object.
pub fn entity_from_value<E: DeserializeOwned>(value: Value, key: &str) -> Result<E> {
    let value = match value {
        Value::Object(mut map) if map.get(key).is_some_and(Value::is_object) => {
            map.remove(key).unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(value).map_err(|e| Error::json_parse(e.to_string()))
}

/// Short name of a JSON value's type, for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Item {
        #[serde(deserialize_with = "deserialize_id")]
        id: String,
        name: String,
    }

    #[test]
    fn test_list_form() {
        let items: Vec<Item> =
            entities_from_value(json!([{"id": 1, "name": "a"}, {"id": "b", "name": "b"}])).unwrap();
        assert_eq!(items[0].id, "1");
        assert_eq!(items[1].id, "b");
    }

    #[test]
    fn test_map_form_injects_key() {
        let mut items: Vec<Item> =
            entities_from_value(json!({"A": {"name": "a"}, "C": {"name": "c"}})).unwrap();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "A");
        assert_eq!(items[1].id, "C");
    }

    #[test]
    fn test_map_form_keeps_aliased_id() {
        let orders: Vec<crate::types::Order> =
            entities_from_value(json!({"A": {"orderId": "A-1", "status": "Delivered"}})).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, "A-1");

        let messages: Vec<crate::types::ChatMessage> = entities_from_value(json!({
            "k": {"messageId": "m-1", "chatId": "c1", "body": "hi"}
        }))
        .unwrap();
        assert_eq!(messages[0].id, "m-1");
    }

    #[test]
    fn test_envelope_form() {
        let items: Vec<Item> =
            entities_from_value(json!({"orders": [{"id": "x", "name": "x"}]})).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_single_entity_envelope() {
        let item: Item = entity_from_value(json!({"order": {"id": 5, "name": "a"}}), "order").unwrap();
        assert_eq!(item.id, "5");
        let item: Item = entity_from_value(json!({"id": "b", "name": "b"}), "order").unwrap();
        assert_eq!(item.id, "b");
    }

    #[test]
    fn test_rejects_scalar() {
        assert!(entities_from_value::<Item>(json!(3)).is_err());
    }
}
