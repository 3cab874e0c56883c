//! Per-request data handed to the render bundle and embedded in the page.

use serde::Serialize;
use serde_json::{Map, Value};

/// String-keyed, JSON-serialisable mapping passed to the render entry point.
pub type Payload = Map<String, Value>;

/// Anything that can be flattened into a [`Payload`].
///
/// Data sources return values of many shapes; the pipeline only ever needs the
/// mapping view, so every variant implements this one capability.
pub trait AsPayload: Send + Sync {
    fn as_payload(&self) -> Payload;
}

impl AsPayload for Payload {
    fn as_payload(&self) -> Payload {
        self.clone()
    }
}

/// Objects map to themselves; every other JSON value yields an empty payload.
impl AsPayload for Value {
    fn as_payload(&self) -> Payload {
        match self {
            Value::Object(map) => map.clone(),
            _ => Payload::new(),
        }
    }
}

impl<T: AsPayload> AsPayload for Option<T> {
    fn as_payload(&self) -> Payload {
        self.as_ref().map(AsPayload::as_payload).unwrap_or_default()
    }
}

/// Adapter for typed payload structs.
#[derive(Debug, Clone)]
pub struct Serialized<T>(pub T);

impl<T> AsPayload for Serialized<T>
where
    T: Serialize + Send + Sync,
{
    fn as_payload(&self) -> Payload {
        match serde_json::to_value(&self.0) {
            Ok(value) => value.as_payload(),
            Err(_) => Payload::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Serialize)]
    struct Article {
        title: &'static str,
        views: u32,
    }

    #[test]
    fn non_object_values_flatten_to_empty() {
        assert!(json!([1, 2, 3]).as_payload().is_empty());
        assert!(Value::Null.as_payload().is_empty());
        assert!(None::<Value>.as_payload().is_empty());
    }

    #[test]
    fn typed_structs_expose_their_fields() {
        let payload = Serialized(Article {
            title: "hello",
            views: 3,
        })
        .as_payload();

        assert_eq!(payload.get("title"), Some(&json!("hello")));
        assert_eq!(payload.get("views"), Some(&json!(3)));
    }
}
