//! Type-erased callback payloads.
//!
//! Button payloads keep their original Rust type while they sit in the token
//! registry and are downcast by the step that receives the click.

use std::{
    any::{Any, type_name},
    fmt,
    sync::Arc,
};

/// An arbitrary value attached to an inline button.
#[derive(Clone)]
pub struct CallbackPayload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl CallbackPayload {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Whether the payload holds a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take a shared handle to the inner value, or get the payload back if the
    /// type does not match.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Arc<T>, Self> {
        let type_name = self.type_name;
        self.value
            .downcast::<T>()
            .map_err(|value| Self { value, type_name })
    }

    /// Shortcut for payloads created from a string.
    pub fn as_str(&self) -> Option<&str> {
        self.downcast_ref::<String>().map(String::as_str)
    }

    /// Rust type name of the stored value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for CallbackPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.debug_tuple("CallbackPayload").field(&s).finish(),
            None => f
                .debug_struct("CallbackPayload")
                .field("type", &self.type_name)
                .finish_non_exhaustive(),
        }
    }
}

impl From<String> for CallbackPayload {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for CallbackPayload {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

impl From<serde_json::Value> for CallbackPayload {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Choice {
        id: u32,
        label: &'static str,
    }

    #[test]
    fn str_payload_is_stored_as_string() {
        let payload = CallbackPayload::from("yes");
        assert!(payload.is::<String>());
        assert_eq!(payload.as_str(), Some("yes"));
    }

    #[test]
    fn struct_payload_downcasts_to_original_type() {
        let payload = CallbackPayload::new(Choice { id: 3, label: "three" });
        assert!(payload.as_str().is_none());
        assert_eq!(
            payload.downcast_ref::<Choice>(),
            Some(&Choice { id: 3, label: "three" })
        );
        assert!(payload.type_name().ends_with("Choice"));
    }

    #[test]
    fn failed_downcast_returns_payload() {
        let mut map = HashMap::new();
        map.insert("k".to_string(), 1_i64);
        let payload = CallbackPayload::new(map);

        let payload = payload.downcast::<String>().unwrap_err();
        let map = payload.downcast::<HashMap<String, i64>>().unwrap();
        assert_eq!(map.get("k"), Some(&1));
    }

    #[test]
    fn debug_hides_non_string_values() {
        let payload = CallbackPayload::new(42_u8);
        assert_eq!(format!("{payload:?}"), "CallbackPayload { type: \"u8\", .. }");
        let payload = CallbackPayload::from("ok");
        assert_eq!(format!("{payload:?}"), "CallbackPayload(\"ok\")");
    }
}
