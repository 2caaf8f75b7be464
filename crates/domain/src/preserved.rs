//! Preserved session state — the explicit key/value map the pipeline
//! executor supplies so that critical progress markers (current phase,
//! attempt count, cursor) survive a session rotation.
//!
//! Values are restricted to scalars. Nested structures are rejected at
//! insert so rotation summaries never become an opaque deserialization
//! surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A scalar value allowed inside [`PreservedState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for ScalarValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<i64> for ScalarValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for ScalarValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl TryFrom<serde_json::Value> for ScalarValue {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Bool(b) => Ok(Self::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Float(f))
                } else {
                    Err(Error::Configuration(format!(
                        "preserved-state number out of range: {n}"
                    )))
                }
            }
            serde_json::Value::String(s) => Ok(Self::Str(s)),
            other => Err(Error::Configuration(format!(
                "preserved-state values must be scalars, got {other}"
            ))),
        }
    }
}

/// The key/value map copied verbatim into each rotation successor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreservedState(BTreeMap<String, ScalarValue>);

impl PreservedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ScalarValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Insert from an untrusted JSON value, rejecting non-scalars.
    pub fn insert_json(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        self.0.insert(key.into(), ScalarValue::try_from(value)?);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&ScalarValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Overlay `other` on top of this map (other wins on key collision).
    pub fn merge(&mut self, other: &PreservedState) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut state = PreservedState::new();
        state.insert("phase", "fix");
        state.insert("attempt", 2i64);
        state.insert("done", false);

        assert_eq!(state.get("phase"), Some(&ScalarValue::Str("fix".into())));
        assert_eq!(state.get("attempt"), Some(&ScalarValue::Int(2)));
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn rejects_nested_json() {
        let mut state = PreservedState::new();
        let err = state
            .insert_json("cursor", serde_json::json!({"offset": 10}))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = state
            .insert_json("items", serde_json::json!([1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn accepts_scalar_json() {
        let mut state = PreservedState::new();
        state.insert_json("n", serde_json::json!(7)).unwrap();
        state.insert_json("f", serde_json::json!(1.5)).unwrap();
        state.insert_json("s", serde_json::json!("x")).unwrap();
        state.insert_json("b", serde_json::json!(true)).unwrap();
        assert_eq!(state.len(), 4);
    }

    #[test]
    fn merge_overlays() {
        let mut a = PreservedState::new();
        a.insert("phase", "plan");
        a.insert("attempt", 1i64);

        let mut b = PreservedState::new();
        b.insert("phase", "fix");

        a.merge(&b);
        assert_eq!(a.get("phase"), Some(&ScalarValue::Str("fix".into())));
        assert_eq!(a.get("attempt"), Some(&ScalarValue::Int(1)));
    }

    #[test]
    fn serde_roundtrip() {
        let mut state = PreservedState::new();
        state.insert("phase", "fix");
        state.insert("attempt", 2i64);

        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"attempt":2,"phase":"fix"}"#);
        let back: PreservedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
