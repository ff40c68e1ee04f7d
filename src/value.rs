use std::{collections::HashMap, fmt};

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Resolved feature values keyed by feature name.
pub type FeatureValues = HashMap<String, FeatureValue>;

/// Caller-supplied fallback values keyed by feature name.
///
/// The keys define which features are requested; the values are returned whenever remote
/// evaluation is unavailable.
pub type Features = HashMap<String, FeatureValue>;

/// Value of a feature flag.
///
/// A server variation of `false`, `0`, `""` or an empty array/object is a valid value. Only
/// [`FeatureValue::Null`] (or a missing variation) is treated as "no value".
///
/// ```
/// # use feature_client::FeatureValue;
/// let enabled: FeatureValue = true.into();
/// let limit: FeatureValue = 10.0.into();
/// let theme: FeatureValue = "dark".into();
/// assert_eq!(enabled.as_boolean(), Some(true));
/// assert_eq!(limit.as_number(), Some(10.0));
/// assert_eq!(theme.as_str(), Some("dark"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From, Default)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Absence of value.
    #[default]
    Null,
    /// A boolean value.
    Boolean(bool),
    /// A numeric value.
    Number(f64),
    /// A string value.
    String(String),
    /// An array of values.
    Array(Vec<FeatureValue>),
    /// A structured value.
    Object(serde_json::Map<String, serde_json::Value>),
}

/// Shape of a [`FeatureValue`]. Used to report type mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureValueKind {
    /// `null`.
    Null,
    /// `true` or `false`.
    Boolean,
    /// A number.
    Number,
    /// A string.
    String,
    /// An array.
    Array,
    /// An object.
    Object,
}

impl fmt::Display for FeatureValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeatureValueKind::Null => "null",
            FeatureValueKind::Boolean => "boolean",
            FeatureValueKind::Number => "number",
            FeatureValueKind::String => "string",
            FeatureValueKind::Array => "array",
            FeatureValueKind::Object => "object",
        };
        f.write_str(s)
    }
}

impl FeatureValue {
    /// Returns the shape of this value.
    pub fn kind(&self) -> FeatureValueKind {
        match self {
            FeatureValue::Null => FeatureValueKind::Null,
            FeatureValue::Boolean(_) => FeatureValueKind::Boolean,
            FeatureValue::Number(_) => FeatureValueKind::Number,
            FeatureValue::String(_) => FeatureValueKind::String,
            FeatureValue::Array(_) => FeatureValueKind::Array,
            FeatureValue::Object(_) => FeatureValueKind::Object,
        }
    }

    /// Returns `true` if the value is [`FeatureValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, FeatureValue::Null)
    }

    /// Returns the boolean if this is a [`FeatureValue::Boolean`].
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FeatureValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the number if this is a [`FeatureValue::Number`].
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string if this is a [`FeatureValue::String`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the elements if this is a [`FeatureValue::Array`].
    pub fn as_array(&self) -> Option<&[FeatureValue]> {
        match self {
            FeatureValue::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the map if this is a [`FeatureValue::Object`].
    pub fn as_object(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            FeatureValue::Object(v) => Some(v),
            _ => None,
        }
    }

    /// Convert to a generic JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        // Serializing a tree of maps, strings and finite numbers cannot fail. Non-finite floats
        // are mapped to null by serde_json.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Coerce a wire string into a richer scalar: `"true"`/`"false"` become booleans, numeric
    /// strings become numbers. Anything else is returned unchanged.
    ///
    /// ```
    /// # use feature_client::FeatureValue;
    /// assert_eq!(FeatureValue::from("true").coerce_wire_string(), FeatureValue::Boolean(true));
    /// assert_eq!(FeatureValue::from("1.5").coerce_wire_string(), FeatureValue::Number(1.5));
    /// assert_eq!(FeatureValue::from("blue").coerce_wire_string(), FeatureValue::from("blue"));
    /// ```
    pub fn coerce_wire_string(self) -> FeatureValue {
        let FeatureValue::String(s) = self else {
            return self;
        };
        match s.as_str() {
            "true" => FeatureValue::Boolean(true),
            "false" => FeatureValue::Boolean(false),
            other => match other.trim().parse::<f64>() {
                Ok(n) if !other.trim().is_empty() && n.is_finite() => FeatureValue::Number(n),
                _ => FeatureValue::String(s),
            },
        }
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for FeatureValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for FeatureValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<serde_json::Value> for FeatureValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FeatureValue::Null,
            serde_json::Value::Bool(b) => FeatureValue::Boolean(b),
            serde_json::Value::Number(n) => {
                n.as_f64().map_or(FeatureValue::Null, FeatureValue::Number)
            }
            serde_json::Value::String(s) => FeatureValue::String(s),
            serde_json::Value::Array(v) => {
                FeatureValue::Array(v.into_iter().map(FeatureValue::from).collect())
            }
            serde_json::Value::Object(o) => FeatureValue::Object(o),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deserializes_wire_values() {
        let values: Vec<FeatureValue> =
            serde_json::from_value(json!([null, false, 0, "", [], {}, [true, 1]])).unwrap();

        assert_eq!(
            values,
            vec![
                FeatureValue::Null,
                FeatureValue::Boolean(false),
                FeatureValue::Number(0.0),
                FeatureValue::String(String::new()),
                FeatureValue::Array(vec![]),
                FeatureValue::Object(serde_json::Map::new()),
                FeatureValue::Array(vec![true.into(), 1.into()]),
            ]
        );
    }

    #[test]
    fn falsy_values_are_not_null() {
        assert!(!FeatureValue::Boolean(false).is_null());
        assert!(!FeatureValue::Number(0.0).is_null());
        assert!(!FeatureValue::Array(vec![]).is_null());
        assert!(FeatureValue::Null.is_null());
    }

    #[test]
    fn coercion_leaves_non_numeric_strings() {
        assert_eq!(
            FeatureValue::from("").coerce_wire_string(),
            FeatureValue::from("")
        );
        assert_eq!(
            FeatureValue::from("TRUE").coerce_wire_string(),
            FeatureValue::from("TRUE")
        );
        assert_eq!(
            FeatureValue::from("-3").coerce_wire_string(),
            FeatureValue::Number(-3.0)
        );
        assert_eq!(
            FeatureValue::Boolean(true).coerce_wire_string(),
            FeatureValue::Boolean(true)
        );
    }

    #[test]
    fn kind_display() {
        assert_eq!(FeatureValue::from(json!({"a": 1})).kind().to_string(), "object");
        assert_eq!(FeatureValue::Null.kind().to_string(), "null");
    }
}
