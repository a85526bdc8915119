// Matrix Values
// Scalar values carried by matrix axes and exposed to jobs as environment variables

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar value of a matrix axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn as_string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 {
                    (*n as i64).to_string()
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
        }
    }

    /// Loose equality used when matching matrix exclusions
    pub fn matches(&self, other: &Value) -> bool {
        self == other || self.as_string() == other.as_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_string() {
        assert_eq!(Value::from("3.7").as_string(), "3.7");
        assert_eq!(Value::from(3.7).as_string(), "3.7");
        assert_eq!(Value::from(11_i64).as_string(), "11");
        assert_eq!(Value::from(true).as_string(), "true");
    }

    #[test]
    fn test_loose_match() {
        assert!(Value::from(3.8).matches(&Value::from("3.8")));
        assert!(!Value::from("3.6").matches(&Value::from("3.7")));
    }

    #[test]
    fn test_untagged_deserialize() {
        let values: Vec<Value> = serde_json::from_str(r#"["ubuntu", 3.7, true]"#).unwrap();
        assert_eq!(
            values,
            vec![Value::from("ubuntu"), Value::from(3.7), Value::from(true)]
        );
    }
}
