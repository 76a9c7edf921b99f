//! Declared property values.
//!
//! A declared property is either a literal JSON value or a reference to
//! another resource's output. References are what connect the graph: every
//! reference induces a dependency edge from the declaring node to the
//! referenced node.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::LogicalName;

/// A reference to an output property of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub resource: LogicalName,
    pub output: String,
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource, self.output)
    }
}

/// The value of a declared property.
///
/// The wire form of a reference is `{"$from": {"resource": ..., "output": ...}}`.
/// An object literal whose only key is `$from` cannot be expressed; that is a
/// property of the wire format, not of this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    // Must come before Literal so the untagged deserializer tries it first.
    Ref(RefValue),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefValue {
    #[serde(rename = "$from")]
    pub from: OutputRef,
}

impl PropertyValue {
    pub fn literal(value: Value) -> Self {
        PropertyValue::Literal(value)
    }

    pub fn reference(resource: impl Into<LogicalName>, output: impl Into<String>) -> Self {
        PropertyValue::Ref(RefValue {
            from: OutputRef {
                resource: resource.into(),
                output: output.into(),
            },
        })
    }

    /// The output reference, if this value is one.
    pub fn as_ref_value(&self) -> Option<&OutputRef> {
        match self {
            PropertyValue::Ref(r) => Some(&r.from),
            PropertyValue::Literal(_) => None,
        }
    }

    /// Resolve this value to a plain JSON value, looking up references
    /// through `outputs`. Returns `None` if the referenced resource or
    /// output is not available in `outputs`.
    pub fn resolve(&self, outputs: impl Fn(&OutputRef) -> Option<Value>) -> Option<Value> {
        match self {
            PropertyValue::Literal(v) => Some(v.clone()),
            PropertyValue::Ref(r) => outputs(&r.from),
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        PropertyValue::Literal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literal_round_trip() {
        let v: PropertyValue = serde_json::from_value(json!("hello")).unwrap();
        assert_eq!(v, PropertyValue::literal(json!("hello")));
        assert_eq!(serde_json::to_value(&v).unwrap(), json!("hello"));
    }

    #[test]
    fn reference_round_trip() {
        let wire = json!({"$from": {"resource": "bucket", "output": "arn"}});
        let v: PropertyValue = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(v, PropertyValue::reference("bucket", "arn"));
        assert_eq!(serde_json::to_value(&v).unwrap(), wire);
    }

    #[test]
    fn object_literal_is_not_a_reference() {
        let v: PropertyValue =
            serde_json::from_value(json!({"$from": "not a ref", "other": 1})).unwrap();
        assert!(v.as_ref_value().is_none());
    }

    #[test]
    fn resolve_reference() {
        let v = PropertyValue::reference("a", "id");
        let resolved = v.resolve(|r| {
            assert_eq!(r.resource.as_str(), "a");
            Some(json!("i-123"))
        });
        assert_eq!(resolved, Some(json!("i-123")));
    }

    #[test]
    fn resolve_missing_reference() {
        let v = PropertyValue::reference("a", "id");
        assert_eq!(v.resolve(|_| None), None);
    }
}
