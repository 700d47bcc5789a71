//! CQL2-JSON attribute filters.
//!
//! Clipping layers select features with a small subset of CQL2-JSON:
//!
//! ```text
//! {"op": "=",  "args": [{"property": "MRGID_EEZ"}, 8325]}
//! {"op": "in", "args": [{"property": "name"}, ["US", "Mexico"]]}
//! {"op": "isNull", "args": [{"property": "name"}]}
//! {"and": [q1, q2]}      {"op": "or", "args": [q1, q2]}      {"not": q}
//! ```
//!
//! Queries are parsed once into [`Cql2Query`] and evaluated against feature
//! properties. A property missing from a feature compares as `null`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use fgb_source::Value;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{OverlayError, Result};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "=" => Some(Self::Eq),
            "!=" | "<>" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Operator with its operands swapped (`5 < x` is `x > 5`).
    fn mirrored(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            other => other,
        }
    }
}

/// A parsed attribute filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum Cql2Query {
    Compare {
        op: CompareOp,
        property: String,
        value: Value,
    },
    In {
        property: String,
        values: Vec<Value>,
    },
    IsNull {
        property: String,
    },
    And(Vec<Cql2Query>),
    Or(Vec<Cql2Query>),
    Not(Box<Cql2Query>),
}

impl Cql2Query {
    /// `property = value`.
    pub fn equals(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Compare {
            op: CompareOp::Eq,
            property: property.into(),
            value: value.into(),
        }
    }

    /// Parse a CQL2-JSON document.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| invalid(json, "expected an object"))?;

        if let Some(args) = obj.get("and") {
            return Ok(Self::And(parse_list(args)?));
        }
        if let Some(args) = obj.get("or") {
            return Ok(Self::Or(parse_list(args)?));
        }
        if let Some(inner) = obj.get("not") {
            return Ok(Self::Not(Box::new(Self::from_json(inner)?)));
        }

        let op = obj
            .get("op")
            .and_then(|op| op.as_str())
            .ok_or_else(|| invalid(json, "missing \"op\""))?;
        let args = obj
            .get("args")
            .and_then(|args| args.as_array())
            .ok_or_else(|| invalid(json, "missing \"args\" array"))?;

        match op {
            "and" => Ok(Self::And(parse_items(args)?)),
            "or" => Ok(Self::Or(parse_items(args)?)),
            "not" => match args.as_slice() {
                [inner] => Ok(Self::Not(Box::new(Self::from_json(inner)?))),
                _ => Err(invalid(json, "\"not\" takes exactly one argument")),
            },
            "isNull" => match args.as_slice() {
                [arg] => {
                    let property =
                        property_name(arg).ok_or_else(|| invalid(json, "expected a property"))?;
                    Ok(Self::IsNull { property })
                }
                _ => Err(invalid(json, "\"isNull\" takes exactly one argument")),
            },
            "in" => match args.as_slice() {
                [arg, list] => {
                    let property =
                        property_name(arg).ok_or_else(|| invalid(json, "expected a property"))?;
                    // a non-array list never matches
                    let values = list
                        .as_array()
                        .map(|items| items.iter().map(Value::from_json).collect())
                        .unwrap_or_default();
                    Ok(Self::In { property, values })
                }
                _ => Err(invalid(json, "\"in\" takes a property and a list")),
            },
            other => {
                let compare = CompareOp::parse(other).ok_or_else(|| {
                    OverlayError::configuration(format!("unsupported CQL2 operator: {}", other))
                })?;
                let [left, right] = args.as_slice() else {
                    return Err(invalid(json, "comparisons take exactly two arguments"));
                };
                match (property_name(left), property_name(right)) {
                    (Some(property), None) => Ok(Self::Compare {
                        op: compare,
                        property,
                        value: Value::from_json(right),
                    }),
                    (None, Some(property)) => Ok(Self::Compare {
                        op: compare.mirrored(),
                        property,
                        value: Value::from_json(left),
                    }),
                    _ => Err(invalid(json, "comparisons need one property and one literal")),
                }
            }
        }
    }

    /// Serialize back to CQL2-JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Compare {
                op,
                property,
                value,
            } => json!({ "op": op.as_str(), "args": [{ "property": property }, value] }),
            Self::In { property, values } => {
                json!({ "op": "in", "args": [{ "property": property }, values] })
            }
            Self::IsNull { property } => json!({ "op": "isNull", "args": [{ "property": property }] }),
            Self::And(items) => json!({
                "op": "and",
                "args": items.iter().map(Self::to_json).collect::<Vec<_>>()
            }),
            Self::Or(items) => json!({
                "op": "or",
                "args": items.iter().map(Self::to_json).collect::<Vec<_>>()
            }),
            Self::Not(inner) => json!({ "op": "not", "args": [inner.to_json()] }),
        }
    }

    /// Evaluate against feature properties.
    pub fn evaluate(&self, properties: &BTreeMap<String, Value>) -> bool {
        match self {
            Self::Compare {
                op,
                property,
                value,
            } => {
                let actual = properties.get(property).unwrap_or(&Value::Null);
                compare(*op, actual, value)
            }
            Self::In { property, values } => {
                let actual = properties.get(property).unwrap_or(&Value::Null);
                values.iter().any(|v| loosely_equal(actual, v))
            }
            Self::IsNull { property } => properties.get(property).map_or(true, Value::is_null),
            Self::And(items) => items.iter().all(|q| q.evaluate(properties)),
            Self::Or(items) => items.iter().any(|q| q.evaluate(properties)),
            Self::Not(inner) => !inner.evaluate(properties),
        }
    }

    /// Combine two optional filters so a feature matching either one
    /// matches. A missing filter matches everything, so `None` wins.
    pub fn or(a: Option<Cql2Query>, b: Option<Cql2Query>) -> Option<Cql2Query> {
        match (a, b) {
            (Some(Self::Or(mut left)), Some(Self::Or(right))) => {
                left.extend(right);
                Some(Self::Or(left))
            }
            (Some(Self::Or(mut left)), Some(right)) => {
                left.push(right);
                Some(Self::Or(left))
            }
            (Some(left), Some(right)) => Some(Self::Or(vec![left, right])),
            _ => None,
        }
    }
}

impl TryFrom<serde_json::Value> for Cql2Query {
    type Error = OverlayError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        Self::from_json(&value)
    }
}

impl From<Cql2Query> for serde_json::Value {
    fn from(query: Cql2Query) -> Self {
        query.to_json()
    }
}

impl fmt::Display for Cql2Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

fn compare(op: CompareOp, actual: &Value, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(actual, expected),
        CompareOp::Ne => !loosely_equal(actual, expected),
        _ => match order(actual, expected) {
            Some(ordering) => match op {
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Ge => ordering != Ordering::Less,
                CompareOp::Eq | CompareOp::Ne => false,
            },
            None => false,
        },
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn property_name(arg: &serde_json::Value) -> Option<String> {
    arg.as_object()?
        .get("property")?
        .as_str()
        .map(str::to_string)
}

fn parse_list(args: &serde_json::Value) -> Result<Vec<Cql2Query>> {
    let items = args
        .as_array()
        .ok_or_else(|| invalid(args, "expected an array of queries"))?;
    parse_items(items)
}

fn parse_items(items: &[serde_json::Value]) -> Result<Vec<Cql2Query>> {
    items.iter().map(Cql2Query::from_json).collect()
}

fn invalid(json: &serde_json::Value, reason: &str) -> OverlayError {
    OverlayError::configuration(format!("invalid CQL2 query {}: {}", json, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn parse(json: serde_json::Value) -> Cql2Query {
        Cql2Query::from_json(&json).unwrap()
    }

    // ============================================================================
    // Comparison tests
    // ============================================================================

    #[test]
    fn test_equality() {
        let p = props(&[("name", "test".into()), ("age", 25.0.into())]);

        assert!(parse(json!({"op": "=", "args": [{"property": "name"}, "test"]})).evaluate(&p));
        assert!(parse(json!({"op": "=", "args": [{"property": "age"}, 25]})).evaluate(&p));
        assert!(!parse(json!({"op": "=", "args": [{"property": "name"}, "wrong"]})).evaluate(&p));
        assert!(parse(json!({"op": "!=", "args": [{"property": "age"}, 30]})).evaluate(&p));
        assert!(!parse(json!({"op": "<>", "args": [{"property": "name"}, "test"]})).evaluate(&p));
    }

    #[test]
    fn test_equality_does_not_coerce_types() {
        let p = props(&[("MRGID_EEZ", 8325.0.into())]);
        assert!(!parse(json!({"op": "=", "args": [{"property": "MRGID_EEZ"}, "8325"]})).evaluate(&p));
    }

    #[test]
    fn test_ordering() {
        let p = props(&[("age", 25.0.into()), ("name", "m".into())]);

        assert!(parse(json!({"op": ">", "args": [{"property": "age"}, 20]})).evaluate(&p));
        assert!(parse(json!({"op": ">=", "args": [{"property": "age"}, 25]})).evaluate(&p));
        assert!(!parse(json!({"op": "<", "args": [{"property": "age"}, 25]})).evaluate(&p));
        assert!(parse(json!({"op": "<=", "args": [{"property": "name"}, "z"]})).evaluate(&p));
        // mixed types never order
        assert!(!parse(json!({"op": "<", "args": [{"property": "name"}, 5]})).evaluate(&p));
    }

    #[test]
    fn test_literal_first_is_mirrored() {
        let p = props(&[("age", 25.0.into())]);
        let query = parse(json!({"op": "<", "args": [20, {"property": "age"}]}));
        assert!(query.evaluate(&p));
        assert!(matches!(query, Cql2Query::Compare { op: CompareOp::Gt, .. }));
    }

    #[test]
    fn test_missing_property_is_null() {
        let p = props(&[]);
        assert!(!parse(json!({"op": "=", "args": [{"property": "name"}, "x"]})).evaluate(&p));
        assert!(parse(json!({"op": "isNull", "args": [{"property": "name"}]})).evaluate(&p));
        assert!(parse(json!({"op": "=", "args": [{"property": "name"}, null]})).evaluate(&p));
    }

    // ============================================================================
    // Set and logical operator tests
    // ============================================================================

    #[test]
    fn test_in() {
        let p = props(&[("name", "test".into()), ("age", 25.0.into())]);

        assert!(parse(json!({"op": "in", "args": [{"property": "name"}, ["test", "other"]]})).evaluate(&p));
        assert!(parse(json!({"op": "in", "args": [{"property": "age"}, [25, 30, 35]]})).evaluate(&p));
        assert!(!parse(json!({"op": "in", "args": [{"property": "name"}, ["wrong"]]})).evaluate(&p));
        assert!(!parse(json!({"op": "in", "args": [{"property": "name"}, "test"]})).evaluate(&p));
    }

    #[test]
    fn test_logical_operators() {
        let p = props(&[("name", "test".into()), ("age", 25.0.into()), ("role", "admin".into())]);
        let name = json!({"op": "=", "args": [{"property": "name"}, "test"]});
        let wrong_age = json!({"op": "=", "args": [{"property": "age"}, 30]});
        let role = json!({"op": "=", "args": [{"property": "role"}, "admin"]});

        assert!(parse(json!({"and": [name, role]})).evaluate(&p));
        assert!(!parse(json!({"op": "and", "args": [name, wrong_age]})).evaluate(&p));
        assert!(parse(json!({"or": [wrong_age, role]})).evaluate(&p));
        assert!(!parse(json!({"op": "or", "args": [wrong_age, wrong_age]})).evaluate(&p));
        assert!(parse(json!({"not": wrong_age})).evaluate(&p));
        assert!(!parse(json!({"op": "not", "args": [name]})).evaluate(&p));
        assert!(parse(json!({"op": "and", "args": [name, {"op": "or", "args": [wrong_age, role]}]})).evaluate(&p));
    }

    // ============================================================================
    // Parsing tests
    // ============================================================================

    #[test]
    fn test_malformed_queries_are_configuration_errors() {
        let cases = [
            json!("name = 'x'"),
            json!({"op": "=", "args": [{"property": "name"}]}),
            json!({"op": "like", "args": [{"property": "name"}, "x%"]}),
            json!({"op": "=", "args": [1, 2]}),
            json!({"and": {"op": "=", "args": [{"property": "a"}, 1]}}),
            json!({"args": []}),
        ];
        for case in cases {
            let err = Cql2Query::from_json(&case).unwrap_err();
            assert!(matches!(err, OverlayError::Configuration(_)), "{}", case);
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let raw = json!({"op": "and", "args": [
            {"op": "=", "args": [{"property": "MRGID_EEZ"}, 8325.0]},
            {"op": "not", "args": [{"op": "isNull", "args": [{"property": "name"}]}]}
        ]});
        let query: Cql2Query = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&query).unwrap(), raw);
    }

    #[test]
    fn test_or_combination() {
        let us = Cql2Query::equals("name", "US");
        let mx = Cql2Query::equals("name", "Mexico");
        let ca = Cql2Query::equals("name", "Canada");

        let combined = Cql2Query::or(Some(us.clone()), Some(mx.clone())).unwrap();
        assert_eq!(combined, Cql2Query::Or(vec![us.clone(), mx.clone()]));

        let combined = Cql2Query::or(Some(combined), Some(ca.clone())).unwrap();
        assert_eq!(combined, Cql2Query::Or(vec![us.clone(), mx, ca]));

        assert_eq!(Cql2Query::or(Some(us), None), None);
    }
}
