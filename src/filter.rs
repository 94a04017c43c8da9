//! Property filters.
//!
//! A `PropertiesFilter` is a small boolean expression tree stored in its
//! canonical JSON form so it can travel inside messages unchanged. Every node
//! is an object with exactly three reserved keys:
//!
//! - leaves: `$op` (one of `CONTAINS`, `EQUALS`, `EXISTS`, `NOT_EXISTS`,
//!   `LT`, `GT`), `$key` (dotted path) and `$val` (literal);
//! - inner nodes: `$op` (`AND` or `OR`), `$filter_1` and `$filter_2`.
//!
//! Paths are resolved against an entity's inner property map, so
//! `"address.city"` reads `properties.address.city` of the bag.
//!
//! Evaluation never fails: any malformed node evaluates to `false`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::ValidationError;

/// Reserved key holding the operator.
pub const OP_KEY: &str = "$op";
/// Reserved key holding a leaf's path.
pub const KEY_KEY: &str = "$key";
/// Reserved key holding a leaf's literal.
pub const VAL_KEY: &str = "$val";
/// Reserved key holding the left operand of `AND`/`OR`.
pub const FILTER_1_KEY: &str = "$filter_1";
/// Reserved key holding the right operand of `AND`/`OR`.
pub const FILTER_2_KEY: &str = "$filter_2";

/// Filter operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOp {
    And,
    Or,
    Contains,
    Equals,
    Exists,
    NotExists,
    Lt,
    Gt,
}

impl FilterOp {
    /// Wire name of the operator.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Contains => "CONTAINS",
            Self::Equals => "EQUALS",
            Self::Exists => "EXISTS",
            Self::NotExists => "NOT_EXISTS",
            Self::Lt => "LT",
            Self::Gt => "GT",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let op = match name {
            "AND" => Self::And,
            "OR" => Self::Or,
            "CONTAINS" => Self::Contains,
            "EQUALS" => Self::Equals,
            "EXISTS" => Self::Exists,
            "NOT_EXISTS" => Self::NotExists,
            "LT" => Self::Lt,
            "GT" => Self::Gt,
            _ => return None,
        };
        Some(op)
    }

    /// Returns true for `AND`/`OR`.
    #[must_use]
    pub const fn is_combinator(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A boolean filter over an entity's property map.
///
/// # Examples
///
/// ```
/// use proxmesh::PropertiesFilter;
/// use serde_json::json;
///
/// let filter = PropertiesFilter::and(
///     PropertiesFilter::equals("role", json!("guide")),
///     PropertiesFilter::gt("age", json!(30)),
/// );
/// let props = json!({"role": "guide", "age": 41});
/// assert!(filter.evaluate(props.as_object().unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertiesFilter(Map<String, JsonValue>);

impl PropertiesFilter {
    fn combinator(op: FilterOp, left: Self, right: Self) -> Self {
        let mut node = Map::new();
        node.insert(OP_KEY.to_string(), JsonValue::String(op.as_str().to_string()));
        node.insert(FILTER_1_KEY.to_string(), JsonValue::Object(left.0));
        node.insert(FILTER_2_KEY.to_string(), JsonValue::Object(right.0));
        Self(node)
    }

    fn leaf(op: FilterOp, path: &str, value: JsonValue) -> Self {
        let mut node = Map::new();
        node.insert(OP_KEY.to_string(), JsonValue::String(op.as_str().to_string()));
        node.insert(KEY_KEY.to_string(), JsonValue::String(path.to_string()));
        node.insert(VAL_KEY.to_string(), value);
        Self(node)
    }

    #[must_use]
    pub fn and(left: Self, right: Self) -> Self {
        Self::combinator(FilterOp::And, left, right)
    }

    #[must_use]
    pub fn or(left: Self, right: Self) -> Self {
        Self::combinator(FilterOp::Or, left, right)
    }

    /// Substring match for strings, element match for arrays.
    #[must_use]
    pub fn contains(path: &str, value: JsonValue) -> Self {
        Self::leaf(FilterOp::Contains, path, value)
    }

    #[must_use]
    pub fn equals(path: &str, value: JsonValue) -> Self {
        Self::leaf(FilterOp::Equals, path, value)
    }

    #[must_use]
    pub fn lt(path: &str, value: JsonValue) -> Self {
        Self::leaf(FilterOp::Lt, path, value)
    }

    #[must_use]
    pub fn gt(path: &str, value: JsonValue) -> Self {
        Self::leaf(FilterOp::Gt, path, value)
    }

    #[must_use]
    pub fn exists(path: &str) -> Self {
        Self::leaf(FilterOp::Exists, path, JsonValue::Bool(true))
    }

    #[must_use]
    pub fn not_exists(path: &str) -> Self {
        Self::leaf(FilterOp::NotExists, path, JsonValue::Bool(false))
    }

    /// Parses and validates a filter from its JSON text.
    pub fn parse(json: &str) -> Result<Self, ValidationError> {
        let value: JsonValue = serde_json::from_str(json).map_err(|e| ValidationError::InvalidFilter {
            reason: e.to_string(),
        })?;
        Self::from_value(value)
    }

    /// Validates a filter from its canonical JSON value.
    pub fn from_value(value: JsonValue) -> Result<Self, ValidationError> {
        let JsonValue::Object(map) = value else {
            return Err(ValidationError::InvalidFilter {
                reason: "filter must be a JSON object".to_string(),
            });
        };
        validate_node(&map)?;
        Ok(Self(map))
    }

    /// The canonical map.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    /// The operator at the root, if well-formed.
    #[must_use]
    pub fn op(&self) -> Option<FilterOp> {
        self.0.get(OP_KEY).and_then(JsonValue::as_str).and_then(FilterOp::parse)
    }

    /// Evaluates the filter against a property map. Malformed nodes yield `false`.
    #[must_use]
    pub fn evaluate(&self, properties: &Map<String, JsonValue>) -> bool {
        eval_node(&self.0, properties).unwrap_or(false)
    }
}

impl fmt::Display for PropertiesFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", JsonValue::Object(self.0.clone()))
    }
}

fn invalid(reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidFilter { reason: reason.into() }
}

fn validate_node(node: &Map<String, JsonValue>) -> Result<(), ValidationError> {
    if node.len() != 3 {
        return Err(invalid(format!("node must have 3 keys, found {}", node.len())));
    }
    let op_name = node
        .get(OP_KEY)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid("missing $op"))?;
    let op = FilterOp::parse(op_name).ok_or_else(|| invalid(format!("unknown operator '{op_name}'")))?;

    if op.is_combinator() {
        for key in [FILTER_1_KEY, FILTER_2_KEY] {
            let child = node
                .get(key)
                .and_then(JsonValue::as_object)
                .ok_or_else(|| invalid(format!("{op} requires object {key}")))?;
            validate_node(child)?;
        }
    } else {
        node.get(KEY_KEY)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid(format!("{op} requires string $key")))?;
        if !node.contains_key(VAL_KEY) {
            return Err(invalid(format!("{op} requires $val")));
        }
    }
    Ok(())
}

fn eval_node(node: &Map<String, JsonValue>, props: &Map<String, JsonValue>) -> Option<bool> {
    if node.len() != 3 {
        return None;
    }
    let op = FilterOp::parse(node.get(OP_KEY)?.as_str()?)?;

    match op {
        FilterOp::And => {
            if !eval_node(node.get(FILTER_1_KEY)?.as_object()?, props)? {
                return Some(false);
            }
            eval_node(node.get(FILTER_2_KEY)?.as_object()?, props)
        }
        FilterOp::Or => {
            if eval_node(node.get(FILTER_1_KEY)?.as_object()?, props)? {
                return Some(true);
            }
            eval_node(node.get(FILTER_2_KEY)?.as_object()?, props)
        }
        leaf => {
            let path = node.get(KEY_KEY)?.as_str()?;
            let literal = node.get(VAL_KEY)?;
            let found = resolve(props, path);
            Some(eval_leaf(leaf, found, literal))
        }
    }
}

fn eval_leaf(op: FilterOp, found: Option<&JsonValue>, literal: &JsonValue) -> bool {
    match op {
        FilterOp::Exists => found.is_some(),
        FilterOp::NotExists => found.is_none(),
        FilterOp::Equals => found.is_some_and(|v| json_eq(v, literal)),
        FilterOp::Contains => match found {
            Some(JsonValue::String(s)) => literal.as_str().is_some_and(|needle| s.contains(needle)),
            Some(JsonValue::Array(items)) => items.iter().any(|item| json_eq(item, literal)),
            _ => false,
        },
        FilterOp::Lt => numeric_pair(found, literal).is_some_and(|(a, b)| a < b),
        FilterOp::Gt => numeric_pair(found, literal).is_some_and(|(a, b)| a > b),
        FilterOp::And | FilterOp::Or => false,
    }
}

/// Resolves a dotted path, tolerating a leading `$.` or `@.`.
fn resolve<'a>(props: &'a Map<String, JsonValue>, path: &str) -> Option<&'a JsonValue> {
    let path = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix("@."))
        .unwrap_or(path);
    let mut segments = path.split('.');
    let mut current = props.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn numeric_pair(found: Option<&JsonValue>, literal: &JsonValue) -> Option<(f64, f64)> {
    Some((found?.as_f64()?, literal.as_f64()?))
}
