//! Query filter engine.
//!
//! A filter is a conjunction of per-field conditions. In JSON form it is an
//! object mapping field names either to a literal (equality) or to an operator
//! object:
//!
//! ```json
//! { "ownerId": 4, "status": { "$ne": "deleted" }, "size": { "$gt": 0, "$lt": 1048576 } }
//! ```
//!
//! Supported operators are `$eq`, `$ne`, `$in`, `$gt` and `$lt`. There is no
//! OR and no nesting.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;
use crate::record::Record;

/// A single test applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    /// Field differs from the operand. An absent field counts as different,
    /// except from `null`: `Ne(null)` requires the field to be present and
    /// non-null.
    Ne(Value),
    In(Vec<Value>),
    Gt(Value),
    Lt(Value),
}

impl Condition {
    /// Evaluate against the field value, `None` when the record lacks the field.
    ///
    /// An absent field only satisfies `Ne` against a non-null operand, so
    /// `{"$ne": null}` selects records where the field is present and non-null.
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        match (self, actual) {
            (Condition::Ne(expected), None) => !expected.is_null(),
            (Condition::Ne(expected), Some(actual)) => !loosely_equal(actual, expected),
            (_, None) => false,
            (Condition::Eq(expected), Some(actual)) => loosely_equal(actual, expected),
            (Condition::In(options), Some(actual)) => {
                options.iter().any(|option| loosely_equal(actual, option))
            }
            (Condition::Gt(bound), Some(actual)) => compare(actual, bound) == Some(Ordering::Greater),
            (Condition::Lt(bound), Some(actual)) => compare(actual, bound) == Some(Ordering::Less),
        }
    }

    fn operator(&self) -> &'static str {
        match self {
            Condition::Eq(_) => "$eq",
            Condition::Ne(_) => "$ne",
            Condition::In(_) => "$in",
            Condition::Gt(_) => "$gt",
            Condition::Lt(_) => "$lt",
        }
    }

    fn operand(&self) -> Value {
        match self {
            Condition::Eq(v) | Condition::Ne(v) | Condition::Gt(v) | Condition::Lt(v) => v.clone(),
            Condition::In(items) => Value::Array(items.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    field: String,
    condition: Condition,
}

/// Conjunction of field conditions. The empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON form. `null` is accepted as the empty filter.
    pub fn from_value(value: Value) -> Result<Self, StorageError> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            other => {
                return Err(StorageError::InvalidArgument(format!(
                    "Filter must be an object, got {}",
                    other
                )))
            }
        };

        let mut filter = Self::default();
        for (field, criteria) in map {
            for condition in parse_conditions(&field, criteria)? {
                filter = filter.with(field.clone(), condition);
            }
        }
        Ok(filter)
    }

    /// Add an arbitrary condition on `field`.
    pub fn with(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.clauses.push(Clause {
            field: field.into(),
            condition,
        });
        self
    }

    pub fn equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Eq(value.into()))
    }

    pub fn not_equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Ne(value.into()))
    }

    pub fn one_of<V: Into<Value>>(
        self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.with(field, Condition::In(values))
    }

    pub fn greater_than(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Gt(value.into()))
    }

    pub fn less_than(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Lt(value.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Whether `record` satisfies every clause.
    pub fn matches(&self, record: &Record) -> bool {
        self.clauses
            .iter()
            .all(|clause| clause.condition.matches(record.get(&clause.field).as_deref()))
    }
}

impl TryFrom<Value> for Filter {
    type Error = StorageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Filter> for Value {
    fn from(filter: Filter) -> Self {
        let mut map = Map::new();
        for clause in filter.clauses {
            let entry = map
                .entry(clause.field)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(ops) = entry {
                ops.insert(clause.condition.operator().to_string(), clause.condition.operand());
            }
        }
        Value::Object(map)
    }
}

fn parse_conditions(field: &str, criteria: Value) -> Result<Vec<Condition>, StorageError> {
    match criteria {
        Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => ops
            .into_iter()
            .map(|(op, operand)| parse_operator(field, &op, operand))
            .collect(),
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            Err(StorageError::InvalidArgument(format!(
                "Filter on {} mixes operators and plain keys",
                field
            )))
        }
        literal => Ok(vec![Condition::Eq(literal)]),
    }
}

fn parse_operator(field: &str, op: &str, operand: Value) -> Result<Condition, StorageError> {
    match op {
        "$eq" => Ok(Condition::Eq(operand)),
        "$ne" => Ok(Condition::Ne(operand)),
        "$gt" => Ok(Condition::Gt(operand)),
        "$lt" => Ok(Condition::Lt(operand)),
        "$in" => match operand {
            Value::Array(items) => Ok(Condition::In(items)),
            other => Err(StorageError::InvalidArgument(format!(
                "$in on {} expects an array, got {}",
                field, other
            ))),
        },
        other => Err(StorageError::InvalidArgument(format!(
            "Unsupported filter operator {} on {}",
            other, field
        ))),
    }
}

/// Equality where numbers compare by value regardless of representation.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering for `$gt`/`$lt`: numbers with numbers, strings with strings.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
