// Query constraints - filters, ordering, limits and value comparison

use crate::error::{NestDocError, Result};
use crate::path::{CollectionGroup, CollectionPath, DocumentPath};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Filter operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    ArrayContains,
    ArrayContainsAny,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::In => "in",
            Operator::NotIn => "not-in",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
        }
    }

    /// Operators whose operand must be a non-empty list
    fn takes_list(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn | Operator::ArrayContainsAny)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = NestDocError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Lte,
            ">" => Operator::Gt,
            ">=" => Operator::Gte,
            "in" => Operator::In,
            "not-in" => Operator::NotIn,
            "array-contains" => Operator::ArrayContains,
            "array-contains-any" => Operator::ArrayContainsAny,
            other => return Err(NestDocError::InvalidQuery(format!("Unknown operator: {other}"))),
        })
    }
}

/// A single `field operator value` constraint
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Filter {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Whether a document's fields satisfy this filter. Absent fields never match.
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        let Some(actual) = fields.get(&self.field) else {
            return false;
        };

        match self.op {
            Operator::Eq => values_equal(actual, &self.value),
            Operator::Ne => !actual.is_null() && !values_equal(actual, &self.value),
            Operator::Lt => range_cmp(actual, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(range_cmp(actual, &self.value), Some(Ordering::Less | Ordering::Equal)),
            Operator::Gt => range_cmp(actual, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(range_cmp(actual, &self.value), Some(Ordering::Greater | Ordering::Equal)),
            Operator::In => list(&self.value).iter().any(|v| values_equal(actual, v)),
            Operator::NotIn => {
                !actual.is_null() && !list(&self.value).iter().any(|v| values_equal(actual, v))
            }
            Operator::ArrayContains => match actual {
                Value::Array(items) => items.iter().any(|item| values_equal(item, &self.value)),
                _ => false,
            },
            Operator::ArrayContainsAny => match actual {
                Value::Array(items) => items
                    .iter()
                    .any(|item| list(&self.value).iter().any(|v| values_equal(item, v))),
                _ => false,
            },
        }
    }
}

fn list(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items,
        _ => &[],
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Filters (combined conjunctively), ordering and an optional limit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    filters: Vec<Filter>,
    ordering: Vec<OrderBy>,
    limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Operator::Eq, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.ordering.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn ordering(&self) -> &[OrderBy] {
        &self.ordering
    }

    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    /// Check operand shapes before the query reaches a backend
    pub fn validate(&self) -> Result<()> {
        for filter in &self.filters {
            if filter.field.is_empty() {
                return Err(NestDocError::InvalidQuery("Filter on an empty field name".into()));
            }
            if filter.op.takes_list() {
                match &filter.value {
                    Value::Array(items) if !items.is_empty() => {}
                    _ => {
                        return Err(NestDocError::InvalidQuery(format!(
                            "'{}' on '{}' requires a non-empty list",
                            filter.op, filter.field
                        )));
                    }
                }
            }
        }
        for order in &self.ordering {
            if order.field.is_empty() {
                return Err(NestDocError::InvalidQuery("Ordering on an empty field name".into()));
            }
        }
        Ok(())
    }

    /// Whether a document belongs in the result set.
    /// Ordering on a field excludes documents that lack it.
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        self.filters.iter().all(|f| f.matches(fields))
            && self.ordering.iter().all(|o| fields.contains_key(&o.field))
    }

    /// Result order of two matching documents; ties fall back to the document path.
    pub fn compare(
        &self,
        a: (&DocumentPath, &Map<String, Value>),
        b: (&DocumentPath, &Map<String, Value>),
    ) -> Ordering {
        for order in &self.ordering {
            let cmp = match (a.1.get(&order.field), b.1.get(&order.field)) {
                (Some(x), Some(y)) => compare_values(x, y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let cmp = match order.direction {
                Direction::Ascending => cmp,
                Direction::Descending => cmp.reverse(),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        a.0.cmp(b.0)
    }
}

/// Where a query runs: one collection instance, or every instance of a name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryTarget {
    Collection(CollectionPath),
    Group(CollectionGroup),
}

impl QueryTarget {
    pub fn contains(&self, doc: &DocumentPath) -> bool {
        match self {
            QueryTarget::Collection(collection) => collection.contains(doc),
            QueryTarget::Group(group) => group.contains(doc),
        }
    }

    pub fn collection_name(&self) -> &str {
        match self {
            QueryTarget::Collection(collection) => collection.collection_name(),
            QueryTarget::Group(group) => group.name(),
        }
    }
}

impl fmt::Display for QueryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryTarget::Collection(collection) => write!(f, "{collection}"),
            QueryTarget::Group(group) => write!(f, "{group}"),
        }
    }
}

// ── Value comparison ───────────────────────────────────────────────

/// Type priority for mixed-type ordering
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < booleans < numbers < strings < arrays < objects
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (i, j) in x.iter().zip(y) {
                let cmp = compare_values(i, j);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y) {
                let cmp = ka.cmp(kb).then_with(|| compare_values(va, vb));
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Integers compare exactly across the i64 and u64 ranges; floats fall back to f64
fn compare_numbers(x: &Number, y: &Number) -> Ordering {
    if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
        return i.cmp(&j);
    }
    if let (Some(i), Some(j)) = (x.as_u64(), y.as_u64()) {
        return i.cmp(&j);
    }
    // one side negative, the other above i64::MAX
    if x.is_i64() && y.is_u64() {
        return Ordering::Less;
    }
    if x.is_u64() && y.is_i64() {
        return Ordering::Greater;
    }
    let f1 = x.as_f64().unwrap_or(0.0);
    let f2 = y.as_f64().unwrap_or(0.0);
    f1.partial_cmp(&f2).unwrap_or(Ordering::Equal)
}

/// Equality with numeric normalization (`1 == 1.0`)
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// Range comparison only holds between non-null values of the same type
fn range_cmp(actual: &Value, bound: &Value) -> Option<Ordering> {
    if actual.is_null() || type_rank(actual) != type_rank(bound) {
        return None;
    }
    Some(compare_values(actual, bound))
}
