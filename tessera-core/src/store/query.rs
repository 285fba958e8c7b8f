//! Attribute Queries and Match Expressions
//!
//! An [`AttributeQuery`] is a typed tree describing which fields of a record to
//! read and which relations to follow. A [`MatchExpr`] selects records.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::{Record, RecordId, LINK_SYMBOL};

/// One node of an attribute query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryNode {
    /// Every own field of the record.
    AllFields,
    /// A single own field.
    Field(String),
    /// Follow a relation attribute and read the related record(s).
    Nested {
        attribute: String,
        query: AttributeQuery,
    },
    /// Fields owned by the relation row that led to this record, exposed under
    /// the `&` segment.
    RelationOwnFields(AttributeQuery),
}

/// Which fields to read from a record, including nested relation traversal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeQuery(Vec<QueryNode>);

impl AttributeQuery {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// A query reading every own field.
    pub fn all() -> Self {
        Self(vec![QueryNode::AllFields])
    }

    /// A query reading the given own fields.
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(|n| QueryNode::Field(n.into())).collect())
    }

    /// Build a query reading the field at `path`, descending through relations.
    ///
    /// A `&` segment reads the relation row's own fields instead of following
    /// another relation.
    pub fn path<S: AsRef<str>>(path: &[S]) -> Self {
        match path.split_first() {
            None => Self::new(),
            Some((last, [])) => Self::fields([last.as_ref()]),
            Some((first, rest)) if first.as_ref() == LINK_SYMBOL => {
                Self(vec![QueryNode::RelationOwnFields(Self::path(rest))])
            }
            Some((first, rest)) => Self(vec![QueryNode::Nested {
                attribute: first.as_ref().to_string(),
                query: Self::path(rest),
            }]),
        }
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.0.push(QueryNode::Field(name.into()));
        self
    }

    pub fn nested(mut self, attribute: impl Into<String>, query: AttributeQuery) -> Self {
        self.0.push(QueryNode::Nested {
            attribute: attribute.into(),
            query,
        });
        self
    }

    pub fn relation_fields(mut self, query: AttributeQuery) -> Self {
        self.0.push(QueryNode::RelationOwnFields(query));
        self
    }

    pub fn nodes(&self) -> &[QueryNode] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if the query reads every own field.
    pub fn reads_all_fields(&self) -> bool {
        self.0.iter().any(|n| matches!(n, QueryNode::AllFields))
    }

    /// Own fields named explicitly at this level.
    pub fn own_fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter_map(|n| match n {
            QueryNode::Field(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Nested relation reads at this level.
    pub fn nested_nodes(&self) -> impl Iterator<Item = (&str, &AttributeQuery)> {
        self.0.iter().filter_map(|n| match n {
            QueryNode::Nested { attribute, query } => Some((attribute.as_str(), query)),
            _ => None,
        })
    }

    /// The relation-own-field query at this level, if any.
    pub fn relation_own(&self) -> Option<&AttributeQuery> {
        self.0.iter().find_map(|n| match n {
            QueryNode::RelationOwnFields(q) => Some(q),
            _ => None,
        })
    }

    /// Own fields read at this level, or `None` if the query reads all of them.
    pub fn watched_fields(&self) -> Option<Vec<String>> {
        if self.reads_all_fields() {
            None
        } else {
            Some(self.own_fields().map(str::to_string).collect())
        }
    }

    /// The path to the first field leaf, following nested nodes depth-first.
    pub fn leaf_path(&self) -> Option<Vec<String>> {
        for node in &self.0 {
            match node {
                QueryNode::Field(name) => return Some(vec![name.clone()]),
                QueryNode::Nested { attribute, query } => {
                    if let Some(mut rest) = query.leaf_path() {
                        rest.insert(0, attribute.clone());
                        return Some(rest);
                    }
                }
                QueryNode::RelationOwnFields(query) => {
                    if let Some(mut rest) = query.leaf_path() {
                        rest.insert(0, LINK_SYMBOL.to_string());
                        return Some(rest);
                    }
                }
                QueryNode::AllFields => {}
            }
        }
        None
    }

    /// Merge another query's nodes into this one.
    pub fn merged(mut self, other: &AttributeQuery) -> Self {
        for node in &other.0 {
            if !self.0.contains(node) {
                self.0.push(node.clone());
            }
        }
        self
    }
}

/// Comparison operator of a match condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
}

/// Record selection predicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchExpr {
    /// Matches every record.
    #[default]
    All,
    Cond {
        /// Dotted field path.
        key: String,
        op: MatchOp,
        value: Value,
    },
    And(Vec<MatchExpr>),
    Or(Vec<MatchExpr>),
    Not(Box<MatchExpr>),
}

impl MatchExpr {
    pub fn cond(key: impl Into<String>, op: MatchOp, value: impl Into<Value>) -> Self {
        Self::Cond {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cond(key, MatchOp::Eq, value)
    }

    pub fn id(id: impl Into<Value>) -> Self {
        Self::eq("id", id)
    }

    /// Conjoin with another expression, flattening nested `And`s.
    pub fn and(self, other: MatchExpr) -> Self {
        match (self, other) {
            (MatchExpr::All, other) => other,
            (this, MatchExpr::All) => this,
            (MatchExpr::And(mut left), MatchExpr::And(right)) => {
                left.extend(right);
                MatchExpr::And(left)
            }
            (MatchExpr::And(mut left), other) => {
                left.push(other);
                MatchExpr::And(left)
            }
            (this, other) => MatchExpr::And(vec![this, other]),
        }
    }

    pub fn or(self, other: MatchExpr) -> Self {
        match self {
            MatchExpr::Or(mut items) => {
                items.push(other);
                MatchExpr::Or(items)
            }
            this => MatchExpr::Or(vec![this, other]),
        }
    }

    pub fn negate(self) -> Self {
        MatchExpr::Not(Box::new(self))
    }

    /// The id selected by a plain `id = x` condition.
    pub fn as_id(&self) -> Option<RecordId> {
        match self {
            MatchExpr::Cond {
                key,
                op: MatchOp::Eq,
                value,
            } if key == "id" => RecordId::from_value(value),
            _ => None,
        }
    }

    /// Evaluate the predicate against a record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            MatchExpr::All => true,
            MatchExpr::Cond { key, op, value } => {
                let path: Vec<&str> = key.split('.').collect();
                let actual = record.lookup(&path).unwrap_or(&Value::Null);
                compare(actual, *op, value)
            }
            MatchExpr::And(items) => items.iter().all(|m| m.matches(record)),
            MatchExpr::Or(items) => items.iter().any(|m| m.matches(record)),
            MatchExpr::Not(inner) => !inner.matches(record),
        }
    }
}

fn compare(actual: &Value, op: MatchOp, expected: &Value) -> bool {
    match op {
        MatchOp::Eq => loosely_equal(actual, expected),
        MatchOp::Ne => !loosely_equal(actual, expected),
        MatchOp::In => expected
            .as_array()
            .is_some_and(|items| items.iter().any(|item| loosely_equal(actual, item))),
        MatchOp::Gt => order(actual, expected) == Some(Ordering::Greater),
        MatchOp::Ge => matches!(order(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        MatchOp::Lt => order(actual, expected) == Some(Ordering::Less),
        MatchOp::Le => matches!(order(actual, expected), Some(Ordering::Less | Ordering::Equal)),
    }
}

/// Numbers compare by value so `1` equals `1.0`; related objects compare by id.
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Object(a), Value::Number(_)) => a.get("id").is_some_and(|id| loosely_equal(id, expected)),
        _ => actual == expected,
    }
}

pub(crate) fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Pagination and ordering for reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Field name and ascending flag.
    pub order_by: Option<(String, bool)>,
}

impl Modifier {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_builds_nested_query() {
        let query = AttributeQuery::path(&["items", "&", "quantity"]);
        assert_eq!(
            query,
            AttributeQuery::new().nested(
                "items",
                AttributeQuery::new().relation_fields(AttributeQuery::fields(["quantity"]))
            )
        );
        assert_eq!(
            query.leaf_path(),
            Some(vec!["items".to_string(), "&".to_string(), "quantity".to_string()])
        );
    }

    #[test]
    fn match_expr_evaluates_conditions() {
        let record = Record::from_value(json!({"id": 1, "age": 30, "name": "a", "owner": {"id": 4}})).unwrap();
        assert!(MatchExpr::eq("age", 30.0).matches(&record));
        assert!(MatchExpr::cond("age", MatchOp::Gt, 18).and(MatchExpr::eq("name", "a")).matches(&record));
        assert!(MatchExpr::cond("name", MatchOp::In, json!(["a", "b"])).matches(&record));
        assert!(MatchExpr::eq("owner", 4).matches(&record));
        assert!(MatchExpr::eq("owner.id", 4).matches(&record));
        assert!(!MatchExpr::eq("age", 31).negate().negate().matches(&record));
        assert_eq!(MatchExpr::id(7).as_id(), Some(RecordId::new(7)));
        assert_eq!(MatchExpr::eq("age", 7).as_id(), None);
    }

    #[test]
    fn and_flattens() {
        let expr = MatchExpr::All
            .and(MatchExpr::eq("a", 1))
            .and(MatchExpr::eq("b", 2))
            .and(MatchExpr::eq("c", 3));
        match expr {
            MatchExpr::And(items) => assert_eq!(items.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
