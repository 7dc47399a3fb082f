//! Shared document store contract
//!
//! The matchmaking core never talks to a concrete database. It consumes the
//! small set of primitives below through the `DocumentStore` trait. Only
//! `transact` is required to be atomic: it reads a set of documents and applies
//! a conditional write in one indivisible step.

pub mod guarded;
pub mod memory;

pub use guarded::GuardedStore;
pub use memory::InMemoryDocumentStore;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A stored document: store-assigned id plus its JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Top-level field lookup
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Condition on a single top-level field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    Eq(String, Value),
    NotEq(String, Value),
    /// The field is an array containing the value
    ArrayContains(String, Value),
}

impl FieldFilter {
    pub fn matches(&self, data: &Value) -> bool {
        match self {
            FieldFilter::Eq(field, expected) => data.get(field) == Some(expected),
            FieldFilter::NotEq(field, expected) => data.get(field) != Some(expected),
            FieldFilter::ArrayContains(field, expected) => data
                .get(field)
                .and_then(Value::as_array)
                .map(|items| items.contains(expected))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// Filtered, ordered, bounded read over one collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<FieldFilter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters
            .push(FieldFilter::Eq(field.to_string(), value.into()));
        self
    }

    pub fn where_not_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters
            .push(FieldFilter::NotEq(field.to_string(), value.into()));
        self
    }

    pub fn where_array_contains(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters
            .push(FieldFilter::ArrayContains(field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.filters.iter().all(|filter| filter.matches(data))
    }
}

/// Ordering used for `order_by`: missing < null < bool < number < string
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(f64::NAN)
                .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// A write applied when a transaction commits
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Merge top-level fields into an existing document. Fails the
    /// transaction if the document does not exist.
    Update {
        id: String,
        fields: Map<String, Value>,
    },
    Delete {
        id: String,
    },
}

/// What a transaction body decided after inspecting its snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionDecision {
    Commit(Vec<Write>),
    Abort(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Committed,
    Aborted(String),
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed)
    }
}

/// Transaction body. Receives the current version of each requested id, in
/// request order (`None` for missing documents). Stores may run it more than
/// once, so it must be free of side effects.
pub type TransactionFn = Box<dyn Fn(&[Option<Document>]) -> TransactionDecision + Send + Sync>;

/// Primitives consumed from the shared document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document and return its store-assigned id
    async fn insert(&self, collection: &str, data: Value) -> Result<String>;

    /// Read a single document
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Delete a document. Deleting a missing id is not an error.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Run a filtered, ordered, bounded query
    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>>;

    /// Atomically read `read_ids` and apply whatever `decide` returns
    async fn transact(
        &self,
        collection: &str,
        read_ids: &[String],
        decide: TransactionFn,
    ) -> Result<TransactionOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filters() {
        let data = json!({"status": "Searching", "userId": "alice", "tags": ["a", "b"]});

        assert!(FieldFilter::Eq("status".into(), json!("Searching")).matches(&data));
        assert!(!FieldFilter::Eq("status".into(), json!("Claimed")).matches(&data));
        assert!(FieldFilter::NotEq("userId".into(), json!("bob")).matches(&data));
        assert!(!FieldFilter::NotEq("userId".into(), json!("alice")).matches(&data));
        assert!(FieldFilter::ArrayContains("tags".into(), json!("b")).matches(&data));
        assert!(!FieldFilter::ArrayContains("userId".into(), json!("alice")).matches(&data));
        // A missing field is "not equal" to anything
        assert!(FieldFilter::NotEq("missing".into(), json!(1)).matches(&data));
    }

    #[test]
    fn test_query_builder() {
        let query = Query::new()
            .where_eq("status", "Searching")
            .where_not_eq("userId", "alice")
            .order_by("createdAt", SortDirection::Ascending)
            .limit(10);

        assert_eq!(query.filters.len(), 2);
        assert_eq!(query.limit, Some(10));
        assert!(query.matches(&json!({"status": "Searching", "userId": "bob"})));
        assert!(!query.matches(&json!({"status": "Searching", "userId": "alice"})));
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(
            compare_values(Some(&json!(1)), Some(&json!(2))),
            Ordering::Less
        );
        assert_eq!(
            compare_values(Some(&json!(1_700_000_000_000_001_i64)), Some(&json!(1_700_000_000_000_000_i64))),
            Ordering::Greater
        );
        assert_eq!(compare_values(None, Some(&json!(0))), Ordering::Less);
        assert_eq!(
            compare_values(Some(&json!("b")), Some(&json!("a"))),
            Ordering::Greater
        );
    }
}
