//! The key-value store contract used by all progress tables.
//!
//! The contract is deliberately small: records are JSON objects addressed by
//! a partition key and an optional sort key. Updates carry typed conditions
//! and mutations so that a store can apply them atomically; a failed
//! condition surfaces as [`KvError::ConditionFailed`], which is how the
//! one-writer and set-semantics guarantees of the scheduler and the progress
//! tables are implemented.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;

/// Address of a record within a table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
	pub partition: String,
	pub sort: Option<String>,
}

impl RecordKey {
	pub fn partition(partition: &str) -> Self {
		RecordKey {
			partition: partition.to_string(),
			sort: None,
		}
	}

	pub fn with_sort(partition: &str, sort: &str) -> Self {
		RecordKey {
			partition: partition.to_string(),
			sort: Some(sort.to_string()),
		}
	}
}

/// Conditions evaluated against the current record before an update applies.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
	/// The record must exist.
	Exists,
	/// The record must not exist.
	Absent,
	/// A top-level field must equal the given value. Fails when the field is
	/// missing.
	FieldEquals(String, Value),
	/// A top-level list field must not contain the given value. A missing
	/// field passes.
	NotContains(String, Value),
}

/// Atomic record mutations.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
	/// Sets a top-level field.
	Set(String, Value),
	/// Adds to a numeric field, treating a missing field as zero.
	Increment(String, i64),
	/// Appends to a list field, treating a missing field as the empty list.
	ListAppend(String, Value),
}

#[derive(thiserror::Error, Debug)]
pub enum KvError {
	#[error("conditional check failed for {partition}/{sort:?}")]
	ConditionFailed {
		partition: String,
		sort: Option<String>,
	},
	#[error("record not found: {partition}/{sort:?}")]
	NotFound {
		partition: String,
		sort: Option<String>,
	},
	#[error("store failure: {0}")]
	Store(String),
}

impl KvError {
	pub fn condition_failed(key: &RecordKey) -> Self {
		KvError::ConditionFailed {
			partition: key.partition.clone(),
			sort: key.sort.clone(),
		}
	}

	pub fn not_found(key: &RecordKey) -> Self {
		KvError::NotFound {
			partition: key.partition.clone(),
			sort: key.sort.clone(),
		}
	}
}

/// Store contract. Implementations must apply `update` atomically: the
/// conditions are evaluated and the mutations applied under the same
/// isolation, so concurrent writers serialize per record.
#[async_trait]
pub trait KvStore: Send + Sync + Debug {
	async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Value>, KvError>;

	/// Unconditional full-record write.
	async fn put(&self, table: &str, key: &RecordKey, item: Value) -> Result<(), KvError>;

	/// Full-record write gated on a condition against the current record.
	async fn put_if(
		&self,
		table: &str,
		key: &RecordKey,
		item: Value,
		condition: Condition,
	) -> Result<(), KvError>;

	/// Conditional partial update, returning the record after mutation.
	/// Updating an absent record creates it unless a condition forbids that.
	async fn update(
		&self,
		table: &str,
		key: &RecordKey,
		conditions: &[Condition],
		mutations: &[Mutation],
	) -> Result<Value, KvError>;

	/// All records sharing a partition key.
	async fn query(&self, table: &str, partition: &str) -> Result<Vec<Value>, KvError>;

	/// Every record in a table. Callers are expected to bound table sizes.
	async fn scan(&self, table: &str) -> Result<Vec<Value>, KvError>;

	async fn delete(&self, table: &str, key: &RecordKey) -> Result<(), KvError>;
}

/// Evaluates a condition against the current state of a record.
pub(crate) fn check_condition(item: Option<&Value>, condition: &Condition) -> bool {
	match condition {
		Condition::Exists => item.is_some(),
		Condition::Absent => item.is_none(),
		Condition::FieldEquals(field, expected) => item
			.and_then(|i| i.get(field))
			.map(|v| v == expected)
			.unwrap_or(false),
		Condition::NotContains(field, value) => item
			.and_then(|i| i.get(field))
			.and_then(Value::as_array)
			.map(|list| !list.contains(value))
			.unwrap_or(true),
	}
}

/// Applies a mutation to a record object in place.
pub(crate) fn apply_mutation(item: &mut Value, mutation: &Mutation) {
	let Some(object) = item.as_object_mut() else {
		return;
	};
	match mutation {
		Mutation::Set(field, value) => {
			object.insert(field.clone(), value.clone());
		}
		Mutation::Increment(field, amount) => {
			let current = object.get(field).and_then(Value::as_i64).unwrap_or(0);
			object.insert(field.clone(), Value::from(current + amount));
		}
		Mutation::ListAppend(field, value) => {
			let entry = object
				.entry(field.clone())
				.or_insert_with(|| Value::Array(vec![]));
			if let Some(list) = entry.as_array_mut() {
				list.push(value.clone());
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn conditions_evaluate_against_missing_records() {
		assert!(!check_condition(None, &Condition::Exists));
		assert!(check_condition(None, &Condition::Absent));
		assert!(!check_condition(
			None,
			&Condition::FieldEquals("a".into(), json!(1))
		));
		assert!(check_condition(
			None,
			&Condition::NotContains("a".into(), json!(1))
		));
	}

	#[test]
	fn not_contains_matches_list_membership() {
		let item = json!({"regions": ["r1", "r2"]});
		assert!(!check_condition(
			Some(&item),
			&Condition::NotContains("regions".into(), json!("r1"))
		));
		assert!(check_condition(
			Some(&item),
			&Condition::NotContains("regions".into(), json!("r3"))
		));
	}

	#[test]
	fn mutations_apply_with_defaults() {
		let mut item = json!({});
		apply_mutation(&mut item, &Mutation::Increment("count".into(), 2));
		apply_mutation(&mut item, &Mutation::Increment("count".into(), 1));
		apply_mutation(&mut item, &Mutation::ListAppend("list".into(), json!("x")));
		apply_mutation(&mut item, &Mutation::Set("field".into(), json!("y")));
		assert_eq!(item, json!({"count": 3, "list": ["x"], "field": "y"}));
	}
}
