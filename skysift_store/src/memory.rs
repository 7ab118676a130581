//! In-memory reference implementation of the key-value store contract.
//!
//! Used by tests and the demo binary. All operations on one store serialize
//! through a single lock, which trivially satisfies the atomicity the
//! contract requires; a networked implementation would use the backing
//! store's conditional-write primitives instead.

use crate::kv::{apply_mutation, check_condition, Condition, KvError, KvStore, Mutation, RecordKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;

type Table = BTreeMap<(String, String), Value>;

#[derive(Debug, Default)]
pub struct MemoryKvStore {
	tables: RwLock<HashMap<String, Table>>,
}

impl MemoryKvStore {
	pub fn new() -> Self {
		MemoryKvStore::default()
	}

	fn flat_key(key: &RecordKey) -> (String, String) {
		(key.partition.clone(), key.sort.clone().unwrap_or_default())
	}
}

#[async_trait]
impl KvStore for MemoryKvStore {
	async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Value>, KvError> {
		let tables = self.tables.read();
		Ok(tables
			.get(table)
			.and_then(|t| t.get(&Self::flat_key(key)))
			.cloned())
	}

	async fn put(&self, table: &str, key: &RecordKey, item: Value) -> Result<(), KvError> {
		let mut tables = self.tables.write();
		tables
			.entry(table.to_string())
			.or_default()
			.insert(Self::flat_key(key), item);
		Ok(())
	}

	async fn put_if(
		&self,
		table: &str,
		key: &RecordKey,
		item: Value,
		condition: Condition,
	) -> Result<(), KvError> {
		let mut tables = self.tables.write();
		let entries = tables.entry(table.to_string()).or_default();
		let flat = Self::flat_key(key);
		if !check_condition(entries.get(&flat), &condition) {
			return Err(KvError::condition_failed(key));
		}
		entries.insert(flat, item);
		Ok(())
	}

	async fn update(
		&self,
		table: &str,
		key: &RecordKey,
		conditions: &[Condition],
		mutations: &[Mutation],
	) -> Result<Value, KvError> {
		let mut tables = self.tables.write();
		let entries = tables.entry(table.to_string()).or_default();
		let flat = Self::flat_key(key);

		let current = entries.get(&flat);
		for condition in conditions {
			if !check_condition(current, condition) {
				return Err(KvError::condition_failed(key));
			}
		}

		let mut item = current.cloned().unwrap_or_else(|| Value::Object(Default::default()));
		for mutation in mutations {
			apply_mutation(&mut item, mutation);
		}
		entries.insert(flat, item.clone());
		Ok(item)
	}

	async fn query(&self, table: &str, partition: &str) -> Result<Vec<Value>, KvError> {
		let tables = self.tables.read();
		Ok(tables
			.get(table)
			.map(|t| {
				t.iter()
					.filter(|((p, _), _)| p == partition)
					.map(|(_, v)| v.clone())
					.collect()
			})
			.unwrap_or_default())
	}

	async fn scan(&self, table: &str) -> Result<Vec<Value>, KvError> {
		let tables = self.tables.read();
		Ok(tables
			.get(table)
			.map(|t| t.values().cloned().collect())
			.unwrap_or_default())
	}

	async fn delete(&self, table: &str, key: &RecordKey) -> Result<(), KvError> {
		let mut tables = self.tables.write();
		if let Some(t) = tables.get_mut(table) {
			t.remove(&Self::flat_key(key));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::sync::Arc;

	#[tokio::test]
	async fn put_get_roundtrip() {
		let store = MemoryKvStore::new();
		let key = RecordKey::with_sort("image-1", "region-1");
		store.put("regions", &key, json!({"a": 1})).await.unwrap();
		assert_eq!(
			store.get("regions", &key).await.unwrap(),
			Some(json!({"a": 1}))
		);
		assert_eq!(
			store.get("regions", &RecordKey::partition("other")).await.unwrap(),
			None
		);
	}

	#[tokio::test]
	async fn put_if_absent_rejects_duplicates() {
		let store = MemoryKvStore::new();
		let key = RecordKey::partition("endpoint");
		store
			.put_if("stats", &key, json!({"max": 5}), Condition::Absent)
			.await
			.unwrap();
		let err = store
			.put_if("stats", &key, json!({"max": 7}), Condition::Absent)
			.await
			.unwrap_err();
		assert!(matches!(err, KvError::ConditionFailed { .. }));
	}

	#[tokio::test]
	async fn conditional_update_detects_conflicts() {
		let store = MemoryKvStore::new();
		let key = RecordKey::partition("job");
		store.put("jobs", &key, json!({"attempts": 0})).await.unwrap();

		let updated = store
			.update(
				"jobs",
				&key,
				&[Condition::FieldEquals("attempts".into(), json!(0))],
				&[Mutation::Increment("attempts".into(), 1)],
			)
			.await
			.unwrap();
		assert_eq!(updated["attempts"], json!(1));

		// The same conditional update now fails: another writer won.
		let err = store
			.update(
				"jobs",
				&key,
				&[Condition::FieldEquals("attempts".into(), json!(0))],
				&[Mutation::Increment("attempts".into(), 1)],
			)
			.await
			.unwrap_err();
		assert!(matches!(err, KvError::ConditionFailed { .. }));
	}

	#[tokio::test]
	async fn concurrent_increments_never_lose_updates() {
		let store = Arc::new(MemoryKvStore::new());
		let key = RecordKey::partition("image");
		store.put("jobs", &key, json!({"region_success": 0})).await.unwrap();

		let mut handles = vec![];
		for _ in 0..32 {
			let store = store.clone();
			let key = key.clone();
			handles.push(tokio::spawn(async move {
				store
					.update(
						"jobs",
						&key,
						&[],
						&[Mutation::Increment("region_success".into(), 1)],
					)
					.await
					.unwrap();
			}));
		}
		futures::future::join_all(handles).await;

		let item = store.get("jobs", &key).await.unwrap().unwrap();
		assert_eq!(item["region_success"], json!(32));
	}

	#[tokio::test]
	async fn query_filters_by_partition() {
		let store = MemoryKvStore::new();
		for i in 0..3 {
			store
				.put(
					"features",
					&RecordKey::with_sort("image-1", &format!("row-{i}")),
					json!({"i": i}),
				)
				.await
				.unwrap();
		}
		store
			.put("features", &RecordKey::with_sort("image-2", "row-0"), json!({"i": 9}))
			.await
			.unwrap();

		assert_eq!(store.query("features", "image-1").await.unwrap().len(), 3);
		assert_eq!(store.scan("features").await.unwrap().len(), 4);
	}
}
