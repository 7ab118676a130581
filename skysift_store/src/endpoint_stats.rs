//! Endpoint load statistics shared by every worker.
//!
//! One record per model endpoint holding the number of regions currently in
//! flight and the capacity ceiling. Claims are admitted only while
//! `regions_in_progress < max_regions`; the counters are atomic and the
//! decrement is only ever issued by the region handler that performed the
//! matching increment, so the count never goes below zero.

use crate::kv::{Condition, KvError, KvStore, Mutation, RecordKey};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointStatisticsRecord {
	pub endpoint: String,
	#[serde(default)]
	pub regions_in_progress: i64,
	#[serde(default)]
	pub max_regions: i64,
}

/// Accessor for the endpoint statistics table.
#[derive(Clone, Debug)]
pub struct EndpointStatisticsTable {
	store: Arc<dyn KvStore>,
	table_name: String,
}

impl EndpointStatisticsTable {
	pub fn new(store: Arc<dyn KvStore>, table_name: &str) -> Self {
		EndpointStatisticsTable {
			store,
			table_name: table_name.to_string(),
		}
	}

	/// Creates the endpoint entry, or refreshes `max_regions` when the
	/// endpoint is already tracked. Capacity changes when an endpoint scales,
	/// so the ceiling is rewritten rather than the whole record.
	pub async fn upsert_endpoint(&self, endpoint: &str, max_regions: i64) -> Result<()> {
		log::debug!("setting max region count for endpoint {endpoint} to {max_regions}");
		let key = RecordKey::partition(endpoint);
		let fresh = serde_json::to_value(EndpointStatisticsRecord {
			endpoint: endpoint.to_string(),
			regions_in_progress: 0,
			max_regions,
		})?;

		match self
			.store
			.put_if(&self.table_name, &key, fresh, Condition::Absent)
			.await
		{
			Ok(()) => Ok(()),
			Err(KvError::ConditionFailed { .. }) => {
				self
					.store
					.update(
						&self.table_name,
						&key,
						&[],
						&[Mutation::Set("max_regions".to_string(), json!(max_regions))],
					)
					.await
					.context("failed to refresh endpoint capacity")?;
				Ok(())
			}
			Err(err) => Err(err).context("failed to upsert endpoint statistics"),
		}
	}

	pub async fn increment_region_count(&self, endpoint: &str) -> Result<()> {
		self
			.store
			.update(
				&self.table_name,
				&RecordKey::partition(endpoint),
				&[],
				&[Mutation::Increment("regions_in_progress".to_string(), 1)],
			)
			.await
			.context("failed to increment in-progress region count")?;
		Ok(())
	}

	pub async fn decrement_region_count(&self, endpoint: &str) -> Result<()> {
		self
			.store
			.update(
				&self.table_name,
				&RecordKey::partition(endpoint),
				&[],
				&[Mutation::Increment("regions_in_progress".to_string(), -1)],
			)
			.await
			.context("failed to decrement in-progress region count")?;
		Ok(())
	}

	pub async fn current_in_progress_regions(&self, endpoint: &str) -> Result<i64> {
		let key = RecordKey::partition(endpoint);
		let item = self
			.store
			.get(&self.table_name, &key)
			.await?
			.ok_or_else(|| KvError::not_found(&key))
			.context("endpoint statistics not found")?;
		let record: EndpointStatisticsRecord = serde_json::from_value(item)?;
		Ok(record.regions_in_progress)
	}

	pub async fn max_regions(&self, endpoint: &str) -> Result<i64> {
		let key = RecordKey::partition(endpoint);
		let item = self
			.store
			.get(&self.table_name, &key)
			.await?
			.ok_or_else(|| KvError::not_found(&key))
			.context("endpoint statistics not found")?;
		let record: EndpointStatisticsRecord = serde_json::from_value(item)?;
		Ok(record.max_regions)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::MemoryKvStore;

	fn table() -> EndpointStatisticsTable {
		EndpointStatisticsTable::new(Arc::new(MemoryKvStore::new()), "endpoints")
	}

	#[tokio::test]
	async fn upsert_preserves_in_progress_count() {
		let table = table();
		table.upsert_endpoint("detector", 5).await.unwrap();
		table.increment_region_count("detector").await.unwrap();
		// A second upsert only refreshes the ceiling.
		table.upsert_endpoint("detector", 8).await.unwrap();
		assert_eq!(table.current_in_progress_regions("detector").await.unwrap(), 1);
		assert_eq!(table.max_regions("detector").await.unwrap(), 8);
	}

	#[tokio::test]
	async fn paired_increments_and_decrements_balance() {
		let table = table();
		table.upsert_endpoint("detector", 5).await.unwrap();
		for _ in 0..3 {
			table.increment_region_count("detector").await.unwrap();
		}
		for _ in 0..3 {
			table.decrement_region_count("detector").await.unwrap();
		}
		assert_eq!(table.current_in_progress_regions("detector").await.unwrap(), 0);
	}

	#[tokio::test]
	async fn interleaved_updates_stay_non_negative() {
		let table = Arc::new(table());
		table.upsert_endpoint("detector", 64).await.unwrap();

		let mut handles = vec![];
		for _ in 0..16 {
			let table = table.clone();
			handles.push(tokio::spawn(async move {
				table.increment_region_count("detector").await.unwrap();
				table.decrement_region_count("detector").await.unwrap();
			}));
		}
		futures::future::join_all(handles).await;

		assert_eq!(table.current_in_progress_regions("detector").await.unwrap(), 0);
	}
}
