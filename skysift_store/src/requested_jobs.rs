//! The lookahead table behind the buffered request queue.
//!
//! Holds one record per outstanding image request so the scheduler can see
//! more than the head of the input queue. Records are removed once the image
//! finishes or exhausts its attempts; the table never keeps history, so a
//! full scan stays bounded by the lookahead limit.
//!
//! `start_next_attempt` implements one-writer semantics through a conditional
//! update on `num_attempts`: of any number of workers claiming the same
//! record, exactly one succeeds per attempt value.

use crate::kv::{Condition, KvError, KvStore, Mutation, RecordKey};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use skysift_core::types::epoch_seconds;
use std::sync::Arc;

/// Status record for one outstanding image request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRequestStatusRecord {
	/// The model endpoint the request targets.
	pub endpoint_id: String,
	pub job_id: String,
	/// Epoch seconds when the request entered the lookahead table.
	pub request_time: i64,
	/// The full image request message, replayed when an attempt starts.
	pub request_payload: Value,
	/// Epoch seconds of the last attempt, zero before the first.
	pub last_attempt: i64,
	pub num_attempts: i64,
	/// Region ids recorded complete, with set semantics.
	pub regions_complete: Vec<String>,
	/// Total regions, set by the image handler after fan-out.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region_count: Option<i64>,
}

impl ImageRequestStatusRecord {
	pub fn new(endpoint_id: &str, job_id: &str, request_payload: Value) -> Self {
		ImageRequestStatusRecord {
			endpoint_id: endpoint_id.to_string(),
			job_id: job_id.to_string(),
			request_time: epoch_seconds(),
			request_payload,
			last_attempt: 0,
			num_attempts: 0,
			regions_complete: vec![],
			region_count: None,
		}
	}

	fn key(&self) -> RecordKey {
		RecordKey::with_sort(&self.endpoint_id, &self.job_id)
	}
}

/// Accessor for the lookahead table.
#[derive(Clone, Debug)]
pub struct RequestedJobsTable {
	store: Arc<dyn KvStore>,
	table_name: String,
}

impl RequestedJobsTable {
	pub fn new(store: Arc<dyn KvStore>, table_name: &str) -> Self {
		RequestedJobsTable {
			store,
			table_name: table_name.to_string(),
		}
	}

	/// Adds a fresh status record for a request pulled off the input queue.
	///
	/// A record that already exists is left untouched and returned: a
	/// duplicate queue delivery must not reset the attempt bookkeeping.
	pub async fn add_new_request(
		&self,
		endpoint_id: &str,
		job_id: &str,
		request_payload: Value,
	) -> Result<ImageRequestStatusRecord> {
		let record = ImageRequestStatusRecord::new(endpoint_id, job_id, request_payload);
		let result = self
			.store
			.put_if(
				&self.table_name,
				&record.key(),
				serde_json::to_value(&record)?,
				Condition::Absent,
			)
			.await;
		match result {
			Ok(()) => Ok(record),
			Err(KvError::ConditionFailed { .. }) => {
				log::debug!("request {job_id} is already buffered, ignoring duplicate delivery");
				let existing = self
					.store
					.get(&self.table_name, &record.key())
					.await?
					.ok_or_else(|| KvError::not_found(&record.key()))?;
				Ok(serde_json::from_value(existing)?)
			}
			Err(err) => {
				Err(err).with_context(|| format!("unable to add request {job_id} to the lookahead table"))
			}
		}
	}

	/// Records the total region count once the image handler has fanned out.
	pub async fn update_request_details(
		&self,
		endpoint_id: &str,
		job_id: &str,
		region_count: i64,
	) -> Result<()> {
		self
			.store
			.update(
				&self.table_name,
				&RecordKey::with_sort(endpoint_id, job_id),
				&[Condition::Exists],
				&[Mutation::Set("region_count".to_string(), json!(region_count))],
			)
			.await
			.with_context(|| format!("unable to set region count for {job_id}"))?;
		Ok(())
	}

	/// Every record currently in the table. The scan is acceptable because the
	/// buffered queue bounds the table size by its lookahead limit.
	pub async fn get_outstanding_requests(&self) -> Result<Vec<ImageRequestStatusRecord>> {
		let items = self
			.store
			.scan(&self.table_name)
			.await
			.context("unable to scan the lookahead table")?;
		items
			.into_iter()
			.map(|item| Ok(serde_json::from_value(item)?))
			.collect()
	}

	/// Claims the record for one processing attempt.
	///
	/// Returns `false` when another worker claimed it first; any other store
	/// failure propagates.
	pub async fn start_next_attempt(&self, record: &ImageRequestStatusRecord) -> Result<bool> {
		let result = self
			.store
			.update(
				&self.table_name,
				&record.key(),
				&[Condition::FieldEquals(
					"num_attempts".to_string(),
					json!(record.num_attempts),
				)],
				&[
					Mutation::Set("last_attempt".to_string(), json!(epoch_seconds())),
					Mutation::Increment("num_attempts".to_string(), 1),
				],
			)
			.await;
		match result {
			Ok(_) => Ok(true),
			Err(KvError::ConditionFailed { .. }) => {
				log::debug!(
					"attempt on {} not started, another worker got to it first",
					record.job_id
				);
				Ok(false)
			}
			Err(err) => Err(err).context("unable to start next attempt"),
		}
	}

	/// Removes a finished (or abandoned) request from the table.
	pub async fn complete_request(&self, endpoint_id: &str, job_id: &str) -> Result<()> {
		self
			.store
			.delete(&self.table_name, &RecordKey::with_sort(endpoint_id, job_id))
			.await
			.with_context(|| format!("unable to remove {job_id} from the lookahead table"))?;
		Ok(())
	}

	/// Marks a region complete with set semantics: appending an id that is
	/// already present is a no-op reported as `false`.
	pub async fn complete_region(
		&self,
		endpoint_id: &str,
		job_id: &str,
		region_id: &str,
	) -> Result<bool> {
		let result = self
			.store
			.update(
				&self.table_name,
				&RecordKey::with_sort(endpoint_id, job_id),
				&[
					Condition::Exists,
					Condition::NotContains("regions_complete".to_string(), json!(region_id)),
				],
				&[Mutation::ListAppend(
					"regions_complete".to_string(),
					json!(region_id),
				)],
			)
			.await;
		match result {
			Ok(_) => Ok(true),
			Err(KvError::ConditionFailed { .. }) => {
				log::debug!("region {region_id} was already marked complete for {job_id}");
				Ok(false)
			}
			Err(err) => Err(err).context("unable to record completed region"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::MemoryKvStore;

	fn table() -> RequestedJobsTable {
		RequestedJobsTable::new(Arc::new(MemoryKvStore::new()), "requested_jobs")
	}

	#[tokio::test]
	async fn duplicate_add_keeps_the_original_record() {
		let table = table();
		let record = table
			.add_new_request("detector", "job-1", json!({"v": 1}))
			.await
			.unwrap();
		table.start_next_attempt(&record).await.unwrap();

		// Redelivery of the same request does not reset the bookkeeping.
		let existing = table
			.add_new_request("detector", "job-1", json!({"v": 1}))
			.await
			.unwrap();
		assert_eq!(existing.num_attempts, 1);
		assert_eq!(table.get_outstanding_requests().await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn record_roundtrips_through_the_table() {
		let table = table();
		let payload = json!({"jobId": "job-1", "imageUrls": ["s3://b/i.ntf"]});
		table
			.add_new_request("detector", "job-1", payload.clone())
			.await
			.unwrap();
		let records = table.get_outstanding_requests().await.unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].request_payload, payload);
		assert_eq!(records[0].num_attempts, 0);
	}

	#[tokio::test]
	async fn exactly_one_claim_succeeds_per_attempt() {
		let table = table();
		let record = table
			.add_new_request("detector", "job-1", json!({}))
			.await
			.unwrap();

		// Two workers hold the same snapshot of the record.
		assert!(table.start_next_attempt(&record).await.unwrap());
		assert!(!table.start_next_attempt(&record).await.unwrap());

		// After re-reading, the next attempt value claims again.
		let refreshed = &table.get_outstanding_requests().await.unwrap()[0];
		assert_eq!(refreshed.num_attempts, 1);
		assert!(table.start_next_attempt(refreshed).await.unwrap());
	}

	#[tokio::test]
	async fn complete_region_is_idempotent() {
		let table = table();
		table
			.add_new_request("detector", "job-1", json!({}))
			.await
			.unwrap();

		assert!(table.complete_region("detector", "job-1", "r-1").await.unwrap());
		assert!(!table.complete_region("detector", "job-1", "r-1").await.unwrap());
		assert!(table.complete_region("detector", "job-1", "r-2").await.unwrap());

		let record = &table.get_outstanding_requests().await.unwrap()[0];
		assert_eq!(record.regions_complete, vec!["r-1", "r-2"]);
	}

	#[tokio::test]
	async fn completed_requests_disappear() {
		let table = table();
		table
			.add_new_request("detector", "job-1", json!({}))
			.await
			.unwrap();
		table.complete_request("detector", "job-1").await.unwrap();
		assert!(table.get_outstanding_requests().await.unwrap().is_empty());
	}
}
