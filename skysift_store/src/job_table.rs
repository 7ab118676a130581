//! Image job tracking.
//!
//! One record per image request, keyed by `image_id`. The region success and
//! error counters are updated atomically as regions finish; the image is
//! complete exactly when their sum reaches `region_count`.

use crate::kv::{KvStore, Mutation, RecordKey};
use crate::RECORD_TTL_SECONDS;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skysift_core::types::{epoch_millis, epoch_seconds, ModelInvokeMode, PixelSize};
use std::sync::Arc;

/// A single row in the image job table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageJobRecord {
	pub image_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub job_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_read_credentials: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model_invoke_mode: Option<ModelInvokeMode>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub start_time: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub end_time: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expire_time: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region_success: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region_error: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region_count: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub width: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub height: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub extents: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tile_size: Option<PixelSize>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tile_overlap: Option<PixelSize>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub outputs: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub processing_duration: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub feature_properties: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub feature_distillation: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub roi_wkt: Option<String>,
}

impl ImageJobRecord {
	pub fn new(image_id: &str) -> Self {
		ImageJobRecord {
			image_id: image_id.to_string(),
			..Default::default()
		}
	}

	fn key(&self) -> RecordKey {
		RecordKey::partition(&self.image_id)
	}
}

/// Accessor for the image job table.
#[derive(Clone, Debug)]
pub struct JobTable {
	store: Arc<dyn KvStore>,
	table_name: String,
}

impl JobTable {
	pub fn new(store: Arc<dyn KvStore>, table_name: &str) -> Self {
		JobTable {
			store,
			table_name: table_name.to_string(),
		}
	}

	/// Starts an image processing request: the first record for this image.
	pub async fn start_image_request(&self, mut record: ImageJobRecord) -> Result<ImageJobRecord> {
		let start_time = epoch_millis();
		record.start_time = Some(start_time);
		record.processing_duration = Some(0);
		record.expire_time = Some(epoch_seconds() + RECORD_TTL_SECONDS);
		record.region_success = Some(0);
		record.region_error = Some(0);

		self
			.store
			.put(&self.table_name, &record.key(), serde_json::to_value(&record)?)
			.await
			.context("failed to start image request")?;
		Ok(record)
	}

	/// Atomically counts one finished region against the image.
	pub async fn complete_region_request(
		&self,
		image_id: &str,
		error: bool,
	) -> Result<ImageJobRecord> {
		let field = if error { "region_error" } else { "region_success" };
		let updated = self
			.store
			.update(
				&self.table_name,
				&RecordKey::partition(image_id),
				&[],
				&[Mutation::Increment(field.to_string(), 1)],
			)
			.await
			.context("failed to count completed region")?;
		Ok(serde_json::from_value(updated)?)
	}

	/// True when every region of the image has been accounted for.
	pub fn is_image_request_complete(record: &ImageJobRecord) -> Result<bool> {
		match (record.region_count, record.region_success, record.region_error) {
			(Some(count), Some(success), Some(error)) => Ok(success + error == count),
			_ => bail!(
				"image job {} is missing region counters",
				record.image_id
			),
		}
	}

	/// Stamps the end time and final processing duration.
	pub async fn end_image_request(&self, image_id: &str) -> Result<ImageJobRecord> {
		let record = self.get_image_request(image_id).await?;
		let end_time = epoch_millis();
		let duration = record
			.start_time
			.map(|start| (end_time - start) / 1000)
			.unwrap_or(0);
		let updated = self
			.store
			.update(
				&self.table_name,
				&RecordKey::partition(image_id),
				&[],
				&[
					Mutation::Set("end_time".to_string(), end_time.into()),
					Mutation::Set("processing_duration".to_string(), duration.into()),
				],
			)
			.await
			.context("failed to end image request")?;
		Ok(serde_json::from_value(updated)?)
	}

	pub async fn get_image_request(&self, image_id: &str) -> Result<ImageJobRecord> {
		let item = self
			.store
			.get(&self.table_name, &RecordKey::partition(image_id))
			.await?
			.with_context(|| format!("image job {image_id} not found"))?;
		Ok(serde_json::from_value(item)?)
	}

	/// Full-record overwrite used after the handler derives image metadata.
	pub async fn update_image_request(&self, mut record: ImageJobRecord) -> Result<ImageJobRecord> {
		if let Some(start) = record.start_time {
			record.processing_duration = Some((epoch_millis() - start) / 1000);
		}
		self
			.store
			.put(&self.table_name, &record.key(), serde_json::to_value(&record)?)
			.await
			.context("failed to update image request")?;
		Ok(record)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::MemoryKvStore;

	fn table() -> JobTable {
		JobTable::new(Arc::new(MemoryKvStore::new()), "jobs")
	}

	#[tokio::test]
	async fn start_zeroes_counters_and_sets_ttl() {
		let table = table();
		let record = table
			.start_image_request(ImageJobRecord::new("job:image"))
			.await
			.unwrap();
		assert_eq!(record.region_success, Some(0));
		assert_eq!(record.region_error, Some(0));
		assert!(record.expire_time.unwrap() > epoch_seconds());
	}

	#[tokio::test]
	async fn region_counters_accumulate() {
		let table = table();
		let mut record = ImageJobRecord::new("job:image");
		record.region_count = Some(3);
		table.start_image_request(record).await.unwrap();

		let after_one = table.complete_region_request("job:image", false).await.unwrap();
		assert!(!JobTable::is_image_request_complete(&after_one).unwrap());

		table.complete_region_request("job:image", false).await.unwrap();
		let done = table.complete_region_request("job:image", true).await.unwrap();
		assert_eq!(done.region_success, Some(2));
		assert_eq!(done.region_error, Some(1));
		assert!(JobTable::is_image_request_complete(&done).unwrap());
	}

	#[tokio::test]
	async fn completeness_requires_counters() {
		let record = ImageJobRecord::new("job:image");
		assert!(JobTable::is_image_request_complete(&record).is_err());
	}

	#[tokio::test]
	async fn end_request_records_duration() {
		let table = table();
		table
			.start_image_request(ImageJobRecord::new("job:image"))
			.await
			.unwrap();
		let ended = table.end_image_request("job:image").await.unwrap();
		assert!(ended.end_time.is_some());
		assert!(ended.processing_duration.unwrap() >= 0);
	}
}
