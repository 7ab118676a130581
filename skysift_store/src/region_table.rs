//! Region job tracking.
//!
//! One record per `(image_id, region_id)`. Tile workers append tile outcomes
//! with list-append updates, so concurrent workers never clobber each other;
//! the region's terminal status is derived from the totals, not from order.

use crate::kv::{KvStore, Mutation, RecordKey};
use crate::RECORD_TTL_SECONDS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use skysift_core::types::{
	epoch_millis, epoch_seconds, PixelRegion, PixelSize, RequestStatus, TileCompression,
	TileFormat, TileState,
};
use std::sync::Arc;

/// A single row in the region job table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionJobRecord {
	pub region_id: String,
	pub image_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub job_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub start_time: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_updated_time: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub end_time: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expire_time: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_read_credentials: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub processing_duration: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region_status: Option<RequestStatus>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub total_tiles: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub failed_tiles: Option<Vec<PixelRegion>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub failed_tile_count: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub succeeded_tiles: Option<Vec<PixelRegion>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub succeeded_tile_count: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region_bounds: Option<PixelRegion>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region_retry_count: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tile_compression: Option<TileCompression>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tile_format: Option<TileFormat>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tile_overlap: Option<PixelSize>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tile_size: Option<PixelSize>,
}

impl RegionJobRecord {
	pub fn new(region_id: &str, image_id: &str) -> Self {
		RegionJobRecord {
			region_id: region_id.to_string(),
			image_id: image_id.to_string(),
			..Default::default()
		}
	}

	fn key(&self) -> RecordKey {
		RecordKey::with_sort(&self.image_id, &self.region_id)
	}

	/// Terminal status derived from tile totals: SUCCESS when every tile
	/// succeeded, FAILED when every tile failed, PARTIAL otherwise.
	pub fn derived_status(&self) -> RequestStatus {
		let total = self.total_tiles.unwrap_or(0);
		let failed = self.failed_tile_count.unwrap_or(0);
		if failed == 0 {
			RequestStatus::Success
		} else if failed >= total {
			RequestStatus::Failed
		} else {
			RequestStatus::Partial
		}
	}
}

/// Accessor for the region job table.
#[derive(Clone, Debug)]
pub struct RegionTable {
	store: Arc<dyn KvStore>,
	table_name: String,
}

impl RegionTable {
	pub fn new(store: Arc<dyn KvStore>, table_name: &str) -> Self {
		RegionTable {
			store,
			table_name: table_name.to_string(),
		}
	}

	/// Writes the first record for a region: status STARTED, zero counters.
	pub async fn start_region_request(&self, mut record: RegionJobRecord) -> Result<RegionJobRecord> {
		let start_time = epoch_millis();
		record.start_time = Some(start_time);
		record.region_status = Some(RequestStatus::Started);
		record.region_retry_count = Some(0);
		record.succeeded_tile_count = Some(0);
		record.failed_tile_count = Some(0);
		record.processing_duration = Some(0);
		record.expire_time = Some(epoch_seconds() + RECORD_TTL_SECONDS);

		self
			.store
			.put(&self.table_name, &record.key(), serde_json::to_value(&record)?)
			.await
			.context("failed to add region request to the table")?;
		Ok(record)
	}

	/// Marks the region finished with the given status.
	pub async fn complete_region_request(
		&self,
		image_id: &str,
		region_id: &str,
		status: RequestStatus,
	) -> Result<RegionJobRecord> {
		let record = self
			.get_region_request(region_id, image_id)
			.await?
			.with_context(|| format!("region job {region_id} not found"))?;
		let end_time = epoch_millis();
		let duration = record.start_time.map(|s| end_time - s).unwrap_or(0);

		let updated = self
			.store
			.update(
				&self.table_name,
				&record.key(),
				&[],
				&[
					Mutation::Set("region_status".to_string(), serde_json::to_value(status)?),
					Mutation::Set("end_time".to_string(), end_time.into()),
					Mutation::Set("last_updated_time".to_string(), end_time.into()),
					Mutation::Set("processing_duration".to_string(), duration.into()),
				],
			)
			.await
			.context("failed to complete region")?;
		Ok(serde_json::from_value(updated)?)
	}

	/// Writes the scalar fields owned by the region handler.
	///
	/// The tile lists are appended concurrently by tile workers, so this is a
	/// partial update rather than a full-record overwrite.
	pub async fn update_region_request(&self, record: RegionJobRecord) -> Result<RegionJobRecord> {
		let mut mutations = vec![Mutation::Set(
			"last_updated_time".to_string(),
			epoch_millis().into(),
		)];
		if let Some(total_tiles) = record.total_tiles {
			mutations.push(Mutation::Set("total_tiles".to_string(), total_tiles.into()));
		}
		if let Some(count) = record.succeeded_tile_count {
			mutations.push(Mutation::Set("succeeded_tile_count".to_string(), count.into()));
		}
		if let Some(count) = record.failed_tile_count {
			mutations.push(Mutation::Set("failed_tile_count".to_string(), count.into()));
		}
		if let Some(message) = &record.message {
			mutations.push(Mutation::Set("message".to_string(), message.clone().into()));
		}

		let updated = self
			.store
			.update(&self.table_name, &record.key(), &[], &mutations)
			.await
			.context("failed to update region")?;
		Ok(serde_json::from_value(updated)?)
	}

	pub async fn get_region_request(
		&self,
		region_id: &str,
		image_id: &str,
	) -> Result<Option<RegionJobRecord>> {
		let item = self
			.store
			.get(&self.table_name, &RecordKey::with_sort(image_id, region_id))
			.await?;
		Ok(match item {
			Some(item) => Some(serde_json::from_value(item)?),
			None => None,
		})
	}

	/// Appends a tile outcome to the region's succeeded or failed list.
	pub async fn add_tile(
		&self,
		image_id: &str,
		region_id: &str,
		tile: &PixelRegion,
		state: TileState,
	) -> Result<RegionJobRecord> {
		let field = format!("{}_tiles", state.field_prefix());
		let updated = self
			.store
			.update(
				&self.table_name,
				&RecordKey::with_sort(image_id, region_id),
				&[],
				&[Mutation::ListAppend(field, serde_json::to_value(tile)?)],
			)
			.await
			.with_context(|| format!("failed to append {state:?} tile to region {region_id}"))?;
		Ok(serde_json::from_value(updated)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::MemoryKvStore;

	fn table() -> RegionTable {
		RegionTable::new(Arc::new(MemoryKvStore::new()), "regions")
	}

	#[tokio::test]
	async fn start_and_complete_region() {
		let table = table();
		let record = RegionJobRecord::new("0:0-job", "job:image");
		let started = table.start_region_request(record).await.unwrap();
		assert_eq!(started.region_status, Some(RequestStatus::Started));

		let completed = table
			.complete_region_request("job:image", "0:0-job", RequestStatus::Success)
			.await
			.unwrap();
		assert_eq!(completed.region_status, Some(RequestStatus::Success));
		assert!(completed.processing_duration.unwrap() >= 0);
	}

	#[tokio::test]
	async fn tiles_accumulate_in_any_order() {
		let table = table();
		table
			.start_region_request(RegionJobRecord::new("0:0-job", "job:image"))
			.await
			.unwrap();

		table
			.add_tile(
				"job:image",
				"0:0-job",
				&PixelRegion::new(0, 0, 512, 512),
				TileState::Succeeded,
			)
			.await
			.unwrap();
		table
			.add_tile(
				"job:image",
				"0:0-job",
				&PixelRegion::new(0, 512, 512, 512),
				TileState::Failed,
			)
			.await
			.unwrap();
		let updated = table
			.add_tile(
				"job:image",
				"0:0-job",
				&PixelRegion::new(512, 0, 512, 512),
				TileState::Succeeded,
			)
			.await
			.unwrap();

		assert_eq!(updated.succeeded_tiles.unwrap().len(), 2);
		assert_eq!(updated.failed_tiles.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn scalar_update_preserves_tile_lists() {
		let table = table();
		table
			.start_region_request(RegionJobRecord::new("0:0-job", "job:image"))
			.await
			.unwrap();
		table
			.add_tile(
				"job:image",
				"0:0-job",
				&PixelRegion::new(0, 0, 512, 512),
				TileState::Succeeded,
			)
			.await
			.unwrap();

		let mut record = RegionJobRecord::new("0:0-job", "job:image");
		record.total_tiles = Some(4);
		record.succeeded_tile_count = Some(3);
		record.failed_tile_count = Some(1);
		let updated = table.update_region_request(record).await.unwrap();

		assert_eq!(updated.total_tiles, Some(4));
		assert_eq!(updated.succeeded_tiles.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn missing_region_reads_as_none() {
		let table = table();
		assert!(table
			.get_region_request("nope", "job:image")
			.await
			.unwrap()
			.is_none());
	}

	#[test]
	fn derived_status_from_totals() {
		let mut record = RegionJobRecord::new("r", "i");
		record.total_tiles = Some(25);
		record.failed_tile_count = Some(0);
		assert_eq!(record.derived_status(), RequestStatus::Success);
		record.failed_tile_count = Some(3);
		assert_eq!(record.derived_status(), RequestStatus::Partial);
		record.failed_tile_count = Some(25);
		assert_eq!(record.derived_status(), RequestStatus::Failed);
	}
}
