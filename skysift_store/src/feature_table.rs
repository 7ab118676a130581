//! Feature rows: detections written by tile workers, aggregated per image.
//!
//! Rows are keyed by `(image_id, random_range_key)` so concurrent workers
//! never contend on a key. Each row holds a batch of encoded features from
//! one tile, capped at roughly 200 KB because the backing store limits item
//! sizes; a busy tile simply produces several rows.

use crate::kv::{KvStore, RecordKey};
use crate::RECORD_TTL_SECONDS;
use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use skysift_core::feature::ImageFeature;
use skysift_core::types::{epoch_seconds, PixelSize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Upper bound on the encoded feature bytes in one row.
pub const MAX_ROW_BYTES: usize = 200 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
	pub image_id: String,
	pub range_key: String,
	pub tile_id: String,
	pub features: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expire_time: Option<i64>,
}

/// Accessor for the feature table, bound to one image's tile geometry.
#[derive(Clone, Debug)]
pub struct FeatureTable {
	store: Arc<dyn KvStore>,
	table_name: String,
	tile_size: PixelSize,
	overlap: PixelSize,
	max_row_bytes: usize,
}

impl FeatureTable {
	pub fn new(
		store: Arc<dyn KvStore>,
		table_name: &str,
		tile_size: PixelSize,
		overlap: PixelSize,
	) -> Self {
		FeatureTable {
			store,
			table_name: table_name.to_string(),
			tile_size,
			overlap,
			max_row_bytes: MAX_ROW_BYTES,
		}
	}

	#[cfg(test)]
	fn with_max_row_bytes(mut self, max_row_bytes: usize) -> Self {
		self.max_row_bytes = max_row_bytes;
		self
	}

	/// Writes features, grouped per tile and batched by encoded size.
	pub async fn add_features(&self, features: &[ImageFeature]) -> Result<()> {
		let expire_time = epoch_seconds() + RECORD_TTL_SECONDS;

		for (tile_key, grouped) in self.group_features_by_key(features) {
			let (image_id, tile_id) = tile_key
				.split_once("-region-")
				.with_context(|| format!("malformed tile key '{tile_key}'"))?;

			let mut batch: Vec<String> = Vec::new();
			let mut batch_bytes = 0usize;
			let total = grouped.len();
			for (index, feature) in grouped.iter().enumerate() {
				let encoded = serde_json::to_string(&feature.to_json())?;
				batch_bytes += encoded.len();
				batch.push(encoded);
				// Flush when the row limit is exceeded, and always for the last
				// feature of the tile.
				if batch_bytes > self.max_row_bytes || index + 1 == total {
					self
						.put_row(image_id, tile_id, std::mem::take(&mut batch), expire_time)
						.await?;
					batch_bytes = 0;
				}
			}
		}
		Ok(())
	}

	async fn put_row(
		&self,
		image_id: &str,
		tile_id: &str,
		features: Vec<String>,
		expire_time: i64,
	) -> Result<()> {
		let record = FeatureRecord {
			image_id: image_id.to_string(),
			range_key: random_range_key(),
			tile_id: tile_id.to_string(),
			features,
			expire_time: Some(expire_time),
		};
		log::debug!(
			"writing feature row with {} features for tile {} of {}",
			record.features.len(),
			tile_id,
			image_id
		);
		self
			.store
			.put(
				&self.table_name,
				&RecordKey::with_sort(&record.image_id, &record.range_key),
				serde_json::to_value(&record)?,
			)
			.await
			.context("failed to add features for tile")?;
		Ok(())
	}

	/// Reads every feature row for the image and decodes the features,
	/// grouped per tile.
	pub async fn aggregate_features(&self, image_id: &str) -> Result<Vec<ImageFeature>> {
		let rows = self.store.query(&self.table_name, image_id).await?;

		let mut by_tile: BTreeMap<String, Vec<FeatureRecord>> = BTreeMap::new();
		for row in rows {
			let record: FeatureRecord = serde_json::from_value(row)?;
			by_tile.entry(record.tile_id.clone()).or_default().push(record);
		}

		let mut features = Vec::new();
		for records in by_tile.values() {
			for record in records {
				for encoded in &record.features {
					let value: serde_json::Value = serde_json::from_str(encoded)
						.with_context(|| format!("corrupt feature row {}", record.range_key))?;
					features.push(ImageFeature::from_json(&value)?);
				}
			}
		}
		Ok(features)
	}

	fn group_features_by_key(&self, features: &[ImageFeature]) -> BTreeMap<String, Vec<ImageFeature>> {
		let mut grouped: BTreeMap<String, Vec<ImageFeature>> = BTreeMap::new();
		for feature in features {
			grouped
				.entry(self.generate_tile_key(feature))
				.or_default()
				.push(feature.clone());
		}
		grouped
	}

	/// Builds the region-relative tile key for a feature:
	/// `{image_id}-region-{minx}:{maxx}:{miny}:{maxy}`.
	fn generate_tile_key(&self, feature: &ImageFeature) -> String {
		let image_id = feature
			.properties
			.get("image_id")
			.and_then(|v| v.as_str())
			.unwrap_or("")
			.to_string();
		let bbox = feature.image_bounds().unwrap_or([0.0; 4]);

		let stride_x = (self.tile_size.width - self.overlap.width) as i64;
		let stride_y = (self.tile_size.height - self.overlap.height) as i64;

		let max_x = (bbox[2] / stride_x as f64) as i64;
		let max_y = (bbox[3] / stride_y as f64) as i64;
		let mut min_x = (bbox[0] / stride_x as f64) as i64;
		let mut min_y = (bbox[1] / stride_y as f64) as i64;
		let min_x_offset = (bbox[0] as i64).rem_euclid(stride_x);
		let min_y_offset = (bbox[1] as i64).rem_euclid(stride_y);
		if min_x_offset < self.overlap.width as i64 && min_x > 0 {
			min_x -= 1;
		}
		if min_y_offset < self.overlap.height as i64 && min_y > 0 {
			min_y -= 1;
		}

		format!("{image_id}-region-{min_x}:{max_x}:{min_y}:{max_y}")
	}
}

fn random_range_key() -> String {
	let mut bytes = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut bytes);
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}
