//! Tiling strategies: how a large image is decomposed into regions and tiles.
//!
//! A [`TilingStrategy`] answers three questions: which regions should be
//! created from an image, which tiles should be created from a region, and
//! which features from the aggregated result might be duplicates introduced
//! by overlapping tiles or regions. Two strategies are provided:
//!
//! - [`VariableTileStrategy`]: tiles and regions at the image edges may be
//!   smaller than nominal, the image is always covered exactly.
//! - [`VariableOverlapStrategy`]: only full-size tiles are produced and the
//!   overlap is widened so they still tile the image exactly; the processing
//!   bounds shrink to the span of generated tiles.

mod variable_overlap;
mod variable_tile;

pub use variable_overlap::VariableOverlapStrategy;
pub use variable_tile::VariableTileStrategy;

use crate::feature::ImageFeature;
use crate::select::FeatureSelection;
use crate::types::{PixelRegion, PixelSize};
use anyhow::{ensure, Result};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Strategy interface bound once by the image handler at startup.
pub trait TilingStrategy: Send + Sync + Debug {
	/// Identifies the regions that should be created from this image.
	fn compute_regions(
		&self,
		processing_bounds: &PixelRegion,
		region_size: PixelSize,
		tile_size: PixelSize,
		overlap: PixelSize,
	) -> Result<Vec<PixelRegion>>;

	/// Identifies the tiles that should be created from this region.
	fn compute_tiles(
		&self,
		region: &PixelRegion,
		tile_size: PixelSize,
		overlap: PixelSize,
	) -> Result<Vec<PixelRegion>>;

	/// Removes duplicates caused by tiling by applying the feature selector to
	/// the features that lie in overlap zones. Features outside any overlap
	/// pass through untouched.
	fn cleanup_duplicate_features(
		&self,
		processing_bounds: &PixelRegion,
		region_size: PixelSize,
		tile_size: PixelSize,
		overlap: PixelSize,
		features: Vec<ImageFeature>,
		selector: &dyn FeatureSelection,
	) -> Result<Vec<ImageFeature>>;
}

/// Integer ceiling division.
pub(crate) fn ceil_div(a: u32, b: u32) -> u32 {
	a.div_ceil(b)
}

/// Yields overlapping chip bounding boxes for the given area.
///
/// Chips start at the upper-left corner of the area and are spaced by
/// `chip_size - overlap`. With `only_full_tiles` chips smaller than
/// `chip_size` are skipped; otherwise chips whose width or height does not
/// exceed the overlap are skipped (they would contain no new pixels).
pub fn generate_crops(
	area: &PixelRegion,
	chip_size: PixelSize,
	overlap: PixelSize,
	only_full_tiles: bool,
) -> Result<Vec<PixelRegion>> {
	ensure!(
		overlap.width < chip_size.width && overlap.height < chip_size.height,
		"overlap must be less than chip size: chip_size = {chip_size}, overlap = {overlap}"
	);

	let stride_x = chip_size.width - overlap.width;
	let stride_y = chip_size.height - overlap.height;
	let num_x = ceil_div(area.width, stride_x);
	let num_y = ceil_div(area.height, stride_y);

	let mut crops = Vec::new();
	for r in 0..num_y {
		for c in 0..num_x {
			let ul_x = area.col + c * stride_x;
			let ul_y = area.row + r * stride_y;
			let w = chip_size.width.min(area.right() - ul_x);
			let h = chip_size.height.min(area.bottom() - ul_y);
			if only_full_tiles {
				if w == chip_size.width && h == chip_size.height {
					crops.push(PixelRegion::new(ul_y, ul_x, w, h));
				}
			} else if w > overlap.width && h > overlap.height {
				crops.push(PixelRegion::new(ul_y, ul_x, w, h));
			}
		}
	}

	Ok(crops)
}

/// Identifies which adjacent cells (tiles or regions) a feature touches.
///
/// The key holds min/max cell indices per axis. When both axes have equal
/// min and max the feature lies entirely inside one cell's non-overlap zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct OverlapKey {
	pub min_x: i64,
	pub max_x: i64,
	pub min_y: i64,
	pub max_y: i64,
}

impl OverlapKey {
	pub fn is_overlap(&self) -> bool {
		self.min_x != self.max_x || self.min_y != self.max_y
	}
}

pub(crate) fn identify_overlap(
	bounds: [f64; 4],
	shape: PixelSize,
	overlap: PixelSize,
	origin: (f64, f64),
) -> OverlapKey {
	let bbox = [
		bounds[0] - origin.0,
		bounds[1] - origin.1,
		bounds[2] - origin.0,
		bounds[3] - origin.1,
	];

	let stride_x = (shape.width - overlap.width) as i64;
	let stride_y = (shape.height - overlap.height) as i64;

	let max_x = (bbox[2] / stride_x as f64) as i64;
	let max_y = (bbox[3] / stride_y as f64) as i64;
	let mut min_x = (bbox[0] / stride_x as f64) as i64;
	let mut min_y = (bbox[1] / stride_y as f64) as i64;

	// A feature whose minimum coordinate falls within the overlap margin of a
	// stride also touches the previous cell.
	let min_x_offset = (bbox[0] as i64).rem_euclid(stride_x);
	let min_y_offset = (bbox[1] as i64).rem_euclid(stride_y);
	if min_x_offset < overlap.width as i64 && min_x > 0 {
		min_x -= 1;
	}
	if min_y_offset < overlap.height as i64 && min_y > 0 {
		min_y -= 1;
	}

	OverlapKey {
		min_x,
		max_x,
		min_y,
		max_y,
	}
}

pub(crate) fn group_features_by_overlap(
	features: Vec<ImageFeature>,
	shape: PixelSize,
	overlap: PixelSize,
	origin: (f64, f64),
) -> BTreeMap<OverlapKey, Vec<ImageFeature>> {
	let mut grouped: BTreeMap<OverlapKey, Vec<ImageFeature>> = BTreeMap::new();
	for feature in features {
		// Features without any image geometry cannot be duplicates of anything;
		// key them to the origin cell so they pass through.
		let bounds = feature.image_bounds().unwrap_or([0.0, 0.0, 0.0, 0.0]);
		let key = identify_overlap(bounds, shape, overlap, origin);
		grouped.entry(key).or_default().push(feature);
	}
	grouped
}

/// Two-level deduplication shared by both strategies: group by region
/// overlap, then (for features fully inside a single region) by tile overlap.
/// Only groups that actually touch an overlap are handed to the selector.
pub(crate) fn dedupe_features(
	features: Vec<ImageFeature>,
	region_size: PixelSize,
	tile_size: PixelSize,
	overlap: PixelSize,
	selector: &dyn FeatureSelection,
) -> Result<Vec<ImageFeature>> {
	let total = features.len();
	let mut total_skipped = 0usize;
	let mut deduped = Vec::with_capacity(total);

	let region_stride = PixelSize::new(region_size.width - overlap.width, region_size.height - overlap.height);

	for (region_key, region_features) in
		group_features_by_overlap(features, region_size, overlap, (0.0, 0.0))
	{
		if region_key.is_overlap() {
			// Contributions from multiple regions, run selection on the group.
			deduped.extend(selector.select_features(region_features)?);
			continue;
		}

		let region_origin = (
			(region_stride.width as i64 * region_key.min_x) as f64,
			(region_stride.height as i64 * region_key.min_y) as f64,
		);

		for (tile_key, tile_features) in
			group_features_by_overlap(region_features, tile_size, overlap, region_origin)
		{
			if tile_key.is_overlap() {
				deduped.extend(selector.select_features(tile_features)?);
			} else {
				total_skipped += tile_features.len();
				deduped.extend(tile_features);
			}
		}
	}

	log::debug!(
		"feature dedup skipped {total_skipped} of {total} features not inside an overlap zone"
	);
	Ok(deduped)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::select::NoopSelection;

	fn feature_at(bbox: [f64; 4]) -> ImageFeature {
		let mut f = ImageFeature::new();
		f.set_image_bbox(bbox);
		f
	}

	#[test]
	fn generate_crops_covers_area_exactly() {
		let area = PixelRegion::new(0, 0, 90, 90);
		let crops = generate_crops(&area, PixelSize::new(40, 40), PixelSize::new(10, 10), false).unwrap();
		// stride 30 -> 3 columns x 3 rows, the last of each axis shrunk to 30
		assert_eq!(crops.len(), 9);
		assert_eq!(crops.last(), Some(&PixelRegion::new(60, 60, 30, 30)));
		for crop in &crops {
			assert!(area.contains(crop));
			assert!(crop.width > 10 && crop.height > 10);
		}
		// every pixel covered
		for row in (0..90).step_by(7) {
			for col in (0..90).step_by(7) {
				assert!(crops.iter().any(|c| c.contains_pixel(row, col)));
			}
		}
	}

	#[test]
	fn generate_crops_full_tiles_only() {
		let area = PixelRegion::new(0, 0, 100, 100);
		let crops = generate_crops(&area, PixelSize::new(40, 40), PixelSize::new(10, 10), true).unwrap();
		assert!(crops.iter().all(|c| c.width == 40 && c.height == 40));
		assert_eq!(crops.len(), 9);
	}

	#[test]
	fn generate_crops_rejects_overlap_ge_chip() {
		let area = PixelRegion::new(0, 0, 100, 100);
		assert!(generate_crops(&area, PixelSize::new(40, 40), PixelSize::new(40, 10), false).is_err());
		assert!(generate_crops(&area, PixelSize::new(40, 40), PixelSize::new(10, 41), false).is_err());
	}

	#[test]
	fn identify_overlap_flags_seam_features() {
		let shape = PixelSize::new(100, 100);
		let overlap = PixelSize::new(10, 10);
		// Entirely inside the first cell's unique area.
		let inside = identify_overlap([20.0, 20.0, 40.0, 40.0], shape, overlap, (0.0, 0.0));
		assert!(!inside.is_overlap());
		// Crosses the first vertical seam.
		let crossing = identify_overlap([85.0, 20.0, 95.0, 40.0], shape, overlap, (0.0, 0.0));
		assert!(crossing.is_overlap());
		// Starts just inside the overlap margin of the second cell.
		let margin = identify_overlap([92.0, 20.0, 105.0, 40.0], shape, overlap, (0.0, 0.0));
		assert!(margin.is_overlap());
	}

	#[test]
	fn dedupe_passes_non_overlap_features_through() {
		let features = vec![feature_at([20.0, 20.0, 30.0, 30.0])];
		let result = dedupe_features(
			features.clone(),
			PixelSize::new(1000, 1000),
			PixelSize::new(100, 100),
			PixelSize::new(10, 10),
			&NoopSelection,
		)
		.unwrap();
		assert_eq!(result, features);
	}
}
