//! Tiling strategy that lets edge tiles and regions shrink below nominal size.

use super::{dedupe_features, generate_crops, TilingStrategy};
use crate::feature::ImageFeature;
use crate::select::FeatureSelection;
use crate::types::{PixelRegion, PixelSize};
use anyhow::Result;

/// Regions and tiles are produced with the requested overlap; the last tile
/// in each row/column may be smaller than nominal so the image is covered
/// exactly.
#[derive(Clone, Copy, Debug, Default)]
pub struct VariableTileStrategy;

impl TilingStrategy for VariableTileStrategy {
	fn compute_regions(
		&self,
		processing_bounds: &PixelRegion,
		region_size: PixelSize,
		_tile_size: PixelSize,
		overlap: PixelSize,
	) -> Result<Vec<PixelRegion>> {
		generate_crops(processing_bounds, region_size, overlap, false)
	}

	fn compute_tiles(
		&self,
		region: &PixelRegion,
		tile_size: PixelSize,
		overlap: PixelSize,
	) -> Result<Vec<PixelRegion>> {
		generate_crops(region, tile_size, overlap, false)
	}

	fn cleanup_duplicate_features(
		&self,
		_processing_bounds: &PixelRegion,
		region_size: PixelSize,
		tile_size: PixelSize,
		overlap: PixelSize,
		features: Vec<ImageFeature>,
		selector: &dyn FeatureSelection,
	) -> Result<Vec<ImageFeature>> {
		dedupe_features(features, region_size, tile_size, overlap, selector)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::select::NoopSelection;

	#[test]
	fn edge_tiles_shrink() {
		let strategy = VariableTileStrategy;
		let region = PixelRegion::new(0, 0, 1000, 1000);
		let tiles = strategy
			.compute_tiles(&region, PixelSize::new(300, 300), PixelSize::new(50, 50))
			.unwrap();
		// stride 250, 4 per axis
		assert_eq!(tiles.len(), 16);
		let last = tiles.last().unwrap();
		assert_eq!((last.width, last.height), (250, 250));
		// exact cover of the region
		for row in (0..1000).step_by(97) {
			for col in (0..1000).step_by(97) {
				assert!(tiles.iter().any(|t| t.contains_pixel(row, col)));
			}
		}
	}

	#[test]
	fn regions_ignore_tile_size() {
		let strategy = VariableTileStrategy;
		let bounds = PixelRegion::new(0, 0, 1024, 1024);
		let regions = strategy
			.compute_regions(
				&bounds,
				PixelSize::new(10240, 10240),
				PixelSize::new(2048, 2048),
				PixelSize::new(50, 50),
			)
			.unwrap();
		assert_eq!(regions, vec![PixelRegion::new(0, 0, 1024, 1024)]);
	}

	#[test]
	fn dedup_without_duplicates_is_identity() {
		let strategy = VariableTileStrategy;
		let mut feature = ImageFeature::new();
		feature.set_image_bbox([400.0, 400.0, 420.0, 420.0]);
		let features = vec![feature];
		let result = strategy
			.cleanup_duplicate_features(
				&PixelRegion::new(0, 0, 10240, 10240),
				PixelSize::new(10240, 10240),
				PixelSize::new(2048, 2048),
				PixelSize::new(50, 50),
				features.clone(),
				&NoopSelection,
			)
			.unwrap();
		assert_eq!(result, features);
	}
}
