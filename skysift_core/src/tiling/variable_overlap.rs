//! Tiling strategy that widens the overlap so only full-size tiles are produced.

use super::{ceil_div, dedupe_features, generate_crops, TilingStrategy};
use crate::feature::ImageFeature;
use crate::select::FeatureSelection;
use crate::types::{PixelRegion, PixelSize};
use anyhow::{ensure, Result};

/// Produces only tiles of exactly `tile_size` by treating the requested
/// overlap as a minimum and widening it until the tiles exactly span the
/// image. Region sizes are adjusted to hold an integer number of tiles and
/// the processing bounds shrink to the span of generated tiles.
#[derive(Clone, Copy, Debug, Default)]
pub struct VariableOverlapStrategy;

impl VariableOverlapStrategy {
	/// Adjusts the minimum overlap per axis so that full tiles exactly span
	/// the image dimension.
	fn overlap_for_full_tiles(
		full_image_size: PixelSize,
		tile_size: PixelSize,
		minimum_overlap: PixelSize,
	) -> PixelSize {
		fn expand(image_dim: u32, tile_dim: u32, min_overlap: u32) -> u32 {
			let stride = tile_dim - min_overlap;
			let num_tiles = ceil_div(image_dim.saturating_sub(min_overlap), stride);
			if num_tiles > 1 {
				let extra = min_overlap + num_tiles * stride - image_dim;
				min_overlap + ceil_div(extra, num_tiles - 1)
			} else {
				min_overlap
			}
		}

		PixelSize::new(
			expand(full_image_size.width, tile_size.width, minimum_overlap.width),
			expand(full_image_size.height, tile_size.height, minimum_overlap.height),
		)
	}

	/// Adjusts the nominal region size so each region holds an integer number
	/// of full tiles.
	fn region_size_for_full_tiles(
		nominal_region_size: PixelSize,
		tile_size: PixelSize,
		overlap: PixelSize,
	) -> Result<PixelSize> {
		ensure!(
			overlap.width < tile_size.width && overlap.height < tile_size.height,
			"requested overlap {overlap} is invalid for tile size {tile_size}"
		);

		let stride_x = tile_size.width - overlap.width;
		let stride_y = tile_size.height - overlap.height;
		let tiles_per_region_x = (nominal_region_size.width - overlap.width) / stride_x;
		let tiles_per_region_y = (nominal_region_size.height - overlap.height) / stride_y;

		Ok(PixelSize::new(
			stride_x * tiles_per_region_x + overlap.width,
			stride_y * tiles_per_region_y + overlap.height,
		))
	}
}

impl TilingStrategy for VariableOverlapStrategy {
	fn compute_regions(
		&self,
		processing_bounds: &PixelRegion,
		region_size: PixelSize,
		tile_size: PixelSize,
		overlap: PixelSize,
	) -> Result<Vec<PixelRegion>> {
		let adjusted_overlap =
			Self::overlap_for_full_tiles(processing_bounds.size(), tile_size, overlap);
		log::debug!("compute_regions adjusted overlap = {adjusted_overlap}");

		// Shrink the processing bounds to the span of the full tiles. Any pixels
		// beyond the last full tile are not processed by this strategy.
		let full_image_tiles = generate_crops(processing_bounds, tile_size, adjusted_overlap, true)?;
		let adjusted_bounds = match full_image_tiles.last() {
			Some(last) => PixelRegion::new(
				processing_bounds.row,
				processing_bounds.col,
				last.right() - processing_bounds.col,
				last.bottom() - processing_bounds.row,
			),
			None => *processing_bounds,
		};
		log::debug!("compute_regions adjusted bounds = {adjusted_bounds}");

		let adjusted_region_size =
			Self::region_size_for_full_tiles(region_size, tile_size, adjusted_overlap)?;
		log::debug!("compute_regions adjusted region size = {adjusted_region_size}");

		generate_crops(&adjusted_bounds, adjusted_region_size, adjusted_overlap, false)
	}

	fn compute_tiles(
		&self,
		region: &PixelRegion,
		tile_size: PixelSize,
		overlap: PixelSize,
	) -> Result<Vec<PixelRegion>> {
		let adjusted_overlap = Self::overlap_for_full_tiles(region.size(), tile_size, overlap);
		let tiles = generate_crops(region, tile_size, adjusted_overlap, true)?;
		if tiles.is_empty() {
			// The region is smaller than one tile; fall back to partial tiles so
			// the pixels are still processed.
			return generate_crops(region, tile_size, adjusted_overlap, false);
		}
		Ok(tiles)
	}

	fn cleanup_duplicate_features(
		&self,
		processing_bounds: &PixelRegion,
		region_size: PixelSize,
		tile_size: PixelSize,
		overlap: PixelSize,
		features: Vec<ImageFeature>,
		selector: &dyn FeatureSelection,
	) -> Result<Vec<ImageFeature>> {
		let adjusted_overlap =
			Self::overlap_for_full_tiles(processing_bounds.size(), tile_size, overlap);
		let adjusted_region_size =
			Self::region_size_for_full_tiles(region_size, tile_size, adjusted_overlap)?;
		dedupe_features(
			features,
			adjusted_region_size,
			tile_size,
			adjusted_overlap,
			selector,
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::select::NoopSelection;
	use pretty_assertions::assert_eq;

	const IMAGE: PixelRegion = PixelRegion {
		row: 0,
		col: 0,
		width: 25000,
		height: 12000,
	};
	const REGION_SIZE: PixelSize = PixelSize {
		width: 10000,
		height: 10000,
	};
	const TILE_SIZE: PixelSize = PixelSize {
		width: 4096,
		height: 4096,
	};
	const MIN_OVERLAP: PixelSize = PixelSize {
		width: 100,
		height: 100,
	};

	#[test]
	fn overlap_expands_to_span_image() {
		let adjusted = VariableOverlapStrategy::overlap_for_full_tiles(IMAGE.size(), TILE_SIZE, MIN_OVERLAP);
		assert_eq!(adjusted, PixelSize::new(612, 144));
	}

	#[test]
	fn region_size_holds_whole_tiles() {
		let adjusted = VariableOverlapStrategy::region_size_for_full_tiles(
			REGION_SIZE,
			TILE_SIZE,
			PixelSize::new(612, 144),
		)
		.unwrap();
		assert_eq!(adjusted, PixelSize::new(7580, 8048));
	}

	#[test]
	fn large_image_produces_eight_regions() {
		let strategy = VariableOverlapStrategy;
		let regions = strategy
			.compute_regions(&IMAGE, REGION_SIZE, TILE_SIZE, MIN_OVERLAP)
			.unwrap();
		assert_eq!(
			regions,
			vec![
				PixelRegion::new(0, 0, 7580, 8048),
				PixelRegion::new(0, 6968, 7580, 8048),
				PixelRegion::new(0, 13936, 7580, 8048),
				PixelRegion::new(0, 20904, 4096, 8048),
				PixelRegion::new(7904, 0, 7580, 4096),
				PixelRegion::new(7904, 6968, 7580, 4096),
				PixelRegion::new(7904, 13936, 7580, 4096),
				PixelRegion::new(7904, 20904, 4096, 4096),
			]
		);
	}

	#[test]
	fn every_tile_is_full_size() {
		let strategy = VariableOverlapStrategy;
		let regions = strategy
			.compute_regions(&IMAGE, REGION_SIZE, TILE_SIZE, MIN_OVERLAP)
			.unwrap();
		for region in &regions {
			let tiles = strategy.compute_tiles(region, TILE_SIZE, MIN_OVERLAP).unwrap();
			assert!(!tiles.is_empty());
			for tile in &tiles {
				assert_eq!(tile.size(), TILE_SIZE);
				assert!(region.contains(tile));
			}
		}
	}

	#[test]
	fn tiny_region_falls_back_to_partial_tiles() {
		let strategy = VariableOverlapStrategy;
		let region = PixelRegion::new(0, 0, 1024, 1024);
		let tiles = strategy
			.compute_tiles(&region, PixelSize::new(2048, 2048), PixelSize::new(50, 50))
			.unwrap();
		assert_eq!(tiles, vec![PixelRegion::new(0, 0, 1024, 1024)]);
	}

	#[test]
	fn seam_features_reach_the_selector() {
		// Two nearly identical detections in the overlap between adjacent
		// regions; a first-feature selector keeps exactly one of them.
		#[derive(Debug)]
		struct FirstOnly;
		impl FeatureSelection for FirstOnly {
			fn select_features(&self, features: Vec<ImageFeature>) -> anyhow::Result<Vec<ImageFeature>> {
				Ok(features.into_iter().take(1).collect())
			}
		}

		let mut a = ImageFeature::new();
		a.set_image_bbox([20904.0, 7904.0, 20924.0, 7924.0]);
		let mut b = ImageFeature::new();
		b.set_image_bbox([20905.0, 7905.0, 20925.0, 7925.0]);

		let strategy = VariableOverlapStrategy;
		let result = strategy
			.cleanup_duplicate_features(
				&IMAGE,
				REGION_SIZE,
				TILE_SIZE,
				MIN_OVERLAP,
				vec![a, b],
				&FirstOnly,
			)
			.unwrap();
		assert_eq!(result.len(), 1);
	}

	#[test]
	fn cleanup_without_duplicates_is_identity() {
		let strategy = VariableOverlapStrategy;
		let mut f = ImageFeature::new();
		f.set_image_bbox([1000.0, 1000.0, 1020.0, 1020.0]);
		let features = vec![f];
		let result = strategy
			.cleanup_duplicate_features(
				&IMAGE,
				REGION_SIZE,
				TILE_SIZE,
				MIN_OVERLAP,
				features.clone(),
				&NoopSelection,
			)
			.unwrap();
		assert_eq!(result, features);
	}
}
