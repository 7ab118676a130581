//! Region-of-interest handling: WKT parsing and processing bounds.
//!
//! Requests may restrict processing to a polygon given in geographic
//! coordinates (WKT, longitude/latitude order). The processing bounds are
//! the pixel rectangle covering the intersection of that polygon with the
//! image extent.

use anyhow::{bail, ensure, Context, Result};
use geo::{BooleanOps, BoundingRect, Intersects};
use geo_types::{Coord, LineString, Polygon};
use skysift_core::geo::WorldCoordinate;
use skysift_core::raster::RasterDataset;
use skysift_core::sensor::ImageSensor;
use skysift_core::types::PixelRegion;

/// Parses a WKT `POLYGON` into a `geo` polygon.
///
/// Only the exterior ring is used; holes in the ROI are not honored. The
/// coordinate order is longitude latitude, matching GeoJSON.
pub fn parse_wkt_polygon(wkt: &str) -> Result<Polygon<f64>> {
	let trimmed = wkt.trim();
	let rest = trimmed
		.strip_prefix("POLYGON")
		.or_else(|| trimmed.strip_prefix("polygon"))
		.with_context(|| format!("ROI must be a WKT POLYGON, got '{wkt}'"))?
		.trim();

	ensure!(
		rest.starts_with('(') && rest.ends_with(')'),
		"malformed WKT polygon '{wkt}'"
	);
	// Exterior ring: the text between the first '((' and the next ')'.
	let inner = rest.trim_start_matches('(');
	let exterior_text = match inner.find(')') {
		Some(end) => &inner[..end],
		None => bail!("malformed WKT polygon '{wkt}'"),
	};

	let mut coords = Vec::new();
	for vertex in exterior_text.split(',') {
		let parts: Vec<&str> = vertex.split_whitespace().collect();
		ensure!(
			parts.len() == 2 || parts.len() == 3,
			"malformed WKT vertex '{vertex}'"
		);
		let x: f64 = parts[0].parse().with_context(|| format!("bad longitude '{}'", parts[0]))?;
		let y: f64 = parts[1].parse().with_context(|| format!("bad latitude '{}'", parts[1]))?;
		coords.push(Coord { x, y });
	}
	ensure!(coords.len() >= 4, "WKT polygon ring needs at least 4 vertices");

	Ok(Polygon::new(LineString::from(coords), vec![]))
}

/// Serializes a polygon's exterior ring back to WKT for storage on the
/// image job record.
pub fn polygon_to_wkt(polygon: &Polygon<f64>) -> String {
	let ring = polygon
		.exterior()
		.0
		.iter()
		.map(|c| format!("{} {}", c.x, c.y))
		.collect::<Vec<String>>()
		.join(", ");
	format!("POLYGON (({ring}))")
}

/// Determines how much of the image should be processed.
///
/// Without an ROI (or without a sensor model to georeference it) the bounds
/// are the full image. Otherwise the ROI is projected into image space and
/// intersected with the image extent; an empty intersection yields `None`.
pub fn calculate_processing_bounds(
	dataset: &dyn RasterDataset,
	roi: Option<&Polygon<f64>>,
	sensor: Option<&ImageSensor>,
) -> Result<Option<PixelRegion>> {
	let full_extent = dataset.full_extent();
	let (Some(roi), Some(sensor)) = (roi, sensor) else {
		return Ok(Some(full_extent));
	};

	// Project the ROI's exterior ring into image coordinates.
	let model = sensor.precise();
	let mut image_coords = Vec::with_capacity(roi.exterior().0.len());
	for coord in &roi.exterior().0 {
		let world = WorldCoordinate::new(coord.x.to_radians(), coord.y.to_radians(), 0.0);
		let image = model
			.world_to_image(&world)
			.context("failed to project ROI vertex into image space")?;
		image_coords.push(Coord { x: image.x, y: image.y });
	}
	let roi_area = Polygon::new(LineString::from(image_coords), vec![]);

	let w = dataset.width() as f64;
	let h = dataset.height() as f64;
	let image_area = Polygon::new(
		LineString::from(vec![
			Coord { x: 0.0, y: 0.0 },
			Coord { x: 0.0, y: h },
			Coord { x: w, y: h },
			Coord { x: w, y: 0.0 },
			Coord { x: 0.0, y: 0.0 },
		]),
		vec![],
	);

	if !roi_area.intersects(&image_area) {
		return Ok(None);
	}

	let overlap = roi_area.intersection(&image_area);
	let Some(rect) = overlap.bounding_rect() else {
		return Ok(None);
	};

	let col = rect.min().x.round().max(0.0) as u32;
	let row = rect.min().y.round().max(0.0) as u32;
	let width = (rect.max().x - rect.min().x).round() as u32;
	let height = (rect.max().y - rect.min().y).round() as u32;
	if width == 0 || height == 0 {
		return Ok(None);
	}
	Ok(Some(PixelRegion::new(row, col, width, height)))
}
