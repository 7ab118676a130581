//! Feature refinement: from tile-local detections to geolocated features.
//!
//! Refinement happens in two steps. Right after inference the tile worker
//! translates detections into full-image coordinates and stamps inference
//! metadata ([`refine_tile_features`]). When a sensor model is available the
//! [`FeatureRefinery`] then assigns geographic geometry: sparsely populated
//! tiles geolocate each feature directly, dense tiles go through a bilinear
//! interpolation grid built once over the feature envelope.

use crate::feature::ImageFeature;
use crate::geo::{ImageCoordinate, WorldCoordinate};
use crate::sensor::{ElevationModel, ImageSensor, SensorModel};
use crate::types::{iso8601_now, PixelRegion};
use anyhow::{ensure, Context, Result};
use serde_json::json;
use std::sync::Arc;

/// Default resolution of the geolocation approximation grid.
pub const DEFAULT_GRID_SIZE: usize = 11;

/// Translates tile-local detections into full-image coordinates and attaches
/// the per-tile inference metadata.
pub fn refine_tile_features(features: &mut [ImageFeature], tile: &PixelRegion, image_id: &str) {
	let ulx = tile.col as f64;
	let uly = tile.row as f64;
	for feature in features.iter_mut() {
		feature.convert_legacy_classes();
		feature.translate(ulx, uly);
		feature.set_property("image_id", json!(image_id));
		feature.set_property("inferenceTime", json!(iso8601_now()));
	}
}

/// Converts a `[x1, y1, x2, y2]` bbox into its four-corner polygon.
pub fn bbox_to_polygon(bbox: [f64; 4]) -> Vec<[f64; 2]> {
	vec![
		[bbox[0], bbox[1]],
		[bbox[0], bbox[3]],
		[bbox[2], bbox[3]],
		[bbox[2], bbox[1]],
	]
}

/// Approximates world coordinates through a grid of correspondences computed
/// once over a given area.
pub struct LocationGrid {
	ulx: f64,
	uly: f64,
	width: f64,
	height: f64,
	resolution: usize,
	longitudes: Vec<f64>,
	latitudes: Vec<f64>,
	elevation: Option<Arc<dyn ElevationModel>>,
}

impl LocationGrid {
	/// Builds the grid by geolocating `resolution²` points through the sensor
	/// model.
	pub fn new(
		sensor_model: &Arc<dyn SensorModel>,
		elevation: Option<Arc<dyn ElevationModel>>,
		ulx: f64,
		uly: f64,
		width: f64,
		height: f64,
		resolution: usize,
	) -> Result<Self> {
		ensure!(resolution >= 2, "grid resolution must be at least 2");
		let width = width.max(1.0);
		let height = height.max(1.0);

		let mut longitudes = Vec::with_capacity(resolution * resolution);
		let mut latitudes = Vec::with_capacity(resolution * resolution);
		for iy in 0..resolution {
			let y = uly + height * iy as f64 / (resolution - 1) as f64;
			for ix in 0..resolution {
				let x = ulx + width * ix as f64 / (resolution - 1) as f64;
				let world =
					sensor_model.image_to_world(ImageCoordinate::new(x, y), elevation.as_deref())?;
				longitudes.push(world.longitude);
				latitudes.push(world.latitude);
			}
		}

		Ok(LocationGrid {
			ulx,
			uly,
			width,
			height,
			resolution,
			longitudes,
			latitudes,
			elevation,
		})
	}

	/// Bilinearly interpolates the world coordinate for an image position.
	pub fn locate(&self, coord: ImageCoordinate) -> WorldCoordinate {
		let n = self.resolution;
		let fx = ((coord.x - self.ulx) / self.width * (n - 1) as f64).clamp(0.0, (n - 1) as f64);
		let fy = ((coord.y - self.uly) / self.height * (n - 1) as f64).clamp(0.0, (n - 1) as f64);
		let ix = (fx as usize).min(n - 2);
		let iy = (fy as usize).min(n - 2);
		let tx = fx - ix as f64;
		let ty = fy - iy as f64;

		let sample = |values: &[f64]| -> f64 {
			let v00 = values[iy * n + ix];
			let v01 = values[iy * n + ix + 1];
			let v10 = values[(iy + 1) * n + ix];
			let v11 = values[(iy + 1) * n + ix + 1];
			let top = v00 + (v01 - v00) * tx;
			let bottom = v10 + (v11 - v10) * tx;
			top + (bottom - top) * ty
		};

		let mut world = WorldCoordinate::new(sample(&self.longitudes), sample(&self.latitudes), 0.0);
		if let Some(elevation) = &self.elevation {
			elevation.set_elevation(&mut world);
		}
		world
	}
}

/// Assigns geographic geometry to features using the image's sensor model.
#[derive(Clone, Debug)]
pub struct FeatureRefinery {
	sensor: ImageSensor,
	elevation: Option<Arc<dyn ElevationModel>>,
	grid_size: usize,
}

impl FeatureRefinery {
	pub fn new(sensor: ImageSensor, elevation: Option<Arc<dyn ElevationModel>>) -> Self {
		FeatureRefinery {
			sensor,
			elevation,
			grid_size: DEFAULT_GRID_SIZE,
		}
	}

	pub fn with_grid_size(mut self, grid_size: usize) -> Self {
		self.grid_size = grid_size;
		self
	}

	/// Updates every feature with a geographic polygon, centroid properties and
	/// a GeoJSON `bbox`.
	pub fn geolocate_features(&self, features: &mut [ImageFeature]) -> Result<()> {
		if features.is_empty() {
			return Ok(());
		}
		if features.len() < self.grid_size * self.grid_size {
			// Sparse tile: the grid would cost more than direct geolocation.
			self.geolocate_individually(features)
		} else {
			self.geolocate_through_grid(features)
		}
	}

	fn geolocate_individually(&self, features: &mut [ImageFeature]) -> Result<()> {
		let approximate = self.sensor.approximate();
		for feature in features.iter_mut() {
			let (center, ring) = feature_shape(feature)?;

			let approx_center =
				approximate.image_to_world(center, self.elevation.as_deref())?;
			let mut ring_world: Vec<WorldCoordinate> = ring
				.iter()
				.map(|p| {
					approximate.image_to_world(ImageCoordinate::new(p[0], p[1]), self.elevation.as_deref())
				})
				.collect::<Result<_>>()?;

			let final_center = if self.sensor.is_composite() {
				// Measure the delta between the approximate and precise model at
				// the feature center and shift every vertex by it. The vertices
				// are close to the center so they exhibit the same shift.
				let precise_center = self
					.sensor
					.precise()
					.image_to_world(center, self.elevation.as_deref())?;
				let delta_longitude = precise_center.longitude - approx_center.longitude;
				let delta_latitude = precise_center.latitude - approx_center.latitude;
				for vertex in &mut ring_world {
					vertex.longitude += delta_longitude;
					vertex.latitude += delta_latitude;
				}
				precise_center
			} else {
				approx_center
			};

			apply_geolocation(feature, &ring_world, &final_center);
		}
		Ok(())
	}

	fn geolocate_through_grid(&self, features: &mut [ImageFeature]) -> Result<()> {
		// The grid covers the feature envelope, not the tile: tightly packed
		// features get the same resolution over a smaller area.
		let mut envelope = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
		for feature in features.iter() {
			let bounds = feature
				.image_bounds()
				.context("feature has no image bounds for geolocation")?;
			envelope[0] = envelope[0].min(bounds[0]);
			envelope[1] = envelope[1].min(bounds[1]);
			envelope[2] = envelope[2].max(bounds[2]);
			envelope[3] = envelope[3].max(bounds[3]);
		}

		let grid = LocationGrid::new(
			self.sensor.precise(),
			self.elevation.clone(),
			envelope[0],
			envelope[1],
			envelope[2] - envelope[0],
			envelope[3] - envelope[1],
			self.grid_size,
		)?;

		for feature in features.iter_mut() {
			let (center, ring) = feature_shape(feature)?;
			let ring_world: Vec<WorldCoordinate> = ring
				.iter()
				.map(|p| grid.locate(ImageCoordinate::new(p[0], p[1])))
				.collect();
			let center_world = grid.locate(center);
			apply_geolocation(feature, &ring_world, &center_world);
		}
		Ok(())
	}
}

/// The center and exterior ring of a feature's image geometry.
fn feature_shape(feature: &ImageFeature) -> Result<(ImageCoordinate, Vec<[f64; 2]>)> {
	if let Some(polygon) = feature.image_polygon() {
		let center = polygon_centroid(&polygon);
		return Ok((center, polygon));
	}
	let bbox = feature
		.image_bbox()
		.context("feature has neither an image polygon nor an image bbox")?;
	let center = ImageCoordinate::new((bbox[0] + bbox[2]) / 2.0, (bbox[1] + bbox[3]) / 2.0);
	Ok((center, bbox_to_polygon(bbox)))
}

/// Area centroid of a polygon ring, falling back to the vertex mean for
/// degenerate rings.
fn polygon_centroid(ring: &[[f64; 2]]) -> ImageCoordinate {
	let n = ring.len();
	let mut area = 0.0;
	let mut cx = 0.0;
	let mut cy = 0.0;
	for i in 0..n {
		let [x0, y0] = ring[i];
		let [x1, y1] = ring[(i + 1) % n];
		let cross = x0 * y1 - x1 * y0;
		area += cross;
		cx += (x0 + x1) * cross;
		cy += (y0 + y1) * cross;
	}
	if area.abs() > f64::EPSILON {
		let area = area / 2.0;
		ImageCoordinate::new(cx / (6.0 * area), cy / (6.0 * area))
	} else {
		let (sx, sy) = ring.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
		ImageCoordinate::new(sx / n as f64, sy / n as f64)
	}
}

/// Writes the polygon geometry, `bbox` and centroid properties onto a feature.
fn apply_geolocation(feature: &mut ImageFeature, ring: &[WorldCoordinate], center: &WorldCoordinate) {
	let mut coords: Vec<[f64; 3]> = ring.iter().map(|c| {
		let d = c.to_degrees();
		[d[0], d[1], d[2]]
	}).collect();
	if let Some(first) = coords.first().copied() {
		// Close the ring as required by some visualization tools.
		coords.push(first);
	}

	let mut bbox = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
	for c in &coords {
		bbox[0] = bbox[0].min(c[0]);
		bbox[1] = bbox[1].min(c[1]);
		bbox[2] = bbox[2].max(c[0]);
		bbox[3] = bbox[3].max(c[1]);
	}

	feature.geometry = Some(json!({
		"type": "Polygon",
		"coordinates": [coords],
	}));
	feature.bbox = Some(bbox.to_vec());
	feature.set_property("center_longitude", json!(center.longitude.to_degrees()));
	feature.set_property("center_latitude", json!(center.latitude.to_degrees()));
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sensor::AffineSensorModel;
	use approx::assert_relative_eq;

	fn sensor() -> ImageSensor {
		ImageSensor::Single(Arc::new(
			AffineSensorModel::new([10.0, 1e-5, 0.0, 50.0, 0.0, -1e-5]).unwrap(),
		))
	}

	fn detection(bbox: [f64; 4]) -> ImageFeature {
		let mut feature = ImageFeature::new();
		feature.set_image_bbox(bbox);
		feature
	}

	#[test]
	fn tile_refinement_translates_and_stamps() {
		let mut features = vec![detection([10.0, 20.0, 30.0, 40.0])];
		refine_tile_features(&mut features, &PixelRegion::new(1000, 2000, 512, 512), "job:image");
		assert_eq!(
			features[0].image_bbox(),
			Some([2010.0, 1020.0, 2030.0, 1040.0])
		);
		assert_eq!(
			features[0].properties.get("image_id").unwrap(),
			&json!("job:image")
		);
		let stamp = features[0]
			.properties
			.get("inferenceTime")
			.and_then(|v| v.as_str())
			.unwrap();
		assert!(stamp.ends_with('Z'), "expected Z suffix in {stamp}");
	}

	#[test]
	fn sparse_geolocation_produces_closed_polygon() {
		let refinery = FeatureRefinery::new(sensor(), None);
		let mut features = vec![detection([429.0, 553.0, 440.0, 561.0])];
		refinery.geolocate_features(&mut features).unwrap();

		let geometry = features[0].geometry.as_ref().unwrap();
		assert_eq!(geometry["type"], json!("Polygon"));
		let ring = geometry["coordinates"][0].as_array().unwrap();
		assert_eq!(ring.len(), 5);
		assert_eq!(ring.first(), ring.last());

		let bbox = features[0].bbox.as_ref().unwrap();
		assert!(bbox[0] <= bbox[2] && bbox[1] <= bbox[3]);

		let lon = features[0].properties["center_longitude"].as_f64().unwrap();
		assert_relative_eq!(lon, 10.0 + 434.5 * 1e-5, epsilon = 1e-9);
	}

	#[test]
	fn grid_interpolation_matches_direct_geolocation_for_affine_models() {
		let model: Arc<dyn SensorModel> =
			Arc::new(AffineSensorModel::new([10.0, 1e-5, 0.0, 50.0, 0.0, -1e-5]).unwrap());
		let grid = LocationGrid::new(&model, None, 0.0, 0.0, 1000.0, 1000.0, 11).unwrap();
		for (x, y) in [(0.0, 0.0), (123.0, 456.0), (999.0, 1000.0)] {
			let direct = model.image_to_world(ImageCoordinate::new(x, y), None).unwrap();
			let interpolated = grid.locate(ImageCoordinate::new(x, y));
			assert_relative_eq!(direct.longitude, interpolated.longitude, epsilon = 1e-12);
			assert_relative_eq!(direct.latitude, interpolated.latitude, epsilon = 1e-12);
		}
	}

	#[test]
	fn dense_path_geolocates_every_feature() {
		let refinery = FeatureRefinery::new(sensor(), None).with_grid_size(2);
		// 4 features >= 2x2 grid threshold -> dense path
		let mut features = vec![
			detection([0.0, 0.0, 10.0, 10.0]),
			detection([100.0, 100.0, 110.0, 110.0]),
			detection([200.0, 200.0, 210.0, 210.0]),
			detection([300.0, 300.0, 310.0, 310.0]),
		];
		refinery.geolocate_features(&mut features).unwrap();
		for feature in &features {
			assert!(feature.geometry.is_some());
			assert!(feature.properties.contains_key("center_latitude"));
		}
	}

	#[test]
	fn composite_model_applies_center_delta() {
		// Precise model shifted by a constant offset from the approximate one.
		let approximate: Arc<dyn SensorModel> =
			Arc::new(AffineSensorModel::new([10.0, 1e-5, 0.0, 50.0, 0.0, -1e-5]).unwrap());
		let precise: Arc<dyn SensorModel> =
			Arc::new(AffineSensorModel::new([10.001, 1e-5, 0.0, 50.001, 0.0, -1e-5]).unwrap());
		let refinery = FeatureRefinery::new(
			ImageSensor::Composite {
				approximate: approximate.clone(),
				precise,
			},
			None,
		);
		let mut features = vec![detection([100.0, 100.0, 120.0, 120.0])];
		refinery.geolocate_features(&mut features).unwrap();

		let ring = features[0].geometry.as_ref().unwrap()["coordinates"][0]
			.as_array()
			.unwrap();
		let first_lon = ring[0][0].as_f64().unwrap();
		let approx_first = approximate
			.image_to_world(ImageCoordinate::new(100.0, 100.0), None)
			.unwrap();
		assert_relative_eq!(
			first_lon,
			approx_first.longitude.to_degrees() + 0.001,
			epsilon = 1e-9
		);
	}
}
