//! Sensor model contracts and the affine reference implementation.
//!
//! A sensor model maps between image pixel coordinates and geodetic world
//! coordinates. Building sensor models from image metadata belongs to the
//! image library; this crate only consumes them.

use crate::geo::{ImageCoordinate, WorldCoordinate};
use anyhow::{ensure, Result};
use std::fmt::Debug;
use std::sync::Arc;

/// Maps image coordinates to world coordinates and back.
pub trait SensorModel: Send + Sync + Debug {
	fn image_to_world(
		&self,
		coord: ImageCoordinate,
		elevation_model: Option<&dyn ElevationModel>,
	) -> Result<WorldCoordinate>;

	fn world_to_image(&self, coord: &WorldCoordinate) -> Result<ImageCoordinate>;
}

/// Supplies terrain elevation for a world coordinate.
pub trait ElevationModel: Send + Sync + Debug {
	fn set_elevation(&self, coord: &mut WorldCoordinate);
}

/// The sensor models available for one image.
///
/// A composite pairs a cheap approximate model with an expensive precise one;
/// the refinery geolocates polygon vertices through the approximate model and
/// shifts them by the delta measured at the feature center.
#[derive(Clone, Debug)]
pub enum ImageSensor {
	Single(Arc<dyn SensorModel>),
	Composite {
		approximate: Arc<dyn SensorModel>,
		precise: Arc<dyn SensorModel>,
	},
}

impl ImageSensor {
	/// The model used for final positions.
	pub fn precise(&self) -> &Arc<dyn SensorModel> {
		match self {
			ImageSensor::Single(model) => model,
			ImageSensor::Composite { precise, .. } => precise,
		}
	}

	/// The model used for bulk vertex work.
	pub fn approximate(&self) -> &Arc<dyn SensorModel> {
		match self {
			ImageSensor::Single(model) => model,
			ImageSensor::Composite { approximate, .. } => approximate,
		}
	}

	pub fn is_composite(&self) -> bool {
		matches!(self, ImageSensor::Composite { .. })
	}
}

/// A sensor model backed by a six-element affine geotransform, the form used
/// by geo-referenced rasters: `lon = gt0 + x·gt1 + y·gt2`,
/// `lat = gt3 + x·gt4 + y·gt5` (in degrees).
#[derive(Clone, Debug)]
pub struct AffineSensorModel {
	geotransform: [f64; 6],
}

impl AffineSensorModel {
	pub fn new(geotransform: [f64; 6]) -> Result<Self> {
		let det = geotransform[1] * geotransform[5] - geotransform[2] * geotransform[4];
		ensure!(det != 0.0, "geotransform is not invertible");
		Ok(AffineSensorModel { geotransform })
	}
}

impl SensorModel for AffineSensorModel {
	fn image_to_world(
		&self,
		coord: ImageCoordinate,
		elevation_model: Option<&dyn ElevationModel>,
	) -> Result<WorldCoordinate> {
		let gt = &self.geotransform;
		let lon_deg = gt[0] + coord.x * gt[1] + coord.y * gt[2];
		let lat_deg = gt[3] + coord.x * gt[4] + coord.y * gt[5];
		let mut world = WorldCoordinate::new(lon_deg.to_radians(), lat_deg.to_radians(), 0.0);
		if let Some(elevation_model) = elevation_model {
			elevation_model.set_elevation(&mut world);
		}
		Ok(world)
	}

	fn world_to_image(&self, coord: &WorldCoordinate) -> Result<ImageCoordinate> {
		let gt = &self.geotransform;
		let lon = coord.longitude.to_degrees() - gt[0];
		let lat = coord.latitude.to_degrees() - gt[3];
		let det = gt[1] * gt[5] - gt[2] * gt[4];
		let x = (lon * gt[5] - lat * gt[2]) / det;
		let y = (lat * gt[1] - lon * gt[4]) / det;
		Ok(ImageCoordinate::new(x, y))
	}
}

/// A flat elevation model pinning every coordinate to a constant height.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstantElevationModel {
	pub elevation: f64,
}

impl ElevationModel for ConstantElevationModel {
	fn set_elevation(&self, coord: &mut WorldCoordinate) {
		coord.elevation = self.elevation;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_relative_eq;

	fn model() -> AffineSensorModel {
		// 1e-5 degrees per pixel, anchored at (10°E, 50°N)
		AffineSensorModel::new([10.0, 1e-5, 0.0, 50.0, 0.0, -1e-5]).unwrap()
	}

	#[test]
	fn image_world_roundtrip() {
		let m = model();
		let world = m.image_to_world(ImageCoordinate::new(100.0, 200.0), None).unwrap();
		assert_relative_eq!(world.longitude.to_degrees(), 10.001, epsilon = 1e-9);
		assert_relative_eq!(world.latitude.to_degrees(), 49.998, epsilon = 1e-9);
		let image = m.world_to_image(&world).unwrap();
		assert_relative_eq!(image.x, 100.0, epsilon = 1e-6);
		assert_relative_eq!(image.y, 200.0, epsilon = 1e-6);
	}

	#[test]
	fn elevation_model_is_applied() {
		let m = model();
		let elevation = ConstantElevationModel { elevation: 123.0 };
		let world = m
			.image_to_world(ImageCoordinate::new(0.0, 0.0), Some(&elevation))
			.unwrap();
		assert_eq!(world.elevation, 123.0);
	}

	#[test]
	fn degenerate_geotransform_is_rejected() {
		assert!(AffineSensorModel::new([0.0; 6]).is_err());
	}

	#[test]
	fn composite_exposes_both_models() {
		let approximate: Arc<dyn SensorModel> = Arc::new(model());
		let precise: Arc<dyn SensorModel> = Arc::new(model());
		let sensor = ImageSensor::Composite {
			approximate: approximate.clone(),
			precise,
		};
		assert!(sensor.is_composite());
		let single = ImageSensor::Single(approximate);
		assert!(!single.is_composite());
	}
}
