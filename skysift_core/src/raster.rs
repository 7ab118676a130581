//! Contracts for the external image library.
//!
//! Raster I/O, tile encoding and sensor-model construction are external
//! collaborators. This module defines the traits the orchestrator programs
//! against, the scoped guard for process-wide raster configuration, and a
//! synthetic raster used by tests and the demo binary.

use crate::geo::{GeoExtents, ImageCoordinate};
use crate::sensor::ImageSensor;
use crate::types::{PixelRegion, TileCompression, TileFormat};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Encodes image regions into the tile format a model endpoint expects.
pub trait TileFactory: Send + Sync {
	fn encode_tile(
		&self,
		bounds: &PixelRegion,
		format: TileFormat,
		compression: TileCompression,
	) -> Result<Vec<u8>>;
}

/// An opened raster image.
pub trait RasterDataset: TileFactory + Send + Sync + Debug {
	fn width(&self) -> u32;
	fn height(&self) -> u32;

	/// Upper-cased short format name, e.g. `NITF` or `GTIFF`.
	fn extension(&self) -> String;

	/// The sensor model imputed from the image metadata, when the image is
	/// geo-referenced.
	fn sensor(&self) -> Option<ImageSensor>;

	/// A raw metadata header value, if present.
	fn metadata_value(&self, key: &str) -> Option<String>;

	fn full_extent(&self) -> PixelRegion {
		PixelRegion::of_image(self.width(), self.height())
	}
}

/// Opens rasters by URL, optionally with request-scoped read credentials.
#[async_trait]
pub trait RasterOpener: Send + Sync + Debug {
	async fn open(
		&self,
		image_url: &str,
		read_credentials: Option<&str>,
	) -> Result<Arc<dyn RasterDataset>>;
}

/// Geographic extents of a dataset computed through its sensor model.
pub fn dataset_extents(dataset: &dyn RasterDataset) -> Result<Option<GeoExtents>> {
	let Some(sensor) = dataset.sensor() else {
		return Ok(None);
	};
	let w = dataset.width() as f64;
	let h = dataset.height() as f64;
	let corners = [
		ImageCoordinate::new(0.0, 0.0),
		ImageCoordinate::new(w, 0.0),
		ImageCoordinate::new(w, h),
		ImageCoordinate::new(0.0, h),
	];
	let mut extents = GeoExtents {
		north: f64::NEG_INFINITY,
		south: f64::INFINITY,
		east: f64::NEG_INFINITY,
		west: f64::INFINITY,
	};
	for corner in corners {
		let world = sensor.precise().image_to_world(corner, None)?;
		let [lon, lat, _] = world.to_degrees();
		extents.north = extents.north.max(lat);
		extents.south = extents.south.min(lat);
		extents.east = extents.east.max(lon);
		extents.west = extents.west.min(lon);
	}
	Ok(Some(extents))
}

/// Builds the `sourceMetadata` property for recognized image formats.
///
/// Only NITF images carry the headers we can translate; other formats yield
/// `None` and the features go out with caller-supplied properties only.
pub fn source_property(image_location: &str, dataset: &dyn RasterDataset) -> Option<Value> {
	if dataset.extension() != "NITF" {
		log::debug!(
			"source metadata not available for {} images",
			dataset.extension()
		);
		return None;
	}
	Some(json!({
		"sourceMetadata": [{
			"location": image_location,
			"format": "NITF",
			"category": dataset.metadata_value("NITF_ICAT"),
			"sourceId": dataset.metadata_value("NITF_FTITLE"),
			"sourceDT": dataset.metadata_value("NITF_IDATIM"),
		}]
	}))
}

// ---------------------------------------------------------------------------
// Process-wide raster configuration
// ---------------------------------------------------------------------------

static RASTER_OPTIONS: Mutex<Option<HashMap<String, String>>> = Mutex::new(None);

/// Reads a process-wide raster configuration option.
pub fn raster_option(key: &str) -> Option<String> {
	RASTER_OPTIONS.lock().as_ref().and_then(|m| m.get(key).cloned())
}

/// Applies raster configuration options for the duration of one request.
///
/// The raster library's configuration is process-wide; this guard restores the
/// previous values on drop so one request's credentials never leak into the
/// next.
pub struct RasterEnvGuard {
	previous: Vec<(String, Option<String>)>,
}

impl RasterEnvGuard {
	pub fn apply(options: &[(String, String)]) -> Self {
		let mut store = RASTER_OPTIONS.lock();
		let map = store.get_or_insert_with(HashMap::new);
		let mut previous = Vec::with_capacity(options.len());
		for (key, value) in options {
			previous.push((key.clone(), map.insert(key.clone(), value.clone())));
		}
		RasterEnvGuard { previous }
	}
}

impl Drop for RasterEnvGuard {
	fn drop(&mut self) {
		let mut store = RASTER_OPTIONS.lock();
		let map = store.get_or_insert_with(HashMap::new);
		for (key, value) in self.previous.drain(..) {
			match value {
				Some(value) => {
					map.insert(key, value);
				}
				None => {
					map.remove(&key);
				}
			}
		}
	}
}

// ---------------------------------------------------------------------------
// Synthetic raster
// ---------------------------------------------------------------------------

/// An in-memory raster used by tests and the demo binary. Tiles encode to a
/// small deterministic payload describing their bounds.
#[derive(Clone, Debug)]
pub struct SyntheticRaster {
	width: u32,
	height: u32,
	extension: String,
	sensor: Option<ImageSensor>,
	metadata: HashMap<String, String>,
}

impl SyntheticRaster {
	pub fn new(width: u32, height: u32) -> Self {
		SyntheticRaster {
			width,
			height,
			extension: "NITF".to_string(),
			sensor: None,
			metadata: HashMap::new(),
		}
	}

	pub fn with_sensor(mut self, sensor: ImageSensor) -> Self {
		self.sensor = Some(sensor);
		self
	}

	pub fn with_extension(mut self, extension: &str) -> Self {
		self.extension = extension.to_string();
		self
	}

	pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
		self.metadata.insert(key.to_string(), value.to_string());
		self
	}
}

impl TileFactory for SyntheticRaster {
	fn encode_tile(
		&self,
		bounds: &PixelRegion,
		format: TileFormat,
		_compression: TileCompression,
	) -> Result<Vec<u8>> {
		Ok(format!(
			"{}:{}:{}:{}:{}",
			format, bounds.row, bounds.col, bounds.width, bounds.height
		)
		.into_bytes())
	}
}

impl RasterDataset for SyntheticRaster {
	fn width(&self) -> u32 {
		self.width
	}

	fn height(&self) -> u32 {
		self.height
	}

	fn extension(&self) -> String {
		self.extension.clone()
	}

	fn sensor(&self) -> Option<ImageSensor> {
		self.sensor.clone()
	}

	fn metadata_value(&self, key: &str) -> Option<String> {
		self.metadata.get(key).cloned()
	}
}

/// Opens a [`SyntheticRaster`] for any URL.
#[derive(Clone, Debug)]
pub struct SyntheticRasterOpener {
	raster: Arc<SyntheticRaster>,
}

impl SyntheticRasterOpener {
	pub fn new(raster: SyntheticRaster) -> Self {
		SyntheticRasterOpener {
			raster: Arc::new(raster),
		}
	}
}

#[async_trait]
impl RasterOpener for SyntheticRasterOpener {
	async fn open(
		&self,
		_image_url: &str,
		_read_credentials: Option<&str>,
	) -> Result<Arc<dyn RasterDataset>> {
		Ok(self.raster.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sensor::AffineSensorModel;

	#[test]
	fn env_guard_restores_previous_options() {
		{
			let _outer = RasterEnvGuard::apply(&[("ACCESS_KEY".into(), "outer".into())]);
			assert_eq!(raster_option("ACCESS_KEY"), Some("outer".to_string()));
			{
				let _inner = RasterEnvGuard::apply(&[("ACCESS_KEY".into(), "inner".into())]);
				assert_eq!(raster_option("ACCESS_KEY"), Some("inner".to_string()));
			}
			assert_eq!(raster_option("ACCESS_KEY"), Some("outer".to_string()));
		}
		assert_eq!(raster_option("ACCESS_KEY"), None);
	}

	#[test]
	fn source_property_only_for_nitf() {
		let nitf = SyntheticRaster::new(10, 10).with_metadata("NITF_ICAT", "VIS");
		let property = source_property("s3://bucket/image.ntf", &nitf).unwrap();
		assert_eq!(property["sourceMetadata"][0]["category"], "VIS");

		let tiff = SyntheticRaster::new(10, 10).with_extension("GTIFF");
		assert!(source_property("s3://bucket/image.tif", &tiff).is_none());
	}

	#[test]
	fn dataset_extents_cover_corners() {
		let sensor = ImageSensor::Single(std::sync::Arc::new(
			AffineSensorModel::new([10.0, 1e-5, 0.0, 50.0, 0.0, -1e-5]).unwrap(),
		));
		let raster = SyntheticRaster::new(1000, 2000).with_sensor(sensor);
		let extents = dataset_extents(&raster).unwrap().unwrap();
		assert!(extents.north > extents.south);
		assert!(extents.east > extents.west);
		assert_eq!(extents.north, 50.0);
		assert_eq!(extents.west, 10.0);
	}

	#[tokio::test]
	async fn synthetic_opener_returns_raster() {
		let opener = SyntheticRasterOpener::new(SyntheticRaster::new(64, 64));
		let dataset = opener.open("s3://bucket/any.ntf", None).await.unwrap();
		assert_eq!(dataset.width(), 64);
		let tile = dataset
			.encode_tile(
				&PixelRegion::new(0, 0, 32, 32),
				TileFormat::Nitf,
				TileCompression::None,
			)
			.unwrap();
		assert_eq!(String::from_utf8(tile).unwrap(), "NITF:0:0:32:32");
	}
}
