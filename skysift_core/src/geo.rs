//! Coordinate types shared by the sensor models and the feature refinery.

use serde::{Deserialize, Serialize};

/// A position in image pixel space. `x` runs along columns, `y` along rows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageCoordinate {
	pub x: f64,
	pub y: f64,
}

impl ImageCoordinate {
	pub fn new(x: f64, y: f64) -> Self {
		ImageCoordinate { x, y }
	}
}

/// A geodetic position. Longitude and latitude are in **radians**, elevation
/// in meters, matching the convention of the sensor models.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorldCoordinate {
	pub longitude: f64,
	pub latitude: f64,
	pub elevation: f64,
}

impl WorldCoordinate {
	pub fn new(longitude: f64, latitude: f64, elevation: f64) -> Self {
		WorldCoordinate {
			longitude,
			latitude,
			elevation,
		}
	}

	/// GeoJSON coordinate order is `[lon, lat, elevation]` in degrees.
	pub fn to_degrees(&self) -> [f64; 3] {
		[
			self.longitude.to_degrees(),
			self.latitude.to_degrees(),
			self.elevation,
		]
	}
}

/// Geographic extents of an image in degrees, recorded on the image job for
/// visualization tools.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoExtents {
	pub north: f64,
	pub south: f64,
	pub east: f64,
	pub west: f64,
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_relative_eq;

	#[test]
	fn world_coordinate_converts_to_degrees() {
		let coord = WorldCoordinate::new(std::f64::consts::PI / 2.0, -std::f64::consts::PI / 4.0, 10.0);
		let degrees = coord.to_degrees();
		assert_relative_eq!(degrees[0], 90.0);
		assert_relative_eq!(degrees[1], -45.0);
		assert_relative_eq!(degrees[2], 10.0);
	}
}
