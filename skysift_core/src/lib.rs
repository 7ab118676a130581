//! Core building blocks for the skysift image-inference orchestrator.
//!
//! Contains the pixel geometry primitives, the GeoJSON feature model, the tiling
//! strategies used to decompose large images into regions and tiles, the
//! non-maximum-suppression feature selector, and the feature refinery that
//! geolocates detections using a sensor model.

pub mod feature;
pub mod geo;
pub mod raster;
pub mod refine;
pub mod select;
pub mod sensor;
pub mod tiling;
pub mod types;

pub use types::*;
