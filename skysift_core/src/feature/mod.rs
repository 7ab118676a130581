//! GeoJSON feature model for detector output.
//!
//! Detectors return GeoJSON feature collections whose features carry an
//! image-coordinate bounding box and a list of scored classes in their
//! properties. [`ImageFeature`] wraps the raw JSON with typed accessors for
//! the properties this system reads and rewrites, including the deprecated
//! property names still emitted by older models.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Current property holding the `[x1, y1, x2, y2]` image bounding box.
pub const PROP_IMAGE_BBOX: &str = "imageBBox";
/// Current property holding an image-space polygon (list of `[x, y]` vertices).
pub const PROP_IMAGE_GEOMETRY: &str = "imageGeometry";
/// Current property holding the scored classes: `[{iri, score}]`.
pub const PROP_FEATURE_CLASSES: &str = "featureClasses";

/// Deprecated bounding-box property emitted by older models.
pub const PROP_BOUNDS_IMCOORDS: &str = "bounds_imcoords";
/// Deprecated image-geometry property emitted by older models.
pub const PROP_GEOM_IMCOORDS: &str = "geom_imcoords";
/// Deprecated class-score map emitted by older models.
pub const PROP_FEATURE_TYPES: &str = "feature_types";

/// A single scored class attached to a detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureClass {
	pub iri: String,
	pub score: f64,
	#[serde(rename = "rawScore", skip_serializing_if = "Option::is_none")]
	pub raw_score: Option<f64>,
}

/// A GeoJSON feature with image-coordinate detection properties.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageFeature {
	pub id: Option<Value>,
	pub geometry: Option<Value>,
	pub properties: Map<String, Value>,
	pub bbox: Option<Vec<f64>>,
}

impl ImageFeature {
	pub fn new() -> Self {
		ImageFeature {
			id: None,
			geometry: None,
			properties: Map::new(),
			bbox: None,
		}
	}

	/// Decodes one feature from its GeoJSON value.
	pub fn from_json(value: &Value) -> Result<Self> {
		let obj = value.as_object().context("feature is not a JSON object")?;
		ensure!(
			obj.get("type").and_then(Value::as_str) == Some("Feature"),
			"GeoJSON object is not of type 'Feature'"
		);
		let properties = match obj.get("properties") {
			Some(Value::Object(map)) => map.clone(),
			_ => Map::new(),
		};
		let bbox = obj.get("bbox").and_then(|b| {
			b.as_array()
				.map(|a| a.iter().filter_map(Value::as_f64).collect::<Vec<f64>>())
		});
		Ok(ImageFeature {
			id: obj.get("id").cloned(),
			geometry: obj.get("geometry").filter(|g| !g.is_null()).cloned(),
			properties,
			bbox,
		})
	}

	/// Encodes this feature back to a GeoJSON value.
	pub fn to_json(&self) -> Value {
		let mut obj = Map::new();
		obj.insert("type".to_string(), json!("Feature"));
		if let Some(id) = &self.id {
			obj.insert("id".to_string(), id.clone());
		}
		obj.insert(
			"geometry".to_string(),
			self.geometry.clone().unwrap_or(Value::Null),
		);
		obj.insert(
			"properties".to_string(),
			Value::Object(self.properties.clone()),
		);
		if let Some(bbox) = &self.bbox {
			obj.insert("bbox".to_string(), json!(bbox));
		}
		Value::Object(obj)
	}

	// -------------------------------------------------------------------
	// Image-coordinate accessors
	// -------------------------------------------------------------------

	/// Returns the image bounding box, preferring the current property name
	/// over the deprecated one.
	pub fn image_bbox(&self) -> Option<[f64; 4]> {
		for key in [PROP_IMAGE_BBOX, PROP_BOUNDS_IMCOORDS] {
			if let Some(bbox) = self.properties.get(key).and_then(as_bbox) {
				return Some(bbox);
			}
		}
		None
	}

	pub fn set_image_bbox(&mut self, bbox: [f64; 4]) {
		self
			.properties
			.insert(PROP_IMAGE_BBOX.to_string(), json!(bbox));
	}

	/// Returns the image-space polygon vertices if the feature carries one.
	pub fn image_polygon(&self) -> Option<Vec<[f64; 2]>> {
		for key in [PROP_IMAGE_GEOMETRY, PROP_GEOM_IMCOORDS] {
			if let Some(points) = self.properties.get(key).and_then(as_point_list) {
				return Some(points);
			}
		}
		None
	}

	pub fn set_image_polygon(&mut self, points: &[[f64; 2]]) {
		self
			.properties
			.insert(PROP_IMAGE_GEOMETRY.to_string(), json!(points));
	}

	/// The `[minx, miny, maxx, maxy]` envelope of whatever image geometry this
	/// feature carries. Used to key the overlap-deduplication grouping.
	pub fn image_bounds(&self) -> Option<[f64; 4]> {
		if let Some(bbox) = self.image_bbox() {
			return Some(bbox);
		}
		let points = self.image_polygon()?;
		let mut bounds = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
		for p in &points {
			bounds[0] = bounds[0].min(p[0]);
			bounds[1] = bounds[1].min(p[1]);
			bounds[2] = bounds[2].max(p[0]);
			bounds[3] = bounds[3].max(p[1]);
		}
		if bounds[0].is_finite() {
			Some(bounds)
		} else {
			None
		}
	}

	/// Shifts all image-coordinate geometry by `(dx, dy)`, rewriting onto the
	/// current property names.
	pub fn translate(&mut self, dx: f64, dy: f64) {
		if let Some(bbox) = self.image_bbox() {
			self.set_image_bbox([bbox[0] + dx, bbox[1] + dy, bbox[2] + dx, bbox[3] + dy]);
		}
		if let Some(points) = self.image_polygon() {
			let moved: Vec<[f64; 2]> = points.iter().map(|p| [p[0] + dx, p[1] + dy]).collect();
			self.set_image_polygon(&moved);
		}
	}

	// -------------------------------------------------------------------
	// Classes
	// -------------------------------------------------------------------

	pub fn feature_classes(&self) -> Vec<FeatureClass> {
		self
			.properties
			.get(PROP_FEATURE_CLASSES)
			.and_then(|v| serde_json::from_value(v.clone()).ok())
			.unwrap_or_default()
	}

	pub fn set_feature_classes(&mut self, classes: &[FeatureClass]) {
		self.properties.insert(
			PROP_FEATURE_CLASSES.to_string(),
			serde_json::to_value(classes).unwrap_or(Value::Null),
		);
	}

	/// The class with the highest score, used as the label during selection.
	pub fn best_class(&self) -> Option<FeatureClass> {
		self
			.feature_classes()
			.into_iter()
			.max_by(|a, b| a.score.total_cmp(&b.score))
	}

	/// Converts the deprecated `feature_types` score map into the
	/// `featureClasses` list expected by the rest of the system.
	pub fn convert_legacy_classes(&mut self) {
		if self.properties.contains_key(PROP_FEATURE_CLASSES) {
			return;
		}
		let Some(Value::Object(types)) = self.properties.get(PROP_FEATURE_TYPES).cloned() else {
			return;
		};
		let classes: Vec<FeatureClass> = types
			.iter()
			.filter_map(|(iri, score)| {
				score.as_f64().map(|score| FeatureClass {
					iri: iri.clone(),
					score,
					raw_score: None,
				})
			})
			.collect();
		self.set_feature_classes(&classes);
		self.properties.remove(PROP_FEATURE_TYPES);
	}

	// -------------------------------------------------------------------
	// Generic properties
	// -------------------------------------------------------------------

	pub fn set_property(&mut self, key: &str, value: Value) {
		self.properties.insert(key.to_string(), value);
	}

	pub fn remove_property(&mut self, key: &str) -> Option<Value> {
		self.properties.remove(key)
	}
}

impl Default for ImageFeature {
	fn default() -> Self {
		ImageFeature::new()
	}
}

/// Decodes a GeoJSON `FeatureCollection` body into features.
///
/// A body without a `features` member decodes to an empty list so that an
/// empty model response does not crash a tile worker.
pub fn parse_feature_collection(body: &str) -> Result<Vec<ImageFeature>> {
	let value: Value = serde_json::from_str(body).context("response is not valid JSON")?;
	collect_features(&value)
}

/// Extracts features from an already-decoded GeoJSON value.
pub fn collect_features(value: &Value) -> Result<Vec<ImageFeature>> {
	let Some(features) = value.get("features").and_then(Value::as_array) else {
		return Ok(vec![]);
	};
	features.iter().map(ImageFeature::from_json).collect()
}

/// Encodes features as a GeoJSON `FeatureCollection` value.
pub fn feature_collection_json(features: &[ImageFeature]) -> Value {
	json!({
		"type": "FeatureCollection",
		"features": features.iter().map(ImageFeature::to_json).collect::<Vec<Value>>(),
	})
}

fn as_bbox(value: &Value) -> Option<[f64; 4]> {
	let arr = value.as_array()?;
	if arr.len() != 4 {
		return None;
	}
	let mut bbox = [0.0; 4];
	for (i, v) in arr.iter().enumerate() {
		bbox[i] = v.as_f64()?;
	}
	Some(bbox)
}

fn as_point_list(value: &Value) -> Option<Vec<[f64; 2]>> {
	let arr = value.as_array()?;
	let mut points = Vec::with_capacity(arr.len());
	for p in arr {
		let pair = p.as_array()?;
		if pair.len() < 2 {
			return None;
		}
		points.push([pair[0].as_f64()?, pair[1].as_f64()?]);
	}
	Some(points)
}
