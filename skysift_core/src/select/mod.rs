//! Feature selection: picking the surviving detection among duplicates.
//!
//! The selector normalizes feature bounding boxes into `[0, 1]`, groups them
//! by their best-scoring class, and runs the configured algorithm per group.
//! Soft-NMS rewrites the winning class score, preserving the original as
//! `rawScore`.

mod nms;

pub use nms::{nms, soft_nms, Selected};

use crate::feature::ImageFeature;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;

fn default_iou_threshold() -> f64 {
	0.75
}
fn default_sigma() -> f64 {
	0.1
}
fn default_skip_threshold() -> f64 {
	0.0001
}

/// Feature-distillation algorithm descriptor, decoded from the
/// `postProcessing` section of an image request.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithmType")]
pub enum DistillationAlgorithm {
	#[serde(rename = "NMS")]
	Nms {
		#[serde(rename = "iouThreshold", default = "default_iou_threshold")]
		iou_threshold: f64,
	},
	#[serde(rename = "SOFT_NMS")]
	SoftNms {
		#[serde(rename = "iouThreshold", default = "default_iou_threshold")]
		iou_threshold: f64,
		#[serde(default = "default_sigma")]
		sigma: f64,
		#[serde(rename = "skipBoxThreshold", default = "default_skip_threshold")]
		skip_threshold: f64,
	},
}

impl Default for DistillationAlgorithm {
	fn default() -> Self {
		DistillationAlgorithm::Nms {
			iou_threshold: default_iou_threshold(),
		}
	}
}

/// Anything that can reduce a group of possibly-duplicated features.
///
/// The tiling strategies call this on each overlap group; tests inject stub
/// implementations.
pub trait FeatureSelection: Send + Sync + Debug {
	fn select_features(&self, features: Vec<ImageFeature>) -> Result<Vec<ImageFeature>>;
}

/// Pass-through selection, used when a request carries no distillation option.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSelection;

impl FeatureSelection for NoopSelection {
	fn select_features(&self, features: Vec<ImageFeature>) -> Result<Vec<ImageFeature>> {
		Ok(features)
	}
}

/// Selects a subset of features from a larger set using NMS or soft-NMS.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeatureSelector {
	options: Option<DistillationAlgorithm>,
}

impl FeatureSelector {
	pub fn new(options: Option<DistillationAlgorithm>) -> Self {
		FeatureSelector { options }
	}
}

impl FeatureSelection for FeatureSelector {
	fn select_features(&self, features: Vec<ImageFeature>) -> Result<Vec<ImageFeature>> {
		if features.is_empty() {
			return Ok(vec![]);
		}
		let Some(options) = self.options else {
			return Ok(features);
		};

		let (boxes, scores, label_names) = prepare_inputs(&features)?;

		// Map class names to dense label ids for the selection algorithms.
		let mut label_ids: HashMap<&str, usize> = HashMap::new();
		let labels: Vec<usize> = label_names
			.iter()
			.map(|name| {
				let next = label_ids.len();
				*label_ids.entry(name.as_str()).or_insert(next)
			})
			.collect();

		let selected = match options {
			DistillationAlgorithm::Nms { iou_threshold } => nms::nms(
				&[boxes],
				&[scores],
				&[labels],
				None,
				iou_threshold,
			)?,
			DistillationAlgorithm::SoftNms {
				sigma,
				skip_threshold,
				..
			} => nms::soft_nms(&[boxes], &[scores], &[labels], None, sigma, skip_threshold)?,
		};

		let mut result = Vec::with_capacity(selected.len());
		for s in selected {
			let mut feature = features
				.get(s.index)
				.cloned()
				.with_context(|| format!("selection produced out-of-range index {}", s.index))?;
			if matches!(options, DistillationAlgorithm::SoftNms { .. }) {
				rewrite_winning_score(&mut feature, &label_names[s.index], s.score);
			}
			result.push(feature);
		}
		Ok(result)
	}
}

/// Extracts normalized boxes, scores and class names from the features.
///
/// Zero-area boxes are widened by 0.1 pixel on their degenerate side before
/// normalization; the selection algorithms assume positive area.
fn prepare_inputs(features: &[ImageFeature]) -> Result<(Vec<[f64; 4]>, Vec<f64>, Vec<String>)> {
	let mut boxes = Vec::with_capacity(features.len());
	let mut scores = Vec::with_capacity(features.len());
	let mut labels = Vec::with_capacity(features.len());
	let mut extent = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];

	for feature in features {
		let bounds = feature
			.image_bounds()
			.context("feature has no image bounding box for selection")?;
		let bbox = [
			bounds[0],
			bounds[1],
			if bounds[0] == bounds[2] { bounds[2] + 0.1 } else { bounds[2] },
			if bounds[1] == bounds[3] { bounds[3] + 0.1 } else { bounds[3] },
		];
		extent[0] = extent[0].min(bbox[0]);
		extent[1] = extent[1].min(bbox[1]);
		extent[2] = extent[2].max(bbox[2]);
		extent[3] = extent[3].max(bbox[3]);
		boxes.push(bbox);

		match feature.best_class() {
			Some(class) => {
				scores.push(class.score);
				labels.push(class.iri);
			}
			None => bail!("feature has no scored classes for selection"),
		}
	}

	let x_range = (extent[2] - extent[0]).max(f64::EPSILON);
	let y_range = (extent[3] - extent[1]).max(f64::EPSILON);
	for bbox in &mut boxes {
		bbox[0] = (bbox[0] - extent[0]) / x_range;
		bbox[1] = (bbox[1] - extent[1]) / y_range;
		bbox[2] = (bbox[2] - extent[0]) / x_range;
		bbox[3] = (bbox[3] - extent[1]) / y_range;
	}

	Ok((boxes, scores, labels))
}

/// Overwrites the winning class score after soft-NMS, keeping the original
/// value as `rawScore`.
fn rewrite_winning_score(feature: &mut ImageFeature, label: &str, score: f64) {
	let mut classes = feature.feature_classes();
	for class in &mut classes {
		if class.iri == label {
			class.raw_score = Some(class.score);
			class.score = score;
		}
	}
	feature.set_feature_classes(&classes);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::feature::FeatureClass;
	use serde_json::json;

	fn detection(bbox: [f64; 4], iri: &str, score: f64) -> ImageFeature {
		let mut feature = ImageFeature::new();
		feature.set_image_bbox(bbox);
		feature.set_feature_classes(&[FeatureClass {
			iri: iri.to_string(),
			score,
			raw_score: None,
		}]);
		feature
	}

	#[test]
	fn selector_without_options_passes_through() {
		let selector = FeatureSelector::new(None);
		let features = vec![detection([0.0, 0.0, 10.0, 10.0], "car", 0.9)];
		assert_eq!(selector.select_features(features.clone()).unwrap(), features);
	}

	#[test]
	fn nms_selector_removes_duplicates() {
		let selector = FeatureSelector::new(Some(DistillationAlgorithm::Nms { iou_threshold: 0.5 }));
		let features = vec![
			detection([100.0, 100.0, 120.0, 120.0], "car", 0.9),
			detection([101.0, 101.0, 121.0, 121.0], "car", 0.8),
			detection([400.0, 400.0, 420.0, 420.0], "car", 0.7),
		];
		let result = selector.select_features(features).unwrap();
		assert_eq!(result.len(), 2);
		assert_eq!(result[0].best_class().unwrap().score, 0.9);
	}

	#[test]
	fn different_classes_do_not_suppress_each_other() {
		let selector = FeatureSelector::new(Some(DistillationAlgorithm::Nms { iou_threshold: 0.5 }));
		let features = vec![
			detection([100.0, 100.0, 120.0, 120.0], "car", 0.9),
			detection([100.0, 100.0, 120.0, 120.0], "truck", 0.8),
		];
		assert_eq!(selector.select_features(features).unwrap().len(), 2);
	}

	#[test]
	fn soft_nms_rewrites_scores_and_keeps_raw() {
		let selector = FeatureSelector::new(Some(DistillationAlgorithm::SoftNms {
			iou_threshold: 0.75,
			sigma: 0.5,
			skip_threshold: 0.0001,
		}));
		let features = vec![
			detection([100.0, 100.0, 120.0, 120.0], "car", 0.9),
			detection([100.0, 100.0, 120.0, 120.0], "car", 0.8),
		];
		let result = selector.select_features(features).unwrap();
		assert_eq!(result.len(), 2);
		let decayed = result
			.iter()
			.find(|f| f.best_class().unwrap().raw_score == Some(0.8))
			.expect("decayed feature present");
		assert!(decayed.best_class().unwrap().score < 0.8);
	}

	#[test]
	fn zero_area_boxes_survive_selection() {
		let selector = FeatureSelector::new(Some(DistillationAlgorithm::Nms { iou_threshold: 0.5 }));
		let features = vec![
			detection([100.0, 100.0, 100.0, 100.0], "car", 0.9),
			detection([400.0, 400.0, 420.0, 420.0], "car", 0.7),
		];
		assert_eq!(selector.select_features(features).unwrap().len(), 2);
	}

	#[test]
	fn algorithm_descriptor_parses_from_request_json() {
		let nms: DistillationAlgorithm =
			serde_json::from_value(json!({"algorithmType": "NMS", "iouThreshold": 0.6})).unwrap();
		assert_eq!(nms, DistillationAlgorithm::Nms { iou_threshold: 0.6 });

		let soft: DistillationAlgorithm =
			serde_json::from_value(json!({"algorithmType": "SOFT_NMS"})).unwrap();
		assert_eq!(
			soft,
			DistillationAlgorithm::SoftNms {
				iou_threshold: 0.75,
				sigma: 0.1,
				skip_threshold: 0.0001,
			}
		);

		assert!(serde_json::from_value::<DistillationAlgorithm>(
			json!({"algorithmType": "FANCY"})
		)
		.is_err());
	}
}
