//! Non-maximum suppression over normalized bounding boxes.
//!
//! Boxes are `[x1, y1, x2, y2]` with all coordinates normalized to `[0, 1]`.
//! Inputs arrive as one list per model so detections from an ensemble can be
//! fused with per-model weights before selection.

use anyhow::{ensure, Result};

/// A surviving detection: its index into the concatenated input plus the
/// (possibly adjusted) score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Selected {
	pub index: usize,
	pub score: f64,
	pub label: usize,
}

#[derive(Clone, Copy, Debug)]
struct Detection {
	bbox: [f64; 4],
	score: f64,
	label: usize,
	index: usize,
}

/// Standard NMS across one or more models.
pub fn nms(
	boxes: &[Vec<[f64; 4]>],
	scores: &[Vec<f64>],
	labels: &[Vec<usize>],
	weights: Option<&[f64]>,
	iou_threshold: f64,
) -> Result<Vec<Selected>> {
	run(boxes, scores, labels, weights, |group| {
		standard_nms(group, iou_threshold)
	})
}

/// Gaussian soft-NMS across one or more models. Scores decay by
/// `exp(-IoU²/σ)` against each higher-scored box; detections whose final
/// score does not exceed `skip_threshold` are dropped.
pub fn soft_nms(
	boxes: &[Vec<[f64; 4]>],
	scores: &[Vec<f64>],
	labels: &[Vec<usize>],
	weights: Option<&[f64]>,
	sigma: f64,
	skip_threshold: f64,
) -> Result<Vec<Selected>> {
	run(boxes, scores, labels, weights, |group| {
		gaussian_soft_nms(group, sigma, skip_threshold)
	})
}

fn run(
	boxes: &[Vec<[f64; 4]>],
	scores: &[Vec<f64>],
	labels: &[Vec<usize>],
	weights: Option<&[f64]>,
	select: impl Fn(Vec<Detection>) -> Vec<Selected>,
) -> Result<Vec<Selected>> {
	ensure!(
		boxes.len() == scores.len() && boxes.len() == labels.len(),
		"input lengths must match: boxes={}, scores={}, labels={}",
		boxes.len(),
		scores.len(),
		labels.len()
	);
	if let Some(weights) = weights {
		ensure!(
			weights.len() == boxes.len(),
			"incorrect number of weights: {} for {} models",
			weights.len(),
			boxes.len()
		);
	}
	let weight_sum: f64 = weights.map(|w| w.iter().sum()).unwrap_or(0.0);

	// Concatenate the per-model inputs, applying normalized model weights.
	let mut detections = Vec::new();
	let mut global_index = 0usize;
	for (model, ((model_boxes, model_scores), model_labels)) in
		boxes.iter().zip(scores.iter()).zip(labels.iter()).enumerate()
	{
		ensure!(
			model_boxes.len() == model_scores.len() && model_boxes.len() == model_labels.len(),
			"input lengths must match at model {model}: boxes={}, scores={}, labels={}",
			model_boxes.len(),
			model_scores.len(),
			model_labels.len()
		);
		let weight = weights.map(|w| w[model] / weight_sum).unwrap_or(1.0);
		for i in 0..model_boxes.len() {
			let bbox = clamp_box(model_boxes[i]);
			let detection = Detection {
				bbox,
				score: model_scores[i] * weight,
				label: model_labels[i],
				index: global_index,
			};
			global_index += 1;
			if area(&detection.bbox) > 0.0 {
				detections.push(detection);
			}
		}
	}

	// Run selection independently for each label.
	let mut unique_labels: Vec<usize> = detections.iter().map(|d| d.label).collect();
	unique_labels.sort_unstable();
	unique_labels.dedup();

	let mut selected = Vec::new();
	for label in unique_labels {
		let group: Vec<Detection> = detections.iter().filter(|d| d.label == label).copied().collect();
		selected.extend(select(group));
	}
	Ok(selected)
}

/// Clamps coordinates to `[0, 1]` and fixes inverted corners.
fn clamp_box(bbox: [f64; 4]) -> [f64; 4] {
	let clamped: Vec<f64> = bbox.iter().map(|v| v.clamp(0.0, 1.0)).collect();
	[
		clamped[0].min(clamped[2]),
		clamped[1].min(clamped[3]),
		clamped[0].max(clamped[2]),
		clamped[1].max(clamped[3]),
	]
}

fn area(bbox: &[f64; 4]) -> f64 {
	(bbox[2] - bbox[0]) * (bbox[3] - bbox[1])
}

fn iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
	let xx1 = a[0].max(b[0]);
	let yy1 = a[1].max(b[1]);
	let xx2 = a[2].min(b[2]);
	let yy2 = a[3].min(b[3]);
	let w = (xx2 - xx1).max(0.0);
	let h = (yy2 - yy1).max(0.0);
	let inter = w * h;
	inter / (area(a) + area(b) - inter)
}

fn standard_nms(mut group: Vec<Detection>, iou_threshold: f64) -> Vec<Selected> {
	group.sort_by(|a, b| b.score.total_cmp(&a.score));
	let mut keep = Vec::new();
	while let Some(top) = group.first().copied() {
		keep.push(Selected {
			index: top.index,
			score: top.score,
			label: top.label,
		});
		group = group
			.into_iter()
			.skip(1)
			.filter(|d| iou(&top.bbox, &d.bbox) <= iou_threshold)
			.collect();
	}
	keep
}

fn gaussian_soft_nms(mut group: Vec<Detection>, sigma: f64, skip_threshold: f64) -> Vec<Selected> {
	let n = group.len();
	for i in 0..n {
		// Move the highest remaining score to position i.
		let max_pos = (i..n)
			.max_by(|&a, &b| group[a].score.total_cmp(&group[b].score))
			.unwrap_or(i);
		group.swap(i, max_pos);

		let top_bbox = group[i].bbox;
		for other in group.iter_mut().skip(i + 1) {
			let overlap = iou(&top_bbox, &other.bbox);
			other.score *= (-(overlap * overlap) / sigma).exp();
		}
	}
	group
		.into_iter()
		.filter(|d| d.score > skip_threshold)
		.map(|d| Selected {
			index: d.index,
			score: d.score,
			label: d.label,
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_relative_eq;

	#[test]
	fn nms_drops_high_iou_duplicates() {
		let boxes = vec![vec![
			[0.1, 0.1, 0.5, 0.5],
			[0.11, 0.11, 0.51, 0.51],
			[0.7, 0.7, 0.9, 0.9],
		]];
		let scores = vec![vec![0.9, 0.8, 0.7]];
		let labels = vec![vec![0, 0, 0]];
		let keep = nms(&boxes, &scores, &labels, None, 0.5).unwrap();
		let kept: Vec<usize> = keep.iter().map(|s| s.index).collect();
		assert_eq!(kept, vec![0, 2]);
	}

	#[test]
	fn nms_keeps_duplicates_with_different_labels() {
		let boxes = vec![vec![[0.1, 0.1, 0.5, 0.5], [0.1, 0.1, 0.5, 0.5]]];
		let scores = vec![vec![0.9, 0.8]];
		let labels = vec![vec![0, 1]];
		let keep = nms(&boxes, &scores, &labels, None, 0.5).unwrap();
		assert_eq!(keep.len(), 2);
	}

	#[test]
	fn soft_nms_decays_overlapping_scores() {
		let boxes = vec![vec![[0.1, 0.1, 0.5, 0.5], [0.1, 0.1, 0.5, 0.5]]];
		let scores = vec![vec![0.9, 0.8]];
		let labels = vec![vec![0, 0]];
		let keep = soft_nms(&boxes, &scores, &labels, None, 0.5, 0.001).unwrap();
		assert_eq!(keep.len(), 2);
		let winner = keep.iter().find(|s| s.index == 0).unwrap();
		let loser = keep.iter().find(|s| s.index == 1).unwrap();
		assert_relative_eq!(winner.score, 0.9);
		// identical boxes have IoU 1.0 -> decay by exp(-1/sigma)
		assert_relative_eq!(loser.score, 0.8 * (-1.0f64 / 0.5).exp(), epsilon = 1e-12);
	}

	#[test]
	fn soft_nms_skip_threshold_drops_features() {
		let boxes = vec![vec![[0.1, 0.1, 0.5, 0.5], [0.1, 0.1, 0.5, 0.5]]];
		let scores = vec![vec![0.9, 0.8]];
		let labels = vec![vec![0, 0]];
		// Aggressive decay with a high threshold removes the overlapped box.
		let keep = soft_nms(&boxes, &scores, &labels, None, 0.1, 0.5).unwrap();
		assert_eq!(keep.len(), 1);
		assert_eq!(keep[0].index, 0);
	}

	#[test]
	fn model_weights_normalize_scores() {
		let boxes = vec![vec![[0.1, 0.1, 0.5, 0.5]], vec![[0.6, 0.6, 0.9, 0.9]]];
		let scores = vec![vec![0.8], vec![0.8]];
		let labels = vec![vec![0], vec![0]];
		let keep = nms(&boxes, &scores, &labels, Some(&[3.0, 1.0]), 0.5).unwrap();
		let first = keep.iter().find(|s| s.index == 0).unwrap();
		let second = keep.iter().find(|s| s.index == 1).unwrap();
		assert_relative_eq!(first.score, 0.8 * 0.75);
		assert_relative_eq!(second.score, 0.8 * 0.25);
	}

	#[test]
	fn mismatched_lengths_fail() {
		let boxes = vec![vec![[0.1, 0.1, 0.5, 0.5]]];
		let scores = vec![vec![0.9, 0.8]];
		let labels = vec![vec![0]];
		assert!(nms(&boxes, &scores, &labels, None, 0.5).is_err());
	}
}
