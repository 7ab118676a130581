//! Request types and external message decoding.
//!
//! Image requests arrive as JSON messages on the external image queue;
//! region requests are internal messages produced by the image handler.
//! Both share a set of tile/model properties validated the same way.

use crate::error::RunnerError;
use crate::roi::parse_wkt_polygon;
use anyhow::{anyhow, Context, Result};
use geo_types::Polygon;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skysift_core::select::DistillationAlgorithm;
use skysift_core::types::{
	ModelInvokeMode, PixelRegion, PixelSize, TileCompression, TileFormat,
};

/// Where the aggregate feature collection is written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkDescriptor {
	#[serde(rename = "S3")]
	ObjectStore {
		bucket: String,
		prefix: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		role: Option<String>,
	},
	#[serde(rename = "Kinesis")]
	Stream {
		stream: String,
		#[serde(rename = "batchSize", default, skip_serializing_if = "Option::is_none")]
		batch_size: Option<usize>,
		#[serde(rename = "assumedRole", default, skip_serializing_if = "Option::is_none")]
		assumed_role: Option<String>,
	},
}

/// A request to run a detector over one image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageRequest {
	pub job_id: String,
	/// `job_id:image_url` by construction.
	pub image_id: String,
	pub image_url: String,
	pub image_read_credentials: Option<String>,
	pub model_name: String,
	pub model_invoke_mode: ModelInvokeMode,
	pub model_invocation_credentials: Option<String>,
	pub tile_size: PixelSize,
	pub tile_overlap: PixelSize,
	pub tile_format: TileFormat,
	pub tile_compression: TileCompression,
	pub outputs: Vec<SinkDescriptor>,
	pub feature_properties: Vec<Value>,
	pub roi: Option<Polygon<f64>>,
	pub post_processing: Vec<DistillationAlgorithm>,
}

impl ImageRequest {
	/// Decodes the external queue message format.
	pub fn from_external_message(message: &Value) -> Result<Self> {
		let job_id = message
			.get("jobId")
			.and_then(Value::as_str)
			.context("missing jobId")?
			.to_string();
		let image_url = message
			.get("imageUrls")
			.and_then(Value::as_array)
			.and_then(|urls| urls.first())
			.and_then(Value::as_str)
			.context("missing imageUrls[0]")?
			.to_string();
		let processor = message
			.get("imageProcessor")
			.and_then(Value::as_object)
			.context("missing imageProcessor")?;
		let model_name = processor
			.get("name")
			.and_then(Value::as_str)
			.context("missing imageProcessor.name")?
			.to_string();
		let model_invoke_mode = processor
			.get("type")
			.and_then(Value::as_str)
			.map(|t| {
				ModelInvokeMode::parse(t).ok_or_else(|| {
					anyhow::Error::new(RunnerError::UnsupportedModel(format!(
						"unknown imageProcessor.type '{t}'"
					)))
				})
			})
			.transpose()?
			.unwrap_or(ModelInvokeMode::HostedEndpoint);

		let tile_side = parse_dimension(message.get("imageProcessorTileSize"))?.unwrap_or(1024);
		let overlap_side = parse_dimension(message.get("imageProcessorTileOverlap"))?.unwrap_or(50);
		let tile_format = message
			.get("imageProcessorTileFormat")
			.and_then(Value::as_str)
			.map(TileFormat::parse)
			.transpose()?
			.unwrap_or_default();
		let tile_compression = message
			.get("imageProcessorTileCompression")
			.and_then(Value::as_str)
			.map(TileCompression::parse)
			.transpose()?
			.unwrap_or_default();

		let roi = message
			.get("regionOfInterest")
			.and_then(Value::as_str)
			.map(parse_wkt_polygon)
			.transpose()
			.context("failed to parse regionOfInterest")?;

		Ok(ImageRequest {
			image_id: format!("{job_id}:{image_url}"),
			job_id,
			image_url,
			image_read_credentials: string_field(message, "imageReadRole"),
			model_name,
			model_invoke_mode,
			model_invocation_credentials: processor
				.get("assumedRole")
				.and_then(Value::as_str)
				.filter(|s| !s.is_empty())
				.map(str::to_string),
			tile_size: PixelSize::square(tile_side),
			tile_overlap: PixelSize::square(overlap_side),
			tile_format,
			tile_compression,
			outputs: parse_outputs(message)?,
			feature_properties: message
				.get("featureProperties")
				.and_then(Value::as_array)
				.cloned()
				.unwrap_or_default(),
			roi,
			post_processing: parse_post_processing(message.get("postProcessing"))?,
		})
	}

	/// Checks the request for required attributes and meaningful values.
	pub fn validate(&self) -> Result<()> {
		validate_shared(&SharedProperties {
			image_id: &self.image_id,
			image_url: &self.image_url,
			model_name: &self.model_name,
			tile_size: self.tile_size,
			tile_overlap: self.tile_overlap,
			image_read_credentials: self.image_read_credentials.as_deref(),
			model_invocation_credentials: self.model_invocation_credentials.as_deref(),
		})?;
		if self.job_id.is_empty() {
			return Err(RunnerError::InvalidImageRequest("missing job id".into()).into());
		}
		if self.post_processing.len() > 1 {
			return Err(RunnerError::InvalidImageRequest(
				"at most one feature distillation option is allowed".into(),
			)
			.into());
		}
		Ok(())
	}

	/// The configured feature-distillation algorithm, if any.
	pub fn feature_distillation_option(&self) -> Option<DistillationAlgorithm> {
		self.post_processing.first().copied()
	}

	/// Builds the region request message for one region of this image.
	pub fn region_request(&self, region: &PixelRegion, image_extension: &str) -> RegionRequest {
		RegionRequest {
			region_id: region_id(region, &self.job_id),
			image_id: self.image_id.clone(),
			image_extension: image_extension.to_string(),
			job_id: self.job_id.clone(),
			image_url: self.image_url.clone(),
			image_read_credentials: self.image_read_credentials.clone(),
			model_name: self.model_name.clone(),
			model_invoke_mode: self.model_invoke_mode,
			model_invocation_credentials: self.model_invocation_credentials.clone(),
			tile_size: self.tile_size,
			tile_overlap: self.tile_overlap,
			tile_format: self.tile_format,
			tile_compression: self.tile_compression,
			region_bounds: *region,
		}
	}
}

/// Key for a region job: upper-left corner plus the owning job.
pub fn region_id(region: &PixelRegion, job_id: &str) -> String {
	format!("{}:{}-{}", region.col, region.row, job_id)
}

/// A request to process one region of an image, sent over the region queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionRequest {
	pub region_id: String,
	pub image_id: String,
	pub image_extension: String,
	pub job_id: String,
	pub image_url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_read_credentials: Option<String>,
	pub model_name: String,
	pub model_invoke_mode: ModelInvokeMode,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model_invocation_credentials: Option<String>,
	pub tile_size: PixelSize,
	pub tile_overlap: PixelSize,
	pub tile_format: TileFormat,
	pub tile_compression: TileCompression,
	pub region_bounds: PixelRegion,
}

impl RegionRequest {
	pub fn validate(&self) -> Result<()> {
		validate_shared(&SharedProperties {
			image_id: &self.image_id,
			image_url: &self.image_url,
			model_name: &self.model_name,
			tile_size: self.tile_size,
			tile_overlap: self.tile_overlap,
			image_read_credentials: self.image_read_credentials.as_deref(),
			model_invocation_credentials: self.model_invocation_credentials.as_deref(),
		})?;
		if self.region_bounds.is_empty() {
			return Err(RunnerError::InvalidImageRequest(format!(
				"degenerate region bounds {}",
				self.region_bounds
			))
			.into());
		}
		Ok(())
	}
}

struct SharedProperties<'a> {
	image_id: &'a str,
	image_url: &'a str,
	model_name: &'a str,
	tile_size: PixelSize,
	tile_overlap: PixelSize,
	image_read_credentials: Option<&'a str>,
	model_invocation_credentials: Option<&'a str>,
}

/// Validation common to image and region requests.
fn validate_shared(properties: &SharedProperties) -> Result<()> {
	let fail = |message: String| -> Result<()> {
		Err(RunnerError::InvalidImageRequest(message).into())
	};

	if properties.image_id.is_empty() || properties.image_url.is_empty() {
		return fail("image_id or image_url is missing".into());
	}
	if properties.model_name.is_empty() {
		return fail("model_name is missing".into());
	}
	if properties.tile_size.width == 0 || properties.tile_size.height == 0 {
		return fail(format!("tile size {} must be positive", properties.tile_size));
	}
	if properties.tile_overlap.width >= properties.tile_size.width
		|| properties.tile_overlap.height >= properties.tile_size.height
	{
		return fail(format!(
			"tile overlap {} must be less than tile size {}",
			properties.tile_overlap, properties.tile_size
		));
	}
	for credentials in [
		properties.image_read_credentials,
		properties.model_invocation_credentials,
	]
	.into_iter()
	.flatten()
	{
		if !credentials.starts_with("arn:") {
			return fail(format!("credentials reference '{credentials}' is not an arn"));
		}
	}
	Ok(())
}

fn string_field(message: &Value, key: &str) -> Option<String> {
	message
		.get(key)
		.and_then(Value::as_str)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
}

fn parse_dimension(value: Option<&Value>) -> Result<Option<u32>> {
	match value {
		None | Some(Value::Null) => Ok(None),
		Some(Value::Number(n)) => Ok(n.as_u64().map(|v| v as u32)),
		Some(Value::String(s)) => Ok(Some(s.parse().with_context(|| format!("bad dimension '{s}'"))?)),
		Some(other) => Err(anyhow!("bad tile dimension {other}")),
	}
}

/// Reads the `outputs` list, falling back to the legacy single-bucket form.
fn parse_outputs(message: &Value) -> Result<Vec<SinkDescriptor>> {
	if let Some(outputs) = message.get("outputs").and_then(Value::as_array) {
		return outputs
			.iter()
			.map(|o| {
				serde_json::from_value(o.clone())
					.with_context(|| format!("unrecognized output destination {o}"))
			})
			.collect();
	}

	// Legacy request fields: outputBucket and outputPrefix as one object store sink.
	if let (Some(bucket), Some(prefix)) = (
		string_field(message, "outputBucket"),
		string_field(message, "outputPrefix"),
	) {
		return Ok(vec![SinkDescriptor::ObjectStore {
			bucket,
			prefix,
			role: None,
		}]);
	}

	log::warn!("no output sinks were present in this request");
	Ok(vec![])
}

fn parse_post_processing(value: Option<&Value>) -> Result<Vec<DistillationAlgorithm>> {
	let Some(list) = value.and_then(Value::as_array) else {
		// The default pipeline distills duplicates with standard NMS.
		return Ok(vec![DistillationAlgorithm::default()]);
	};
	let mut algorithms = Vec::new();
	for step in list {
		let step_name = step.get("step").and_then(Value::as_str).unwrap_or("");
		if step_name != "FEATURE_DISTILLATION" {
			return Err(anyhow!("unknown post-processing step '{step_name}'"));
		}
		let algorithm = step
			.get("algorithm")
			.context("post-processing step is missing its algorithm")?;
		algorithms.push(
			serde_json::from_value(algorithm.clone())
				.with_context(|| format!("invalid feature distillation algorithm {algorithm}"))?,
		);
	}
	Ok(algorithms)
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use serde_json::json;

	fn message() -> Value {
		json!({
			"jobId": "job-1",
			"imageUrls": ["s3://imagery/scene.ntf"],
			"imageProcessor": {"name": "detector", "type": "HTTP_ENDPOINT"},
			"imageProcessorTileSize": 2048,
			"imageProcessorTileOverlap": 50,
			"outputs": [
				{"type": "S3", "bucket": "results", "prefix": "jobs/job-1"},
				{"type": "Kinesis", "stream": "detections", "batchSize": 100},
			],
			"featureProperties": [{"modelMetadata": {"modelName": "detector"}}],
		})
	}

	#[test]
	fn external_message_decodes() {
		let request = ImageRequest::from_external_message(&message()).unwrap();
		assert_eq!(request.image_id, "job-1:s3://imagery/scene.ntf");
		assert_eq!(request.model_invoke_mode, ModelInvokeMode::HttpEndpoint);
		assert_eq!(request.tile_size, PixelSize::square(2048));
		assert_eq!(request.outputs.len(), 2);
		assert_eq!(
			request.post_processing,
			vec![DistillationAlgorithm::default()]
		);
		request.validate().unwrap();
	}

	#[test]
	fn legacy_output_fields_are_accepted() {
		let mut legacy = message();
		legacy.as_object_mut().unwrap().remove("outputs");
		legacy["outputBucket"] = json!("legacy-bucket");
		legacy["outputPrefix"] = json!("legacy/prefix");
		let request = ImageRequest::from_external_message(&legacy).unwrap();
		assert_eq!(
			request.outputs,
			vec![SinkDescriptor::ObjectStore {
				bucket: "legacy-bucket".into(),
				prefix: "legacy/prefix".into(),
				role: None,
			}]
		);
	}

	#[test]
	fn invalid_overlap_fails_validation() {
		let mut bad = message();
		bad["imageProcessorTileOverlap"] = json!(2048);
		let request = ImageRequest::from_external_message(&bad).unwrap();
		assert!(request.validate().is_err());
	}

	#[test]
	fn bad_credentials_reference_fails_validation() {
		let mut bad = message();
		bad["imageReadRole"] = json!("not-an-arn");
		let request = ImageRequest::from_external_message(&bad).unwrap();
		assert!(request.validate().is_err());
	}

	#[test]
	fn missing_processor_is_an_error() {
		assert!(ImageRequest::from_external_message(&json!({"jobId": "x"})).is_err());
	}

	#[test]
	fn unsupported_processor_type_is_rejected() {
		let mut bad = message();
		bad["imageProcessor"]["type"] = json!("FTP_ENDPOINT");
		assert!(ImageRequest::from_external_message(&bad).is_err());
	}

	#[test]
	fn post_processing_descriptor_decodes() {
		let mut msg = message();
		msg["postProcessing"] = json!([{
			"step": "FEATURE_DISTILLATION",
			"algorithm": {"algorithmType": "SOFT_NMS", "iouThreshold": 0.6},
		}]);
		let request = ImageRequest::from_external_message(&msg).unwrap();
		assert!(matches!(
			request.feature_distillation_option(),
			Some(DistillationAlgorithm::SoftNms { .. })
		));
	}

	#[test]
	fn region_request_roundtrips_through_json() {
		let request = ImageRequest::from_external_message(&message()).unwrap();
		let region = PixelRegion::new(0, 10240, 10240, 10240);
		let region_request = request.region_request(&region, "NITF");
		assert_eq!(region_request.region_id, "10240:0-job-1");

		let encoded = serde_json::to_string(&region_request).unwrap();
		let decoded: RegionRequest = serde_json::from_str(&encoded).unwrap();
		assert_eq!(decoded, region_request);
		decoded.validate().unwrap();
	}

	#[test]
	fn degenerate_region_bounds_fail_validation() {
		let request = ImageRequest::from_external_message(&message()).unwrap();
		let mut region_request = request.region_request(&PixelRegion::new(0, 0, 10, 10), "NITF");
		region_request.region_bounds = PixelRegion::new(0, 0, 0, 0);
		assert!(region_request.validate().is_err());
	}
}
