//! Image request handling.

use super::{region_record_from_request, RegionRequestHandler};
use crate::api::{ImageRequest, SinkDescriptor};
use crate::config::ServiceConfig;
use crate::endpoint::EndpointCapacity;
use crate::error::RunnerError;
use crate::queue::MessageQueue;
use crate::roi::{calculate_processing_bounds, parse_wkt_polygon, polygon_to_wkt};
use crate::sink::{ObjectStoreClient, SinkContext, SinkFactory, StreamClient};
use crate::status::ImageStatusMonitor;
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use skysift_core::feature::{ImageFeature, PROP_BOUNDS_IMCOORDS, PROP_GEOM_IMCOORDS};
use skysift_core::raster::{dataset_extents, source_property, RasterDataset, RasterEnvGuard, RasterOpener};
use skysift_core::select::{DistillationAlgorithm, FeatureSelector};
use skysift_core::sensor::ImageSensor;
use skysift_core::tiling::TilingStrategy;
use skysift_core::types::{PixelRegion, PixelSize, RequestStatus};
use skysift_store::{
	EndpointStatisticsTable, FeatureTable, ImageJobRecord, JobTable, KvStore, RegionTable,
	RequestedJobsTable,
};
use std::sync::Arc;

/// Properties stripped from final features once the current-generation
/// properties are in place.
const DEPRECATED_PROPERTIES: [&str; 7] = [
	"inferenceTime",
	PROP_BOUNDS_IMCOORDS,
	PROP_GEOM_IMCOORDS,
	"detection_score",
	"feature_types",
	"image_id",
	"adjusted_feature_types",
];

/// Processes image requests: validation, region fan-out and final feature
/// aggregation.
pub struct ImageRequestHandler {
	job_table: JobTable,
	image_status_monitor: ImageStatusMonitor,
	endpoint_statistics_table: EndpointStatisticsTable,
	requested_jobs_table: RequestedJobsTable,
	tiling_strategy: Arc<dyn TilingStrategy>,
	region_queue: Arc<dyn MessageQueue>,
	region_table: RegionTable,
	capacity: EndpointCapacity,
	raster_opener: Arc<dyn RasterOpener>,
	object_store: Arc<dyn ObjectStoreClient>,
	stream: Arc<dyn StreamClient>,
	region_handler: Arc<RegionRequestHandler>,
	store: Arc<dyn KvStore>,
	config: Arc<ServiceConfig>,
}

impl std::fmt::Debug for ImageRequestHandler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ImageRequestHandler").finish()
	}
}

impl ImageRequestHandler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		job_table: JobTable,
		image_status_monitor: ImageStatusMonitor,
		endpoint_statistics_table: EndpointStatisticsTable,
		requested_jobs_table: RequestedJobsTable,
		tiling_strategy: Arc<dyn TilingStrategy>,
		region_queue: Arc<dyn MessageQueue>,
		region_table: RegionTable,
		capacity: EndpointCapacity,
		raster_opener: Arc<dyn RasterOpener>,
		object_store: Arc<dyn ObjectStoreClient>,
		stream: Arc<dyn StreamClient>,
		region_handler: Arc<RegionRequestHandler>,
		store: Arc<dyn KvStore>,
		config: Arc<ServiceConfig>,
	) -> Self {
		ImageRequestHandler {
			job_table,
			image_status_monitor,
			endpoint_statistics_table,
			requested_jobs_table,
			tiling_strategy,
			region_queue,
			region_table,
			capacity,
			raster_opener,
			object_store,
			stream,
			region_handler,
			store,
			config,
		}
	}

	/// Admits an image request, fans it out into regions and processes the
	/// first region in-line to keep this worker productive.
	pub async fn process_image_request(&self, request: &ImageRequest) -> Result<()> {
		let mut record = job_record_from_request(request);

		let result = self.start_and_fan_out(request, &mut record).await;
		if let Err(err) = result {
			self.fail_image_request(&record, &err).await;
			return Err(err.context(RunnerError::ProcessImage(format!(
				"failed to process image {}",
				request.image_id
			))));
		}
		Ok(())
	}

	async fn start_and_fan_out(
		&self,
		request: &ImageRequest,
		record: &mut ImageJobRecord,
	) -> Result<()> {
		request.validate()?;

		if self.config.self_throttling {
			let max_regions = self
				.capacity
				.max_regions_or_default(
					&request.model_name,
					request.model_invocation_credentials.as_deref(),
				)
				.await;
			self
				.endpoint_statistics_table
				.upsert_endpoint(&request.model_name, max_regions)
				.await?;
		}

		log::debug!("starting processing of {}", request.image_url);
		*record = self.job_table.start_image_request(record.clone()).await?;
		if let Err(err) = self
			.image_status_monitor
			.process_event(record, RequestStatus::Started, "Started image request")
			.await
		{
			log::error!("unable to publish image status: {err:#}");
		}

		// Open the raster with this request's read credentials scoped to the
		// process-wide raster configuration.
		let dataset = {
			let _env = request.image_read_credentials.as_ref().map(|credentials| {
				RasterEnvGuard::apply(&[("READ_CREDENTIALS_REF".to_string(), credentials.clone())])
			});
			self
				.raster_opener
				.open(&request.image_url, request.image_read_credentials.as_deref())
				.await?
		};
		let sensor = dataset.sensor();
		if sensor.is_none() {
			log::warn!(
				"dataset {} has no geo transform, results are not geo-referenced",
				request.image_id
			);
		}

		let processing_bounds =
			calculate_processing_bounds(dataset.as_ref(), request.roi.as_ref(), sensor.as_ref())?
				.ok_or_else(|| anyhow!("requested ROI does not intersect image, nothing to do"))?;

		let regions = self.tiling_strategy.compute_regions(
			&processing_bounds,
			self.config.region_size,
			request.tile_size,
			request.tile_overlap,
		)?;
		if regions.is_empty() {
			return Err(anyhow!("image produced no regions to process"));
		}

		record.region_count = Some(regions.len() as i64);
		record.width = Some(dataset.width());
		record.height = Some(dataset.height());
		match dataset_extents(dataset.as_ref()) {
			Ok(extents) => record.extents = extents.map(|e| json!(e)),
			Err(err) => log::warn!("could not get extents for image {}: {err:#}", record.image_id),
		}

		// Attach source metadata to the caller-supplied feature properties
		// when the image format carries any we recognize.
		let mut feature_properties = request.feature_properties.clone();
		if let Some(source) = source_property(&request.image_url, dataset.as_ref()) {
			feature_properties.push(source);
		}
		record.feature_properties = Some(Value::Array(feature_properties));

		*record = self.job_table.update_image_request(record.clone()).await?;

		if let Err(err) = self
			.requested_jobs_table
			.update_request_details(&request.model_name, &request.job_id, regions.len() as i64)
			.await
		{
			// Normal when the FIFO scheduler is driving: no lookahead record.
			log::debug!("unable to record region count in the lookahead table: {err:#}");
		}

		if let Err(err) = self
			.image_status_monitor
			.process_event(record, RequestStatus::InProgress, "Processing regions")
			.await
		{
			log::error!("unable to publish image status: {err:#}");
		}

		self
			.queue_region_requests(regions, request, dataset, sensor)
			.await
	}

	/// Queues every region after the first and processes the first in-line.
	async fn queue_region_requests(
		&self,
		mut regions: Vec<PixelRegion>,
		request: &ImageRequest,
		dataset: Arc<dyn RasterDataset>,
		sensor: Option<ImageSensor>,
	) -> Result<()> {
		let image_extension = dataset.extension();
		let first_region = regions.remove(0);

		for region in regions {
			log::debug!("queueing region {region}");
			let region_request = request.region_request(&region, &image_extension);
			let record = region_record_from_request(&region_request);
			self.region_table.start_region_request(record).await?;
			self
				.region_queue
				.send(serde_json::to_string(&region_request)?)
				.await?;
		}

		log::debug!("processing first region {first_region} in-line");
		let first_request = request.region_request(&first_region, &image_extension);
		let record = region_record_from_request(&first_request);
		let record = self.region_table.start_region_request(record).await?;

		let job_record = self
			.region_handler
			.process_region_request(&first_request, record, dataset.clone(), sensor.clone())
			.await?;

		if JobTable::is_image_request_complete(&job_record)? {
			self
				.complete_image_request(&job_record.image_id, dataset, sensor)
				.await?;
		}
		Ok(())
	}

	/// Aggregates, deduplicates and sinks the features of a finished image,
	/// then emits its terminal status.
	pub async fn complete_image_request(
		&self,
		image_id: &str,
		dataset: Arc<dyn RasterDataset>,
		sensor: Option<ImageSensor>,
	) -> Result<()> {
		let result = self.aggregate_and_sink(image_id, dataset, sensor).await;
		match result {
			Ok(()) => Ok(()),
			Err(err) => {
				if let Ok(record) = self.job_table.get_image_request(image_id).await {
					self.fail_image_request(&record, &err).await;
				}
				Err(err.context(RunnerError::AggregateFeatures(format!(
					"failed to aggregate features for image {image_id}"
				))))
			}
		}
	}

	async fn aggregate_and_sink(
		&self,
		image_id: &str,
		dataset: Arc<dyn RasterDataset>,
		sensor: Option<ImageSensor>,
	) -> Result<()> {
		let record = self.job_table.get_image_request(image_id).await?;
		log::debug!("last region of image {image_id} completed, aggregating features");

		let tile_size = record.tile_size.unwrap_or(PixelSize::square(1024));
		let tile_overlap = record.tile_overlap.unwrap_or(PixelSize::square(50));
		let feature_table = FeatureTable::new(
			self.store.clone(),
			&self.config.feature_table,
			tile_size,
			tile_overlap,
		);
		let features = feature_table.aggregate_features(image_id).await?;
		log::debug!("aggregated {} features for image {image_id}", features.len());

		let roi = record
			.roi_wkt
			.as_deref()
			.map(parse_wkt_polygon)
			.transpose()
			.context("image job carries an unparseable ROI")?;
		let processing_bounds =
			calculate_processing_bounds(dataset.as_ref(), roi.as_ref(), sensor.as_ref())?
				.ok_or_else(|| anyhow!("failed to calculate processing bounds"))?;

		let distillation: Option<DistillationAlgorithm> = record
			.feature_distillation
			.clone()
			.map(serde_json::from_value)
			.transpose()
			.context("image job carries an invalid feature distillation option")?;
		let selector = FeatureSelector::new(distillation);

		let deduped = self.tiling_strategy.cleanup_duplicate_features(
			&processing_bounds,
			self.config.region_size,
			tile_size,
			tile_overlap,
			features,
			&selector,
		)?;

		let job_id = record.job_id.clone().unwrap_or_default();
		let final_features = attach_final_properties(&job_id, &record, deduped)?;

		let outputs: Vec<SinkDescriptor> = record
			.outputs
			.clone()
			.map(serde_json::from_value)
			.transpose()
			.context("image job carries invalid outputs")?
			.unwrap_or_default();
		let context = SinkContext {
			job_id,
			image_id: image_id.to_string(),
		};
		let wrote = SinkFactory::sink_features(
			&context,
			&outputs,
			&final_features,
			&self.object_store,
			&self.stream,
		)
		.await?;
		if !wrote {
			return Err(RunnerError::AggregateOutput(format!(
				"no sink accepted the output for image {image_id}"
			))
			.into());
		}

		let record = self.job_table.end_image_request(image_id).await?;
		let status = ImageStatusMonitor::get_status(&record);
		if let Err(err) = self
			.image_status_monitor
			.process_event(&record, status, "Completed image processing")
			.await
		{
			log::error!("unable to publish terminal image status: {err:#}");
		}
		Ok(())
	}

	/// Marks the image failed and ends the job.
	pub async fn fail_image_request(&self, record: &ImageJobRecord, err: &anyhow::Error) {
		log::error!("failed to process image {}: {err:#}", record.image_id);
		if let Err(publish_err) = self
			.image_status_monitor
			.process_event(record, RequestStatus::Failed, &format!("{err:#}"))
			.await
		{
			log::error!("unable to publish failure event: {publish_err:#}");
		}
		if let Err(end_err) = self.job_table.end_image_request(&record.image_id).await {
			log::error!("unable to end failed image job: {end_err:#}");
		}
	}

	/// Fails an image for which no job record was ever written.
	pub async fn fail_minimal(&self, request: &ImageRequest, err: &anyhow::Error) {
		let mut record = ImageJobRecord::new(&request.image_id);
		record.job_id = Some(request.job_id.clone());
		record.processing_duration = Some(0);
		self.fail_image_request(&record, err).await;
	}
}

/// Builds the initial job record for an image request.
fn job_record_from_request(request: &ImageRequest) -> ImageJobRecord {
	let mut record = ImageJobRecord::new(&request.image_id);
	record.job_id = Some(request.job_id.clone());
	record.image_url = Some(request.image_url.clone());
	record.image_read_credentials = request.image_read_credentials.clone();
	record.model_name = Some(request.model_name.clone());
	record.model_invoke_mode = Some(request.model_invoke_mode);
	record.tile_size = Some(request.tile_size);
	record.tile_overlap = Some(request.tile_overlap);
	record.outputs = serde_json::to_value(&request.outputs).ok();
	record.feature_properties = Some(Value::Array(request.feature_properties.clone()));
	record.feature_distillation = request
		.feature_distillation_option()
		.and_then(|option| serde_json::to_value(option).ok());
	record.roi_wkt = request.roi.as_ref().map(polygon_to_wkt);
	record
}

/// Attaches inference metadata and caller-supplied properties, then strips
/// the deprecated per-tile properties.
fn attach_final_properties(
	job_id: &str,
	record: &ImageJobRecord,
	mut features: Vec<ImageFeature>,
) -> Result<Vec<ImageFeature>> {
	let custom_properties: Vec<Value> = record
		.feature_properties
		.clone()
		.and_then(|v| v.as_array().cloned())
		.unwrap_or_default();

	for feature in &mut features {
		let inference_time = feature
			.properties
			.get("inferenceTime")
			.cloned()
			.unwrap_or(Value::Null);
		feature.set_property(
			"inferenceMetadata",
			json!({"jobId": job_id, "inferenceDT": inference_time}),
		);

		for property in &custom_properties {
			if let Some(object) = property.as_object() {
				for (key, value) in object {
					feature.set_property(key, value.clone());
				}
			}
		}

		for deprecated in DEPRECATED_PROPERTIES {
			feature.remove_property(deprecated);
		}
	}
	Ok(features)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn final_properties_replace_deprecated_ones() {
		let mut feature = ImageFeature::new();
		feature.set_property("inferenceTime", json!("2026-03-01T00:00:00Z"));
		feature.set_property(PROP_BOUNDS_IMCOORDS, json!([1, 2, 3, 4]));
		feature.set_property("image_id", json!("job:image"));

		let mut record = ImageJobRecord::new("job:image");
		record.feature_properties = Some(json!([{"modelMetadata": {"modelName": "detector"}}]));

		let features = attach_final_properties("job", &record, vec![feature]).unwrap();
		let properties = &features[0].properties;
		assert_eq!(properties["inferenceMetadata"]["jobId"], json!("job"));
		assert_eq!(
			properties["inferenceMetadata"]["inferenceDT"],
			json!("2026-03-01T00:00:00Z")
		);
		assert_eq!(properties["modelMetadata"]["modelName"], json!("detector"));
		assert!(!properties.contains_key(PROP_BOUNDS_IMCOORDS));
		assert!(!properties.contains_key("inferenceTime"));
		assert!(!properties.contains_key("image_id"));
	}

	#[test]
	fn job_record_captures_request_fields() {
		let request = ImageRequest::from_external_message(&json!({
			"jobId": "job-1",
			"imageUrls": ["s3://imagery/scene.ntf"],
			"imageProcessor": {"name": "detector", "type": "HTTP_ENDPOINT"},
			"outputs": [{"type": "S3", "bucket": "results", "prefix": "out"}],
			"regionOfInterest": "POLYGON ((10 50, 11 50, 11 49, 10 49, 10 50))",
		}))
		.unwrap();
		let record = job_record_from_request(&request);
		assert_eq!(record.image_id, "job-1:s3://imagery/scene.ntf");
		assert!(record.roi_wkt.unwrap().starts_with("POLYGON"));
		assert!(record.feature_distillation.is_some());
		assert!(record.outputs.is_some());
	}
}
