//! Region request handling.

use crate::api::RegionRequest;
use crate::config::ServiceConfig;
use crate::endpoint::EndpointCapacity;
use crate::error::RunnerError;
use crate::inference::DetectorProvider;
use crate::status::RegionStatusMonitor;
use crate::worker::{process_tiles, TileWorkerContext};
use anyhow::{Context, Result};
use skysift_core::raster::RasterDataset;
use skysift_core::refine::FeatureRefinery;
use skysift_core::sensor::{ElevationModel, ImageSensor};
use skysift_core::tiling::TilingStrategy;
use skysift_store::{
	EndpointStatisticsTable, FeatureTable, ImageJobRecord, JobTable, KvStore, RegionJobRecord,
	RegionTable, RequestedJobsTable,
};
use std::sync::Arc;

/// Processes region requests delegated by the core loop or run in-line by
/// the image handler.
pub struct RegionRequestHandler {
	region_table: RegionTable,
	job_table: JobTable,
	region_status_monitor: RegionStatusMonitor,
	endpoint_statistics_table: EndpointStatisticsTable,
	requested_jobs_table: RequestedJobsTable,
	tiling_strategy: Arc<dyn TilingStrategy>,
	capacity: EndpointCapacity,
	detector_provider: Arc<dyn DetectorProvider>,
	elevation_model: Option<Arc<dyn ElevationModel>>,
	store: Arc<dyn KvStore>,
	config: Arc<ServiceConfig>,
}

impl std::fmt::Debug for RegionRequestHandler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RegionRequestHandler").finish()
	}
}

impl RegionRequestHandler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		region_table: RegionTable,
		job_table: JobTable,
		region_status_monitor: RegionStatusMonitor,
		endpoint_statistics_table: EndpointStatisticsTable,
		requested_jobs_table: RequestedJobsTable,
		tiling_strategy: Arc<dyn TilingStrategy>,
		capacity: EndpointCapacity,
		detector_provider: Arc<dyn DetectorProvider>,
		elevation_model: Option<Arc<dyn ElevationModel>>,
		store: Arc<dyn KvStore>,
		config: Arc<ServiceConfig>,
	) -> Self {
		RegionRequestHandler {
			region_table,
			job_table,
			region_status_monitor,
			endpoint_statistics_table,
			requested_jobs_table,
			tiling_strategy,
			capacity,
			detector_provider,
			elevation_model,
			store,
			config,
		}
	}

	/// Runs a region through the tile-worker pool and records the outcome.
	///
	/// Returns the image job record after this region has been counted, so
	/// the caller can detect image completion. A throttled region surfaces
	/// as [`RunnerError::SelfThrottledRegion`] before any state is written.
	pub async fn process_region_request(
		&self,
		region_request: &RegionRequest,
		record: RegionJobRecord,
		dataset: Arc<dyn RasterDataset>,
		sensor: Option<ImageSensor>,
	) -> Result<ImageJobRecord> {
		region_request.validate()?;

		if self.config.self_throttling {
			let max_regions = self
				.capacity
				.max_regions_or_default(
					&region_request.model_name,
					region_request.model_invocation_credentials.as_deref(),
				)
				.await;
			self
				.endpoint_statistics_table
				.upsert_endpoint(&region_request.model_name, max_regions)
				.await?;

			let in_progress = self
				.endpoint_statistics_table
				.current_in_progress_regions(&region_request.model_name)
				.await?;
			if in_progress >= max_regions {
				log::warn!(
					"throttling region request (max: {max_regions}, in progress: {in_progress})"
				);
				return Err(RunnerError::SelfThrottledRegion(format!(
					"endpoint {} is at its region ceiling",
					region_request.model_name
				))
				.into());
			}
			self
				.endpoint_statistics_table
				.increment_region_count(&region_request.model_name)
				.await?;
		}

		let result = self
			.execute_region(region_request, record.clone(), dataset, sensor)
			.await;

		// The decrement pairs with the successful increment above; it must
		// happen no matter how the region ended.
		if self.config.self_throttling {
			if let Err(err) = self
				.endpoint_statistics_table
				.decrement_region_count(&region_request.model_name)
				.await
			{
				log::error!(
					"unable to decrement in-progress count for {}: {err:#}",
					region_request.model_name
				);
			}
		}

		match result {
			Ok(job_record) => Ok(job_record),
			Err(err) => {
				log::error!(
					"failed to process region {}: {err:#}",
					region_request.region_id
				);
				self.fail_region_request(&record).await
			}
		}
	}

	async fn execute_region(
		&self,
		region_request: &RegionRequest,
		record: RegionJobRecord,
		dataset: Arc<dyn RasterDataset>,
		sensor: Option<ImageSensor>,
	) -> Result<ImageJobRecord> {
		log::debug!("starting region request {}", record.region_id);
		let mut record = self.region_table.start_region_request(record).await?;

		let detector = self.detector_provider.build(
			&region_request.model_name,
			region_request.model_invoke_mode,
			region_request.model_invocation_credentials.as_deref(),
		)?;
		let feature_table = FeatureTable::new(
			self.store.clone(),
			&self.config.feature_table,
			region_request.tile_size,
			region_request.tile_overlap,
		);
		let refinery = sensor
			.map(|sensor| Arc::new(FeatureRefinery::new(sensor, self.elevation_model.clone())));

		let (total_tiles, failed_tiles) = process_tiles(
			self.tiling_strategy.as_ref(),
			&record,
			dataset,
			self.config.workers,
			TileWorkerContext {
				detector,
				refinery,
				feature_table,
				region_table: self.region_table.clone(),
			},
		)
		.await?;

		record.total_tiles = Some(total_tiles as i64);
		record.succeeded_tile_count = Some((total_tiles - failed_tiles) as i64);
		record.failed_tile_count = Some(failed_tiles as i64);
		let record = self.region_table.update_region_request(record).await?;

		// Count this region against the image; a region with any failed tile
		// is an error for image-level completion.
		let job_record = self
			.job_table
			.complete_region_request(&record.image_id, failed_tiles > 0)
			.await?;

		let region_status = RegionStatusMonitor::get_status(&record);
		let record = self
			.region_table
			.complete_region_request(&record.image_id, &record.region_id, region_status)
			.await?;
		if let Err(err) = self
			.region_status_monitor
			.process_event(&record, region_status, "Completed region processing")
			.await
		{
			log::error!("unable to publish region status: {err:#}");
		}

		if let Err(err) = self
			.requested_jobs_table
			.complete_region(
				&region_request.model_name,
				&region_request.job_id,
				&region_request.region_id,
			)
			.await
		{
			log::debug!("unable to record completed region in the lookahead table: {err:#}");
		}

		Ok(job_record)
	}

	/// Marks the region failed and counts it against the image.
	async fn fail_region_request(&self, record: &RegionJobRecord) -> Result<ImageJobRecord> {
		let result: Result<ImageJobRecord> = async {
			let record = self
				.region_table
				.complete_region_request(
					&record.image_id,
					&record.region_id,
					skysift_core::types::RequestStatus::Failed,
				)
				.await?;
			if let Err(err) = self
				.region_status_monitor
				.process_event(
					&record,
					skysift_core::types::RequestStatus::Failed,
					"Completed region processing",
				)
				.await
			{
				log::error!("unable to publish region failure status: {err:#}");
			}
			self.job_table.complete_region_request(&record.image_id, true).await
		}
		.await;
		result.context(RunnerError::ProcessRegion(format!(
			"failed to record region failure for {}",
			record.region_id
		)))
	}
}
