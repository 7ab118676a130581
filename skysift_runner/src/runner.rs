//! The core worker loop.
//!
//! One worker alternates between draining the region-work queue (preferred,
//! so in-flight images finish before new ones start) and asking the image
//! scheduler for the next image. Horizontal scale comes from running more
//! workers against the same queues and tables.

use crate::api::RegionRequest;
use crate::config::ServiceConfig;
use crate::context::{image_context, region_context, with_context};
use crate::error::{is_retryable, is_throttled};
use crate::handler::{region_record_from_request, ImageRequestHandler, RegionRequestHandler};
use crate::queue::MessageQueue;
use crate::scheduler::ImageScheduler;
use anyhow::Result;
use skysift_core::raster::RasterOpener;
use skysift_store::{JobTable, RegionJobRecord, RegionTable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct ModelRunner {
	config: Arc<ServiceConfig>,
	scheduler: Arc<dyn ImageScheduler>,
	region_queue: Arc<dyn MessageQueue>,
	region_table: RegionTable,
	raster_opener: Arc<dyn RasterOpener>,
	image_handler: Arc<ImageRequestHandler>,
	region_handler: Arc<RegionRequestHandler>,
	running: AtomicBool,
}

impl ModelRunner {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Arc<ServiceConfig>,
		scheduler: Arc<dyn ImageScheduler>,
		region_queue: Arc<dyn MessageQueue>,
		region_table: RegionTable,
		raster_opener: Arc<dyn RasterOpener>,
		image_handler: Arc<ImageRequestHandler>,
		region_handler: Arc<RegionRequestHandler>,
	) -> Self {
		ModelRunner {
			config,
			scheduler,
			region_queue,
			region_table,
			raster_opener,
			image_handler,
			region_handler,
			running: AtomicBool::new(false),
		}
	}

	/// Monitors the work queues until [`ModelRunner::stop`] is called.
	pub async fn run(&self) {
		log::info!("starting model runner");
		self.running.store(true, Ordering::SeqCst);
		while self.running.load(Ordering::SeqCst) {
			if !self.process_region_requests().await {
				self.process_image_requests().await;
			}
		}
		log::info!("stopped monitoring work queues");
	}

	/// Requests a graceful exit after the current iteration.
	pub fn stop(&self) {
		log::info!("stopping model runner");
		self.running.store(false, Ordering::SeqCst);
	}

	/// Processes one message from the region queue.
	///
	/// Returns `true` when a message was handled (successfully or not), so
	/// the caller knows not to start new image work this iteration.
	pub async fn process_region_requests(&self) -> bool {
		log::debug!("checking work queue for regions to process");
		let messages = match self
			.region_queue
			.receive(1, Duration::from_secs(self.config.region_poll_seconds))
			.await
		{
			Ok(messages) => messages,
			Err(err) => {
				log::error!("unable to poll region queue: {err:#}");
				return false;
			}
		};
		let Some(message) = messages.into_iter().next() else {
			return false;
		};

		let region_request: RegionRequest = match serde_json::from_str(&message.body) {
			Ok(request) => request,
			Err(err) => {
				log::error!("dropping unparseable region request: {err:#}");
				self.settle(&message.receipt).await;
				return true;
			}
		};

		let context = region_context(
			&region_request.job_id,
			&region_request.image_id,
			&region_request.region_id,
		);
		let result = with_context(context, self.handle_region_request(&region_request)).await;

		match result {
			Ok(()) => self.settle(&message.receipt).await,
			Err(err) if is_retryable(&err) => {
				log::warn!("retrying region request: {err:#}");
				self.reset(&message.receipt, Duration::ZERO).await;
			}
			Err(err) if is_throttled(&err) => {
				log::warn!("region throttled, delaying retry: {err:#}");
				self
					.reset(
						&message.receipt,
						Duration::from_secs(self.config.throttling_retry_timeout),
					)
					.await;
			}
			Err(err) => {
				log::error!("there was a problem processing the region request: {err:#}");
				self.settle(&message.receipt).await;
			}
		}
		true
	}

	async fn handle_region_request(&self, region_request: &RegionRequest) -> Result<()> {
		let dataset = self
			.raster_opener
			.open(
				&region_request.image_url,
				region_request.image_read_credentials.as_deref(),
			)
			.await?;
		let sensor = dataset.sensor();

		let record = self.get_or_create_region_record(region_request).await?;
		let job_record = self
			.region_handler
			.process_region_request(region_request, record, dataset.clone(), sensor.clone())
			.await?;

		if JobTable::is_image_request_complete(&job_record)? {
			self
				.image_handler
				.complete_image_request(&region_request.image_id, dataset, sensor)
				.await?;
		}
		Ok(())
	}

	/// Asks the scheduler for the next image and processes it.
	pub async fn process_image_requests(&self) -> bool {
		let Some(request) = self.scheduler.get_next_scheduled_request().await else {
			return false;
		};

		log::info!("starting processing for image request {}", request.job_id);
		let context = image_context(&request.job_id, &request.image_id);
		let result = with_context(context, self.image_handler.process_image_request(&request)).await;

		match result {
			Ok(()) => {
				if let Err(err) = self.scheduler.finish_request(&request, false).await {
					log::error!("unable to finish image request: {err:#}");
				}
			}
			Err(err) if is_retryable(&err) => {
				if let Err(err) = self.scheduler.finish_request(&request, true).await {
					log::error!("unable to mark image request retryable: {err:#}");
				}
			}
			Err(err) => {
				log::error!("error processing image request: {err:#}");
				self.image_handler.fail_minimal(&request, &err).await;
				if let Err(err) = self.scheduler.finish_request(&request, false).await {
					log::error!("unable to finalize failed image request: {err:#}");
				}
			}
		}
		true
	}

	/// Fetches the region job for a redelivered request, or writes a fresh
	/// STARTED record for a first delivery.
	async fn get_or_create_region_record(
		&self,
		region_request: &RegionRequest,
	) -> Result<RegionJobRecord> {
		if let Some(existing) = self
			.region_table
			.get_region_request(&region_request.region_id, &region_request.image_id)
			.await?
		{
			return Ok(existing);
		}
		let record = region_record_from_request(region_request);
		log::debug!(
			"adding region request: image id {} region id {}",
			record.image_id,
			record.region_id
		);
		self.region_table.start_region_request(record).await
	}

	async fn settle(&self, receipt: &str) {
		if let Err(err) = self.region_queue.delete(receipt).await {
			log::error!("unable to remove message from region queue: {err:#}");
		}
	}

	async fn reset(&self, receipt: &str, delay: Duration) {
		if let Err(err) = self.region_queue.reset_visibility(receipt, delay).await {
			log::error!("unable to reset region message visibility: {err:#}");
		}
	}
}
