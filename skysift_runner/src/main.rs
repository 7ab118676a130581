use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use skysift_core::raster::{SyntheticRaster, SyntheticRasterOpener};
use skysift_core::sensor::{AffineSensorModel, ImageSensor};
use skysift_core::tiling::{TilingStrategy, VariableOverlapStrategy};
use skysift_runner::api::ImageRequest;
use skysift_runner::endpoint::{EndpointCapacity, StaticEndpointControl};
use skysift_runner::handler::{ImageRequestHandler, RegionRequestHandler};
use skysift_runner::inference::DetectorFactory;
use skysift_runner::metrics::LogMetricsSink;
use skysift_runner::queue::{BufferedImageRequestQueue, InMemoryQueue, MessageQueue};
use skysift_runner::scheduler::EndpointLoadImageScheduler;
use skysift_runner::status::{ImageStatusMonitor, LogTopicPublisher, RegionStatusMonitor};
use skysift_runner::{ModelRunner, ServiceConfig};
use skysift_store::{
	EndpointStatisticsTable, JobTable, MemoryKvStore, RegionTable, RequestedJobsTable,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Run a skysift worker against local in-memory backends.
///
/// Reads image request messages (the external JSON form) from files, runs
/// them over a synthetic raster and writes the aggregate GeoJSON output to
/// a local directory. Production deployments wire real queue, store and
/// raster backends instead.
#[derive(Parser, Debug)]
#[command(author, version, about, propagate_version = true)]
struct Cli {
	/// Image request message files to enqueue before starting.
	#[arg(required = true)]
	requests: Vec<PathBuf>,

	/// Directory for object-store sink output.
	#[arg(long, default_value = "./skysift-output")]
	output_dir: PathBuf,

	/// Width of the synthetic raster.
	#[arg(long, default_value_t = 8192)]
	image_width: u32,

	/// Height of the synthetic raster.
	#[arg(long, default_value_t = 8192)]
	image_height: u32,

	/// Tile workers per region.
	#[arg(long, default_value_t = 4)]
	workers: usize,

	#[command(flatten)]
	verbose: Verbosity<InfoLevel>,
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::Builder::new()
		.filter_level(cli.verbose.log_level_filter())
		.format_timestamp(None)
		.init();

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
	let config = Arc::new(ServiceConfig {
		workers: cli.workers,
		region_poll_seconds: 0,
		..ServiceConfig::default()
	});

	let store = Arc::new(MemoryKvStore::new());
	let image_queue = Arc::new(InMemoryQueue::new());
	let image_dlq = Arc::new(InMemoryQueue::new());
	let region_queue = Arc::new(InMemoryQueue::new());

	let job_table = JobTable::new(store.clone(), &config.job_table);
	let region_table = RegionTable::new(store.clone(), &config.region_table);
	let endpoint_statistics_table =
		EndpointStatisticsTable::new(store.clone(), &config.endpoint_statistics_table);
	let requested_jobs_table = RequestedJobsTable::new(store.clone(), &config.requested_jobs_table);

	let capacity = EndpointCapacity::new(
		Arc::new(StaticEndpointControl::new(1, num_cpus::get() as u32)),
		config.throttling_vcpu_scale_factor,
		config.workers_per_cpu,
	);

	let sensor = ImageSensor::Single(Arc::new(AffineSensorModel::new([
		10.0, 1e-5, 0.0, 50.0, 0.0, -1e-5,
	])?));
	let raster = SyntheticRaster::new(cli.image_width, cli.image_height).with_sensor(sensor);
	let raster_opener = Arc::new(SyntheticRasterOpener::new(raster));

	let tiling_strategy: Arc<dyn TilingStrategy> = Arc::new(VariableOverlapStrategy);

	let region_handler = Arc::new(RegionRequestHandler::new(
		region_table.clone(),
		job_table.clone(),
		RegionStatusMonitor::new(Arc::new(LogTopicPublisher)),
		endpoint_statistics_table.clone(),
		requested_jobs_table.clone(),
		tiling_strategy.clone(),
		capacity.clone(),
		Arc::new(DetectorFactory::new(&config.hosted_runtime_url)),
		None,
		store.clone(),
		config.clone(),
	));
	let image_handler = Arc::new(ImageRequestHandler::new(
		job_table.clone(),
		ImageStatusMonitor::new(Arc::new(LogTopicPublisher)),
		endpoint_statistics_table,
		requested_jobs_table.clone(),
		tiling_strategy,
		region_queue.clone(),
		region_table.clone(),
		capacity.clone(),
		raster_opener.clone(),
		Arc::new(skysift_runner::sink::FsObjectStoreClient::new(cli.output_dir.clone())),
		Arc::new(skysift_runner::sink::MemoryStreamClient::new()),
		region_handler.clone(),
		store.clone(),
		config.clone(),
	));

	let buffered = BufferedImageRequestQueue::new(
		image_queue.clone(),
		image_dlq,
		requested_jobs_table.clone(),
		Arc::new(LogMetricsSink),
		config.max_jobs_lookahead,
		config.retry_time,
		config.max_retry_attempts,
	);
	let scheduler = Arc::new(EndpointLoadImageScheduler::new(buffered, capacity));

	for path in &cli.requests {
		let body = std::fs::read_to_string(path)?;
		let message: serde_json::Value = serde_json::from_str(&body)?;
		let request = ImageRequest::from_external_message(&message)?;
		log::info!("enqueueing image request {} from {}", request.job_id, path.display());
		image_queue.send(body).await?;
	}

	let runner = ModelRunner::new(
		config,
		scheduler,
		region_queue.clone(),
		region_table,
		raster_opener,
		image_handler,
		region_handler,
	);

	// Drain until both queues and the lookahead table are empty.
	loop {
		if runner.process_region_requests().await {
			continue;
		}
		if runner.process_image_requests().await {
			continue;
		}
		let outstanding = requested_jobs_table.get_outstanding_requests().await?;
		if outstanding.is_empty() && region_queue.is_empty() && image_queue.is_empty() {
			break;
		}
	}

	log::info!("all requests drained, output written to {}", cli.output_dir.display());
	Ok(())
}
