//! Tile workers: parallel inference over the tiles of one region.
//!
//! The region handler enumerates tiles, encodes each into a scratch file and
//! feeds a queue consumed by a fixed pool of workers. Each worker owns its
//! detector, refinery and table accessors. A failing tile increments the
//! worker's local failure count and is recorded as FAILED; the worker keeps
//! draining the queue, so one bad tile never takes down the pool.

use crate::inference::Detector;
use anyhow::{Context, Result};
use skysift_core::raster::{RasterDataset, RasterEnvGuard};
use skysift_core::refine::{refine_tile_features, FeatureRefinery};
use skysift_core::tiling::TilingStrategy;
use skysift_core::types::{PixelRegion, TileState};
use skysift_store::{FeatureTable, RegionJobRecord, RegionTable};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// One encoded tile waiting for inference.
#[derive(Debug)]
pub struct TileWorkItem {
	pub image_id: String,
	pub job_id: String,
	pub region_id: String,
	pub tile: PixelRegion,
	pub path: PathBuf,
}

/// Everything a tile worker owns.
#[derive(Clone)]
pub struct TileWorkerContext {
	pub detector: Arc<dyn Detector>,
	pub refinery: Option<Arc<FeatureRefinery>>,
	pub feature_table: FeatureTable,
	pub region_table: RegionTable,
}

/// Runs the region's tiles through a pool of `worker_count` tile workers.
///
/// Tiles already recorded as succeeded on the region job are skipped, which
/// makes redelivered region requests resumable. Returns the number of tiles
/// enqueued and the number that failed.
pub async fn process_tiles(
	tiling_strategy: &dyn TilingStrategy,
	record: &RegionJobRecord,
	dataset: Arc<dyn RasterDataset>,
	worker_count: usize,
	context: TileWorkerContext,
) -> Result<(usize, usize)> {
	let region_bounds = record.region_bounds.context("region job has no bounds")?;
	let tile_size = record.tile_size.context("region job has no tile size")?;
	let tile_overlap = record.tile_overlap.context("region job has no tile overlap")?;
	let tile_format = record.tile_format.unwrap_or_default();
	let tile_compression = record.tile_compression.unwrap_or_default();

	let mut tiles = tiling_strategy.compute_tiles(&region_bounds, tile_size, tile_overlap)?;
	if let Some(succeeded) = &record.succeeded_tiles {
		let before = tiles.len();
		tiles.retain(|tile| !succeeded.contains(tile));
		if tiles.len() != before {
			log::debug!("{} tiles have already been processed", before - tiles.len());
		}
	}
	let total_tile_count = tiles.len();

	let (sender, receiver) = mpsc::unbounded_channel::<Option<TileWorkItem>>();
	let receiver = Arc::new(Mutex::new(receiver));

	let mut workers = Vec::with_capacity(worker_count);
	for _ in 0..worker_count {
		workers.push(tokio::spawn(run_tile_worker(receiver.clone(), context.clone())));
	}
	log::debug!("set up pool of {worker_count} tile workers");

	// The scratch directory must outlive the worker join below, or tiles
	// still in the queue would lose their files.
	let scratch = tempfile::tempdir().context("unable to create tile scratch directory")?;
	let mut tile_error_count = 0usize;
	{
		let _env = record
			.image_read_credentials
			.as_ref()
			.map(|credentials| {
				RasterEnvGuard::apply(&[("READ_CREDENTIALS_REF".to_string(), credentials.clone())])
			});

		for tile in &tiles {
			let filename = format!(
				"region-{}-{}-{}-{}.{}",
				tile.row,
				tile.col,
				tile.width,
				tile.height,
				tile_format.extension()
			);
			let path = scratch.path().join(filename);

			let item = TileWorkItem {
				image_id: record.image_id.clone(),
				job_id: record.job_id.clone().unwrap_or_default(),
				region_id: record.region_id.clone(),
				tile: *tile,
				path: path.clone(),
			};

			let encoded = dataset
				.encode_tile(tile, tile_format, tile_compression)
				.and_then(|bytes| Ok(std::fs::write(&path, bytes)?));
			if let Err(err) = encoded {
				// Count the tile as failed instead of silently dropping it so
				// the region totals still add up.
				log::error!("unable to create tile {tile}: {err:#}");
				tile_error_count += 1;
				record_tile_outcome(&context.region_table, &item, TileState::Failed).await;
				continue;
			}

			sender.send(Some(item)).ok();
		}
	}

	// One sentinel per worker shuts the pool down.
	for _ in 0..worker_count {
		sender.send(None).ok();
	}

	for joined in futures::future::join_all(workers).await {
		tile_error_count += joined.unwrap_or(0);
	}

	log::debug!(
		"processed {total_tile_count} tiles for region {}, {tile_error_count} failed",
		record.region_id
	);
	Ok((total_tile_count, tile_error_count))
}

async fn run_tile_worker(
	receiver: Arc<Mutex<mpsc::UnboundedReceiver<Option<TileWorkItem>>>>,
	context: TileWorkerContext,
) -> usize {
	let mut failed_tile_count = 0usize;
	loop {
		let next = { receiver.lock().await.recv().await };
		let Some(Some(item)) = next else {
			break;
		};

		if let Err(err) = process_tile(&item, &context).await {
			failed_tile_count += 1;
			log::error!(
				"failed to process tile {} of region {}: {err:#}",
				item.tile,
				item.region_id
			);
			record_tile_outcome(&context.region_table, &item, TileState::Failed).await;
		}
	}
	log::debug!(
		"tile worker stopping: {} requests, {} failed tiles",
		context.detector.request_count(),
		failed_tile_count
	);
	failed_tile_count
}

/// Runs one tile end to end: invoke the model, refine and geolocate the
/// detections, persist them, and record the tile as succeeded.
async fn process_tile(item: &TileWorkItem, context: &TileWorkerContext) -> Result<()> {
	let payload = tokio::fs::read(&item.path)
		.await
		.with_context(|| format!("unable to read tile file {}", item.path.display()))?;

	let mut features = context.detector.find_features(&payload).await?;
	log::debug!("model returned {} features for tile {}", features.len(), item.tile);

	refine_tile_features(&mut features, &item.tile, &item.image_id);
	if let Some(refinery) = &context.refinery {
		refinery.geolocate_features(&mut features)?;
	}

	if !features.is_empty() {
		context.feature_table.add_features(&features).await?;
	}
	context
		.region_table
		.add_tile(&item.image_id, &item.region_id, &item.tile, TileState::Succeeded)
		.await?;
	Ok(())
}

async fn record_tile_outcome(region_table: &RegionTable, item: &TileWorkItem, state: TileState) {
	if let Err(err) = region_table
		.add_tile(&item.image_id, &item.region_id, &item.tile, state)
		.await
	{
		log::error!(
			"unable to record {state:?} tile {} for region {}: {err:#}",
			item.tile,
			item.region_id
		);
	}
}
