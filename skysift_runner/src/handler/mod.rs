//! Image and region request handlers.
//!
//! The image handler decomposes an admitted image into regions, processing
//! the first region in-line and queueing the rest; when the last region
//! finishes it aggregates, deduplicates and sinks the features. The region
//! handler runs one region through the tile-worker pool under the endpoint
//! throttle.

mod image;
mod region;

pub use image::ImageRequestHandler;
pub use region::RegionRequestHandler;

use crate::api::RegionRequest;
use skysift_store::RegionJobRecord;

/// Builds the table record for a region request message.
pub fn region_record_from_request(request: &RegionRequest) -> RegionJobRecord {
	let mut record = RegionJobRecord::new(&request.region_id, &request.image_id);
	record.job_id = Some(request.job_id.clone());
	record.image_read_credentials = request.image_read_credentials.clone();
	record.region_bounds = Some(request.region_bounds);
	record.tile_size = Some(request.tile_size);
	record.tile_overlap = Some(request.tile_overlap);
	record.tile_format = Some(request.tile_format);
	record.tile_compression = Some(request.tile_compression);
	record
}
