//! Image schedulers: which image does this worker start next?

mod endpoint_load;
mod fifo;

pub use endpoint_load::EndpointLoadImageScheduler;
pub use fifo::FifoImageScheduler;

use crate::api::ImageRequest;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

#[async_trait]
pub trait ImageScheduler: Send + Sync + Debug {
	/// The next image request to process, if any is eligible.
	async fn get_next_scheduled_request(&self) -> Option<ImageRequest>;

	/// Marks a previously returned request as finished.
	///
	/// `should_retry` signals the request was not completed and may be
	/// attempted again immediately.
	async fn finish_request(&self, request: &ImageRequest, should_retry: bool) -> Result<()>;
}
