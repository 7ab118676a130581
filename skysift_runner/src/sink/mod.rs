//! Sinks: where aggregate feature collections are written.

mod object_store;
mod stream;

pub use object_store::{FsObjectStoreClient, ObjectStoreClient, ObjectStoreSink, UploadConfig};
pub use stream::{MemoryStreamClient, StreamClient, StreamRecord, StreamSink};

use crate::api::SinkDescriptor;
use crate::error::RunnerError;
use anyhow::Result;
use async_trait::async_trait;
use skysift_core::feature::ImageFeature;
use std::fmt::Debug;
use std::sync::Arc;

/// How a sink consumes results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkMode {
	/// One write per completed image.
	Aggregate,
	/// Per-tile writes. Not produced by this system; aggregate output only.
	Streaming,
}

/// Identifiers for a write: the object-store sink keys off the image, the
/// stream sink partitions by job.
#[derive(Clone, Debug)]
pub struct SinkContext {
	pub job_id: String,
	pub image_id: String,
}

#[async_trait]
pub trait Sink: Send + Sync + Debug {
	/// The descriptor type name this sink serves, e.g. `S3` or `Kinesis`.
	fn name(&self) -> &'static str;

	fn mode(&self) -> SinkMode;

	/// Writes the features, returning whether the write succeeded.
	async fn write(&self, context: &SinkContext, features: &[ImageFeature]) -> Result<bool>;
}

/// Builds sinks from request descriptors and fans writes out to them.
pub struct SinkFactory;

impl SinkFactory {
	pub fn outputs_to_sinks(
		outputs: &[SinkDescriptor],
		object_store: &Arc<dyn ObjectStoreClient>,
		stream: &Arc<dyn StreamClient>,
	) -> Vec<Box<dyn Sink>> {
		outputs
			.iter()
			.map(|output| match output {
				SinkDescriptor::ObjectStore { bucket, prefix, role } => Box::new(ObjectStoreSink::new(
					object_store.clone(),
					bucket,
					prefix,
					role.as_deref(),
				)) as Box<dyn Sink>,
				SinkDescriptor::Stream {
					stream: stream_name,
					batch_size,
					assumed_role,
				} => Box::new(StreamSink::new(
					stream.clone(),
					stream_name,
					*batch_size,
					assumed_role.as_deref(),
				)) as Box<dyn Sink>,
			})
			.collect()
	}

	/// Writes the aggregate output to every configured sink.
	///
	/// The image succeeds when at least one sink accepts the write; it fails
	/// when none do or when no sinks are configured at all.
	pub async fn sink_features(
		context: &SinkContext,
		outputs: &[SinkDescriptor],
		features: &[ImageFeature],
		object_store: &Arc<dyn ObjectStoreClient>,
		stream: &Arc<dyn StreamClient>,
	) -> Result<bool> {
		if outputs.is_empty() {
			return Err(RunnerError::InvalidImageRequest(
				"no output destinations were defined for this image request".into(),
			)
			.into());
		}

		let mut any_succeeded = false;
		for sink in Self::outputs_to_sinks(outputs, object_store, stream) {
			if sink.mode() != SinkMode::Aggregate {
				continue;
			}
			match sink.write(context, features).await {
				Ok(true) => any_succeeded = true,
				Ok(false) => {
					log::error!("{} sink declined the write for job {}", sink.name(), context.job_id)
				}
				Err(err) => log::error!(
					"{} sink failed for job {}: {err:#}",
					sink.name(),
					context.job_id
				),
			}
		}
		Ok(any_succeeded)
	}
}
