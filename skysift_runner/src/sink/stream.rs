//! Stream sink: one record per feature, flushed in batches.

use super::{Sink, SinkContext, SinkMode};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use skysift_core::feature::{feature_collection_json, ImageFeature};
use std::fmt::Debug;
use std::sync::Arc;

/// Batch ceilings imposed by the streaming service.
pub const MAX_RECORDS_PER_BATCH: usize = 500;
pub const MAX_BATCH_BYTES: usize = 5 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct StreamRecord {
	pub data: String,
	pub partition_key: String,
}

/// Streaming-service contract.
#[async_trait]
pub trait StreamClient: Send + Sync + Debug {
	/// Current stream status, e.g. `ACTIVE` or `UPDATING`.
	async fn stream_status(&self, stream: &str) -> Result<String>;

	async fn put_records(&self, stream: &str, records: Vec<StreamRecord>) -> Result<()>;
}

/// In-memory reference client capturing the records it receives.
#[derive(Debug)]
pub struct MemoryStreamClient {
	status: String,
	records: Mutex<Vec<StreamRecord>>,
	batches: Mutex<Vec<usize>>,
}

impl MemoryStreamClient {
	pub fn new() -> Self {
		MemoryStreamClient {
			status: "ACTIVE".to_string(),
			records: Mutex::new(vec![]),
			batches: Mutex::new(vec![]),
		}
	}

	pub fn with_status(mut self, status: &str) -> Self {
		self.status = status.to_string();
		self
	}

	pub fn records(&self) -> Vec<StreamRecord> {
		self.records.lock().clone()
	}

	/// Sizes of the batches received, in call order.
	pub fn batch_sizes(&self) -> Vec<usize> {
		self.batches.lock().clone()
	}
}

impl Default for MemoryStreamClient {
	fn default() -> Self {
		MemoryStreamClient::new()
	}
}

#[async_trait]
impl StreamClient for MemoryStreamClient {
	async fn stream_status(&self, _stream: &str) -> Result<String> {
		Ok(self.status.clone())
	}

	async fn put_records(&self, _stream: &str, records: Vec<StreamRecord>) -> Result<()> {
		self.batches.lock().push(records.len());
		self.records.lock().extend(records);
		Ok(())
	}
}

/// Writes each feature as its own single-feature collection record,
/// partitioned by job id.
#[derive(Debug)]
pub struct StreamSink {
	client: Arc<dyn StreamClient>,
	stream: String,
	batch_size: usize,
	#[allow(dead_code)]
	credentials: Option<String>,
}

impl StreamSink {
	pub fn new(
		client: Arc<dyn StreamClient>,
		stream: &str,
		batch_size: Option<usize>,
		credentials: Option<&str>,
	) -> Self {
		StreamSink {
			client,
			stream: stream.to_string(),
			batch_size: batch_size
				.unwrap_or(MAX_RECORDS_PER_BATCH)
				.min(MAX_RECORDS_PER_BATCH),
			credentials: credentials.map(str::to_string),
		}
	}

	async fn validate_stream(&self) -> Result<bool> {
		let status = self
			.client
			.stream_status(&self.stream)
			.await
			.with_context(|| format!("failed to fetch stream {}", self.stream))?;
		// UPDATING streams keep accepting records during the operation.
		if status == "ACTIVE" || status == "UPDATING" {
			Ok(true)
		} else {
			log::error!(
				"stream {} is {status}, not in an ACTIVE or UPDATING state",
				self.stream
			);
			Ok(false)
		}
	}
}

#[async_trait]
impl Sink for StreamSink {
	fn name(&self) -> &'static str {
		"Kinesis"
	}

	fn mode(&self) -> SinkMode {
		SinkMode::Aggregate
	}

	async fn write(&self, context: &SinkContext, features: &[ImageFeature]) -> Result<bool> {
		if !self.validate_stream().await? {
			return Ok(false);
		}

		let mut pending: Vec<StreamRecord> = Vec::new();
		let mut pending_bytes = 0usize;
		for feature in features {
			let record = StreamRecord {
				data: serde_json::to_string(&feature_collection_json(std::slice::from_ref(feature)))?,
				partition_key: context.job_id.clone(),
			};
			let record_bytes = record.data.len() + record.partition_key.len();

			if !pending.is_empty()
				&& (pending_bytes + record_bytes > MAX_BATCH_BYTES || pending.len() >= self.batch_size)
			{
				self
					.client
					.put_records(&self.stream, std::mem::take(&mut pending))
					.await?;
				pending_bytes = 0;
			}

			pending_bytes += record_bytes;
			pending.push(record);
		}
		if !pending.is_empty() {
			self.client.put_records(&self.stream, pending).await?;
		}

		log::info!(
			"wrote {} features for job '{}' to stream '{}'",
			features.len(),
			context.job_id,
			self.stream
		);
		Ok(true)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn features(count: usize) -> Vec<ImageFeature> {
		(0..count)
			.map(|i| {
				let mut f = ImageFeature::new();
				f.set_property("i", json!(i));
				f
			})
			.collect()
	}

	fn context() -> SinkContext {
		SinkContext {
			job_id: "job-1".into(),
			image_id: "job-1:s3://imagery/scene.ntf".into(),
		}
	}

	#[tokio::test]
	async fn each_feature_becomes_one_record() {
		let client = Arc::new(MemoryStreamClient::new());
		let sink = StreamSink::new(client.clone(), "detections", None, None);
		assert!(sink.write(&context(), &features(3)).await.unwrap());

		let records = client.records();
		assert_eq!(records.len(), 3);
		assert!(records.iter().all(|r| r.partition_key == "job-1"));
		let first: serde_json::Value = serde_json::from_str(&records[0].data).unwrap();
		assert_eq!(first["features"].as_array().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn batches_flush_at_the_record_limit() {
		let client = Arc::new(MemoryStreamClient::new());
		let sink = StreamSink::new(client.clone(), "detections", Some(2), None);
		assert!(sink.write(&context(), &features(5)).await.unwrap());
		assert_eq!(client.batch_sizes(), vec![2, 2, 1]);
	}

	#[tokio::test]
	async fn inactive_stream_declines_the_write() {
		let client = Arc::new(MemoryStreamClient::new().with_status("DELETING"));
		let sink = StreamSink::new(client.clone(), "detections", None, None);
		assert!(!sink.write(&context(), &features(1)).await.unwrap());
		assert!(client.records().is_empty());
	}
}
