//! Status monitors: publishing job lifecycle events.
//!
//! Each event is a human-readable message plus structured attributes, sent
//! through a [`TopicPublisher`]. One topic exists per event kind (image and
//! region); a worker without a configured topic falls back to logging.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use skysift_core::types::RequestStatus;
use skysift_store::{ImageJobRecord, RegionJobRecord};
use std::fmt::Debug;
use std::sync::Arc;

/// An attribute value: strings pass through, binary payloads are
/// base64-encoded by the publisher.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
	String(String),
	Binary(Vec<u8>),
}

impl AttributeValue {
	/// The wire form of this attribute.
	pub fn serialize(&self) -> String {
		match self {
			AttributeValue::String(s) => s.clone(),
			AttributeValue::Binary(bytes) => base64(bytes),
		}
	}
}

/// Standard base64 (RFC 4648, with padding).
fn base64(bytes: &[u8]) -> String {
	const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
	let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
	for chunk in bytes.chunks(3) {
		let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
		let n = ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32;
		out.push(ALPHABET[(n >> 18) as usize & 63] as char);
		out.push(ALPHABET[(n >> 12) as usize & 63] as char);
		out.push(if chunk.len() > 1 {
			ALPHABET[(n >> 6) as usize & 63] as char
		} else {
			'='
		});
		out.push(if chunk.len() > 2 {
			ALPHABET[n as usize & 63] as char
		} else {
			'='
		});
	}
	out
}

/// Topic contract for publishing status events.
#[async_trait]
pub trait TopicPublisher: Send + Sync + Debug {
	async fn publish(&self, message: &str, attributes: &[(String, AttributeValue)]) -> Result<()>;
}

/// Publishes events as log lines; the fallback when no topic is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogTopicPublisher;

#[async_trait]
impl TopicPublisher for LogTopicPublisher {
	async fn publish(&self, message: &str, attributes: &[(String, AttributeValue)]) -> Result<()> {
		let attributes: Vec<String> = attributes
			.iter()
			.map(|(k, v)| format!("{k}={}", v.serialize()))
			.collect();
		log::info!("{message} [{}]", attributes.join(" "));
		Ok(())
	}
}

/// Captures published events, for tests.
#[derive(Debug, Default)]
pub struct MemoryTopicPublisher {
	pub events: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl MemoryTopicPublisher {
	pub fn statuses(&self) -> Vec<String> {
		self
			.events
			.lock()
			.iter()
			.filter_map(|(_, attributes)| {
				attributes
					.iter()
					.find(|(k, _)| k == "status")
					.map(|(_, v)| v.clone())
			})
			.collect()
	}
}

#[async_trait]
impl TopicPublisher for MemoryTopicPublisher {
	async fn publish(&self, message: &str, attributes: &[(String, AttributeValue)]) -> Result<()> {
		self.events.lock().push((
			message.to_string(),
			attributes
				.iter()
				.map(|(k, v)| (k.clone(), v.serialize()))
				.collect(),
		));
		Ok(())
	}
}

/// Publishes image request lifecycle events.
#[derive(Clone, Debug)]
pub struct ImageStatusMonitor {
	publisher: Arc<dyn TopicPublisher>,
}

impl ImageStatusMonitor {
	pub fn new(publisher: Arc<dyn TopicPublisher>) -> Self {
		ImageStatusMonitor { publisher }
	}

	pub async fn process_event(
		&self,
		record: &ImageJobRecord,
		status: RequestStatus,
		message: &str,
	) -> Result<()> {
		let job_id = record.job_id.clone().unwrap_or_default();
		log::info!(
			"image status update: {status} {} ({message})",
			record.image_id
		);
		let attributes = vec![
			("status".to_string(), AttributeValue::String(status.to_string())),
			("job_id".to_string(), AttributeValue::String(job_id.clone())),
			(
				"image_id".to_string(),
				AttributeValue::String(record.image_id.clone()),
			),
			(
				"processing_duration".to_string(),
				AttributeValue::String(record.processing_duration.unwrap_or(0).to_string()),
			),
		];
		self
			.publisher
			.publish(
				&format!("StatusMonitor update: {status} {job_id}: {message}"),
				&attributes,
			)
			.await
			.context("failed to publish image status event")
	}

	/// Terminal status from the region counters.
	pub fn get_status(record: &ImageJobRecord) -> RequestStatus {
		let success = record.region_success.unwrap_or(0);
		let error = record.region_error.unwrap_or(0);
		let count = record.region_count.unwrap_or(0);
		if success == count {
			RequestStatus::Success
		} else if success + error == count && success > 0 {
			RequestStatus::Partial
		} else if error == count {
			RequestStatus::Failed
		} else {
			RequestStatus::InProgress
		}
	}
}

/// Publishes region lifecycle events.
#[derive(Clone, Debug)]
pub struct RegionStatusMonitor {
	publisher: Arc<dyn TopicPublisher>,
}

impl RegionStatusMonitor {
	pub fn new(publisher: Arc<dyn TopicPublisher>) -> Self {
		RegionStatusMonitor { publisher }
	}

	pub async fn process_event(
		&self,
		record: &RegionJobRecord,
		status: RequestStatus,
		message: &str,
	) -> Result<()> {
		log::info!(
			"region status update: {status} {} of {} ({message})",
			record.region_id,
			record.image_id
		);
		let attributes = vec![
			("status".to_string(), AttributeValue::String(status.to_string())),
			(
				"job_id".to_string(),
				AttributeValue::String(record.job_id.clone().unwrap_or_default()),
			),
			(
				"image_id".to_string(),
				AttributeValue::String(record.image_id.clone()),
			),
			(
				"region_id".to_string(),
				AttributeValue::String(record.region_id.clone()),
			),
			(
				"processing_duration".to_string(),
				AttributeValue::String(record.processing_duration.unwrap_or(0).to_string()),
			),
			(
				"failed_tiles".to_string(),
				AttributeValue::String(record.failed_tile_count.unwrap_or(0).to_string()),
			),
		];
		self
			.publisher
			.publish(
				&format!(
					"RegionStatusMonitor update: {status} {}: {message}",
					record.region_id
				),
				&attributes,
			)
			.await
			.context("failed to publish region status event")
	}

	/// Terminal status from tile totals.
	pub fn get_status(record: &RegionJobRecord) -> RequestStatus {
		record.derived_status()
	}
}
