//! Service configuration.
//!
//! One immutable struct built at startup and shared by reference. Table
//! names address the key-value store; the remaining knobs control worker
//! parallelism, throttling and the buffered queue.

use serde::{Deserialize, Serialize};
use skysift_core::types::PixelSize;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
	/// Tile workers per region.
	pub workers: usize,
	/// Workers assumed per endpoint vcpu when deriving the region ceiling.
	pub workers_per_cpu: u32,
	/// Scale factor in the max-regions formula.
	pub throttling_vcpu_scale_factor: u32,
	/// Nominal region size used when decomposing images.
	pub region_size: PixelSize,
	/// Whether region admission is gated on endpoint capacity.
	pub self_throttling: bool,
	/// Visibility delay, in seconds, for throttled region messages.
	pub throttling_retry_timeout: u64,
	/// Long-poll duration, in seconds, on the region queue.
	pub region_poll_seconds: u64,

	/// Lookahead bound of the buffered image request queue.
	pub max_jobs_lookahead: usize,
	/// Seconds before an attempted request becomes visible again.
	pub retry_time: i64,
	/// Attempts before a request moves to the dead-letter queue.
	pub max_retry_attempts: i64,

	/// Base URL of the hosted model runtime, for hosted-endpoint models.
	pub hosted_runtime_url: String,

	pub job_table: String,
	pub region_table: String,
	pub endpoint_statistics_table: String,
	pub feature_table: String,
	pub requested_jobs_table: String,
}

impl Default for ServiceConfig {
	fn default() -> Self {
		ServiceConfig {
			workers: 4,
			workers_per_cpu: 1,
			throttling_vcpu_scale_factor: 10,
			region_size: PixelSize::new(10240, 10240),
			self_throttling: true,
			throttling_retry_timeout: 30,
			region_poll_seconds: 10,
			max_jobs_lookahead: 500,
			retry_time: 600,
			max_retry_attempts: 1,
			hosted_runtime_url: "http://localhost:8080".to_string(),
			job_table: "image-jobs".to_string(),
			region_table: "region-jobs".to_string(),
			endpoint_statistics_table: "endpoint-statistics".to_string(),
			feature_table: "features".to_string(),
			requested_jobs_table: "requested-jobs".to_string(),
		}
	}
}
