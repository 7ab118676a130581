//! HTTP endpoint detector with a counting retry policy.

use super::Detector;
use anyhow::Result;
use async_trait::async_trait;
use skysift_core::feature::{parse_feature_collection, ImageFeature};
use skysift_core::types::ModelInvokeMode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Exponential backoff: up to `total` attempts, starting at `base` and
/// doubling after each failed attempt, capped at `cap`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
	pub total: u32,
	pub base: Duration,
	pub cap: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetryPolicy {
			total: 8,
			base: Duration::from_secs(1),
			cap: Duration::from_secs(255),
		}
	}
}

impl RetryPolicy {
	/// Delay before the given retry (1-based).
	fn delay(&self, retry: u32) -> Duration {
		let factor = 2u32.saturating_pow(retry.saturating_sub(1));
		self.base.saturating_mul(factor).min(self.cap)
	}
}

#[derive(Debug)]
pub struct HttpDetector {
	endpoint: String,
	client: reqwest::Client,
	retry: RetryPolicy,
	request_count: AtomicUsize,
	error_count: AtomicUsize,
	retry_count: AtomicUsize,
}

impl HttpDetector {
	pub fn new(endpoint: &str, client: reqwest::Client) -> Self {
		HttpDetector {
			endpoint: endpoint.to_string(),
			client,
			retry: RetryPolicy::default(),
			request_count: AtomicUsize::new(0),
			error_count: AtomicUsize::new(0),
			retry_count: AtomicUsize::new(0),
		}
	}

	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	/// Retries issued so far, for metrics.
	pub fn retry_count(&self) -> usize {
		self.retry_count.load(Ordering::Relaxed)
	}

	async fn invoke(&self, payload: &[u8]) -> Result<String> {
		let mut attempt = 0u32;
		loop {
			attempt += 1;
			let result = self
				.client
				.post(&self.endpoint)
				.body(payload.to_vec())
				.send()
				.await;
			match result {
				Ok(response) => match response.error_for_status() {
					Ok(response) => return Ok(response.text().await?),
					Err(err) => {
						if attempt >= self.retry.total {
							return Err(err.into());
						}
					}
				},
				Err(err) => {
					if attempt >= self.retry.total {
						return Err(err.into());
					}
				}
			}
			self.retry_count.fetch_add(1, Ordering::Relaxed);
			tokio::time::sleep(self.retry.delay(attempt)).await;
		}
	}
}

#[async_trait]
impl Detector for HttpDetector {
	fn endpoint(&self) -> &str {
		&self.endpoint
	}

	fn mode(&self) -> ModelInvokeMode {
		ModelInvokeMode::HttpEndpoint
	}

	async fn find_features(&self, payload: &[u8]) -> Result<Vec<ImageFeature>> {
		log::debug!("invoking model at {}", self.endpoint);
		self.request_count.fetch_add(1, Ordering::Relaxed);

		let body = match self.invoke(payload).await {
			Ok(body) => body,
			Err(err) => {
				self.error_count.fetch_add(1, Ordering::Relaxed);
				log::error!("model invocation at {} failed: {err:#}", self.endpoint);
				return Ok(vec![]);
			}
		};

		match parse_feature_collection(&body) {
			Ok(features) => Ok(features),
			Err(err) => {
				self.error_count.fetch_add(1, Ordering::Relaxed);
				log::error!(
					"unable to decode response from model at {}: {err:#}",
					self.endpoint
				);
				Ok(vec![])
			}
		}
	}

	fn request_count(&self) -> usize {
		self.request_count.load(Ordering::Relaxed)
	}

	fn error_count(&self) -> usize {
		self.error_count.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_and_caps() {
		let retry = RetryPolicy::default();
		assert_eq!(retry.delay(1), Duration::from_secs(1));
		assert_eq!(retry.delay(2), Duration::from_secs(2));
		assert_eq!(retry.delay(4), Duration::from_secs(8));
		assert_eq!(retry.delay(8), Duration::from_secs(128));
		assert_eq!(retry.delay(9), Duration::from_secs(255));
		assert_eq!(retry.delay(20), Duration::from_secs(255));
	}

	#[tokio::test]
	async fn unreachable_endpoint_yields_empty_collection() {
		// Non-routable port with a single attempt: the detector swallows the
		// transport error and reports it through the counters.
		let detector = HttpDetector::new("http://127.0.0.1:9/detect", reqwest::Client::new())
			.with_retry_policy(RetryPolicy {
				total: 1,
				base: Duration::from_millis(1),
				cap: Duration::from_millis(1),
			});
		let features = detector.find_features(b"payload").await.unwrap();
		assert!(features.is_empty());
		assert_eq!(detector.request_count(), 1);
		assert_eq!(detector.error_count(), 1);
	}
}
