//! Hosted-runtime endpoint detector.
//!
//! Invokes a named endpoint on a hosted model runtime. Unlike the plain
//! HTTP detector, transport and decode failures surface to the caller: the
//! runtime is expected to be healthy, and a failed invocation should count
//! against the tile rather than silently produce no detections.

use super::Detector;
use anyhow::{Context, Result};
use async_trait::async_trait;
use skysift_core::feature::{parse_feature_collection, ImageFeature};
use skysift_core::types::ModelInvokeMode;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct HostedDetector {
	endpoint: String,
	invocation_url: String,
	credentials: Option<String>,
	client: reqwest::Client,
	request_count: AtomicUsize,
	error_count: AtomicUsize,
}

impl HostedDetector {
	pub fn new(
		endpoint: &str,
		runtime_url: &str,
		credentials: Option<&str>,
		client: reqwest::Client,
	) -> Self {
		HostedDetector {
			endpoint: endpoint.to_string(),
			invocation_url: format!("{runtime_url}/endpoints/{endpoint}/invocations"),
			credentials: credentials.map(str::to_string),
			client,
			request_count: AtomicUsize::new(0),
			error_count: AtomicUsize::new(0),
		}
	}
}

#[async_trait]
impl Detector for HostedDetector {
	fn endpoint(&self) -> &str {
		&self.endpoint
	}

	fn mode(&self) -> ModelInvokeMode {
		ModelInvokeMode::HostedEndpoint
	}

	async fn find_features(&self, payload: &[u8]) -> Result<Vec<ImageFeature>> {
		log::debug!("invoking hosted model {}", self.endpoint);
		self.request_count.fetch_add(1, Ordering::Relaxed);

		let mut request = self.client.post(&self.invocation_url).body(payload.to_vec());
		if let Some(credentials) = &self.credentials {
			request = request.bearer_auth(credentials);
		}

		let result = async {
			let response = request
				.send()
				.await
				.with_context(|| format!("unable to reach hosted model {}", self.endpoint))?;
			let response = response
				.error_for_status()
				.with_context(|| format!("hosted model {} rejected the invocation", self.endpoint))?;
			let body = response.text().await?;
			parse_feature_collection(&body)
				.with_context(|| format!("unable to decode response from model {}", self.endpoint))
		}
		.await;

		if result.is_err() {
			self.error_count.fetch_add(1, Ordering::Relaxed);
		}
		result
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
	fn invocation_url_targets_the_named_endpoint() {
		let detector = HostedDetector::new(
			"vehicle-detector",
			"http://runtime:8080",
			None,
			reqwest::Client::new(),
		);
		assert_eq!(
			detector.invocation_url,
			"http://runtime:8080/endpoints/vehicle-detector/invocations"
		);
	}

	#[tokio::test]
	async fn transport_errors_surface() {
		let detector = HostedDetector::new(
			"detector",
			"http://127.0.0.1:9",
			None,
			reqwest::Client::new(),
		);
		let err = detector.find_features(b"payload").await.unwrap_err();
		assert!(err.to_string().contains("unable to reach hosted model"));
		assert_eq!(detector.error_count(), 1);
	}
}
