//! Inference dispatch: sending encoded tiles to model endpoints.

mod hosted;
mod http;

pub use hosted::HostedDetector;
pub use http::{HttpDetector, RetryPolicy};

use anyhow::Result;
use async_trait::async_trait;
use skysift_core::feature::ImageFeature;
use skysift_core::types::ModelInvokeMode;
use std::fmt::Debug;
use std::sync::Arc;

/// A remote object detector reachable through some endpoint.
#[async_trait]
pub trait Detector: Send + Sync + Debug {
	fn endpoint(&self) -> &str;

	fn mode(&self) -> ModelInvokeMode;

	/// Sends an encoded tile and returns the detected features. An empty or
	/// unusable response from an HTTP endpoint yields an empty list rather
	/// than an error so a single bad tile never kills a worker.
	async fn find_features(&self, payload: &[u8]) -> Result<Vec<ImageFeature>>;

	/// Invocations attempted so far.
	fn request_count(&self) -> usize;

	/// Invocations that ultimately failed.
	fn error_count(&self) -> usize;
}

/// Builds the detector for a region request.
///
/// A trait so tests can substitute scripted detectors; the default
/// implementation constructs the HTTP or hosted-runtime variant.
pub trait DetectorProvider: Send + Sync + Debug {
	fn build(
		&self,
		endpoint: &str,
		mode: ModelInvokeMode,
		credentials: Option<&str>,
	) -> Result<Arc<dyn Detector>>;
}

/// Default provider backed by a shared HTTP client.
#[derive(Clone, Debug)]
pub struct DetectorFactory {
	hosted_runtime_url: String,
	client: reqwest::Client,
}

impl DetectorFactory {
	pub fn new(hosted_runtime_url: &str) -> Self {
		DetectorFactory {
			hosted_runtime_url: hosted_runtime_url.trim_end_matches('/').to_string(),
			client: reqwest::Client::new(),
		}
	}
}

impl DetectorProvider for DetectorFactory {
	fn build(
		&self,
		endpoint: &str,
		mode: ModelInvokeMode,
		credentials: Option<&str>,
	) -> Result<Arc<dyn Detector>> {
		Ok(match mode {
			ModelInvokeMode::HttpEndpoint => {
				Arc::new(HttpDetector::new(endpoint, self.client.clone()))
			}
			ModelInvokeMode::HostedEndpoint => Arc::new(HostedDetector::new(
				endpoint,
				&self.hosted_runtime_url,
				credentials,
				self.client.clone(),
			)),
		})
	}
}
