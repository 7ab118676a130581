//! Endpoint capacity lookups.
//!
//! The scheduler and the region throttle both need to know how much work a
//! model endpoint can absorb. That comes from an out-of-band description of
//! the endpoint (instances and vcpus); lookups are cached for sixty seconds
//! per endpoint to bound control-plane traffic.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use moka::future::Cache;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// What the hosting service reports about an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescription {
	pub instance_count: u32,
	pub vcpus_per_instance: u32,
}

/// Out-of-band endpoint description lookup.
#[async_trait]
pub trait EndpointControl: Send + Sync + Debug {
	async fn describe_endpoint(
		&self,
		endpoint_name: &str,
		credentials: Option<&str>,
	) -> Result<EndpointDescription>;
}

/// Cached capacity calculations on top of [`EndpointControl`].
#[derive(Clone)]
pub struct EndpointCapacity {
	control: Arc<dyn EndpointControl>,
	descriptions: Cache<String, EndpointDescription>,
	vcpu_scale_factor: u32,
	workers_per_cpu: u32,
}

impl Debug for EndpointCapacity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EndpointCapacity")
			.field("vcpu_scale_factor", &self.vcpu_scale_factor)
			.field("workers_per_cpu", &self.workers_per_cpu)
			.finish()
	}
}

impl EndpointCapacity {
	pub fn new(control: Arc<dyn EndpointControl>, vcpu_scale_factor: u32, workers_per_cpu: u32) -> Self {
		EndpointCapacity {
			control,
			descriptions: Cache::builder()
				.max_capacity(64)
				.time_to_live(Duration::from_secs(60))
				.build(),
			vcpu_scale_factor,
			workers_per_cpu: workers_per_cpu.max(1),
		}
	}

	async fn describe(
		&self,
		endpoint_name: &str,
		credentials: Option<&str>,
	) -> Result<EndpointDescription> {
		let credentials = credentials.map(str::to_string);
		let control = self.control.clone();
		let name = endpoint_name.to_string();
		self
			.descriptions
			.try_get_with(endpoint_name.to_string(), async move {
				control.describe_endpoint(&name, credentials.as_deref()).await
			})
			.await
			.map_err(|err| anyhow!("failed to describe endpoint {endpoint_name}: {err}"))
	}

	/// The number of regions an endpoint can process concurrently:
	/// `floor(scale_factor · vcpus · instances / workers_per_cpu)`.
	pub async fn max_regions(
		&self,
		endpoint_name: &str,
		credentials: Option<&str>,
	) -> Result<i64> {
		let description = self.describe(endpoint_name, credentials).await?;
		let max_regions = (self.vcpu_scale_factor as i64
			* description.vcpus_per_instance as i64
			* description.instance_count as i64)
			/ self.workers_per_cpu as i64;
		log::debug!(
			"max regions for endpoint {endpoint_name} calculated to be {max_regions} \
			 (instances: {}, vcpus: {})",
			description.instance_count,
			description.vcpus_per_instance
		);
		Ok(max_regions)
	}

	/// Like [`EndpointCapacity::max_regions`], but degrades to a
	/// single-instance assumption when the control plane is unavailable.
	pub async fn max_regions_or_default(
		&self,
		endpoint_name: &str,
		credentials: Option<&str>,
	) -> i64 {
		match self.max_regions(endpoint_name, credentials).await {
			Ok(max_regions) => max_regions,
			Err(err) => {
				let fallback = (self.vcpu_scale_factor / self.workers_per_cpu).max(1) as i64;
				log::error!(
					"capacity lookup for {endpoint_name} failed, assuming one instance \
					 (max regions {fallback}): {err:#}"
				);
				fallback
			}
		}
	}

	/// Instance count for the scheduler's load factor; defaults to one when
	/// the lookup fails so scheduling keeps making progress.
	pub async fn instance_count(&self, endpoint_name: &str) -> u32 {
		match self.describe(endpoint_name, None).await {
			Ok(description) => description.instance_count.max(1),
			Err(err) => {
				log::error!("error describing endpoint {endpoint_name}: {err:#}");
				1
			}
		}
	}
}

/// Fixed endpoint description, for tests and the demo binary.
#[derive(Clone, Copy, Debug)]
pub struct StaticEndpointControl {
	pub description: EndpointDescription,
}

impl StaticEndpointControl {
	pub fn new(instance_count: u32, vcpus_per_instance: u32) -> Self {
		StaticEndpointControl {
			description: EndpointDescription {
				instance_count,
				vcpus_per_instance,
			},
		}
	}
}

#[async_trait]
impl EndpointControl for StaticEndpointControl {
	async fn describe_endpoint(
		&self,
		_endpoint_name: &str,
		_credentials: Option<&str>,
	) -> Result<EndpointDescription> {
		Ok(self.description)
	}
}
