//! Endpoint-load image scheduler.
//!
//! Prefers the oldest pending request targeting the least-loaded endpoint.
//! The buffered queue provides a lookahead over pending requests; the load
//! of an endpoint is the number of regions still outstanding for requests
//! running against it, divided by its instance count. The heuristic is
//! approximate by design: regions vary in size but not wildly, and it keeps
//! any single endpoint from being oversubscribed relative to its peers.

use super::ImageScheduler;
use crate::api::ImageRequest;
use crate::endpoint::EndpointCapacity;
use crate::queue::BufferedImageRequestQueue;
use anyhow::Result;
use async_trait::async_trait;
use itertools::Itertools;
use skysift_store::ImageRequestStatusRecord;
use std::collections::HashMap;

/// Load snapshot for one endpoint.
#[derive(Clone, Debug)]
struct EndpointUtilization {
	endpoint_id: String,
	instance_count: u32,
	current_load: i64,
	requests: Vec<ImageRequestStatusRecord>,
}

impl EndpointUtilization {
	fn load_factor(&self) -> f64 {
		self.current_load as f64 / self.instance_count.max(1) as f64
	}
}

#[derive(Debug)]
pub struct EndpointLoadImageScheduler {
	image_request_queue: BufferedImageRequestQueue,
	capacity: EndpointCapacity,
}

impl EndpointLoadImageScheduler {
	pub fn new(image_request_queue: BufferedImageRequestQueue, capacity: EndpointCapacity) -> Self {
		EndpointLoadImageScheduler {
			image_request_queue,
			capacity,
		}
	}

	pub fn queue(&self) -> &BufferedImageRequestQueue {
		&self.image_request_queue
	}

	async fn calculate_utilization(
		&self,
		requests: Vec<ImageRequestStatusRecord>,
	) -> Vec<EndpointUtilization> {
		let mut grouped: HashMap<String, Vec<ImageRequestStatusRecord>> = HashMap::new();
		for request in requests {
			grouped.entry(request.endpoint_id.clone()).or_default().push(request);
		}

		let mut utilization = Vec::with_capacity(grouped.len());
		for (endpoint_id, requests) in grouped {
			let instance_count = self.capacity.instance_count(&endpoint_id).await;

			let mut current_load = 0i64;
			for record in &requests {
				match record.region_count {
					// An attempt has started but the region count is not known
					// yet; count it as one region of load.
					None if record.last_attempt > 0 => current_load += 1,
					None => {}
					Some(count) => {
						current_load += (count - record.regions_complete.len() as i64).max(1)
					}
				}
			}

			utilization.push(EndpointUtilization {
				endpoint_id,
				instance_count,
				current_load,
				requests,
			});
		}
		utilization
	}

	/// Oldest request among the endpoints tied for the lowest load factor.
	fn select_next_eligible(
		utilization: &[EndpointUtilization],
	) -> Option<ImageRequestStatusRecord> {
		let mut oldest: Option<&ImageRequestStatusRecord> = None;
		let mut chosen_load: Option<f64> = None;

		for endpoint in utilization
			.iter()
			.sorted_by(|a, b| a.load_factor().total_cmp(&b.load_factor()))
		{
			if let Some(load) = chosen_load {
				if endpoint.load_factor() > load {
					break;
				}
			}
			if let Some(candidate) = endpoint.requests.iter().min_by_key(|r| r.request_time) {
				if oldest.map(|o| o.request_time > candidate.request_time).unwrap_or(true) {
					oldest = Some(candidate);
					chosen_load = Some(endpoint.load_factor());
				}
			}
		}
		oldest.cloned()
	}
}

#[async_trait]
impl ImageScheduler for EndpointLoadImageScheduler {
	async fn get_next_scheduled_request(&self) -> Option<ImageRequest> {
		let outstanding = self.image_request_queue.get_outstanding_requests().await;
		if outstanding.is_empty() {
			log::debug!("no image processing request available to start");
			return None;
		}
		log::debug!("retrieved {} buffered image processing requests", outstanding.len());

		let utilization = self.calculate_utilization(outstanding).await;
		if log::log_enabled!(log::Level::Debug) {
			for endpoint in &utilization {
				log::debug!(
					"endpoint utilization: {} instances={} requests={} load={}",
					endpoint.endpoint_id,
					endpoint.instance_count,
					endpoint.requests.len(),
					endpoint.current_load
				);
			}
		}

		let next = Self::select_next_eligible(&utilization)?;
		log::debug!(
			"selected job {} requested at {} for processing",
			next.job_id,
			next.request_time
		);

		// Claim the record for this attempt. A conflict means another worker
		// started the same request; skip this cycle so the caller checks the
		// region queue before trying again.
		match self
			.image_request_queue
			.requested_jobs_table()
			.start_next_attempt(&next)
			.await
		{
			Ok(true) => {}
			Ok(false) => {
				log::debug!("job {} was started by another worker", next.job_id);
				return None;
			}
			Err(err) => {
				log::error!("error claiming next request: {err:#}");
				return None;
			}
		}

		match ImageRequest::from_external_message(&next.request_payload) {
			Ok(request) => Some(request),
			Err(err) => {
				log::error!("buffered request {} is unparseable: {err:#}", next.job_id);
				None
			}
		}
	}

	async fn finish_request(&self, _request: &ImageRequest, _should_retry: bool) -> Result<()> {
		// Requests are fully managed by the buffered queue; completion and
		// retries fall out of the lookahead table bookkeeping.
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn record(endpoint: &str, job: &str, request_time: i64) -> ImageRequestStatusRecord {
		ImageRequestStatusRecord {
			endpoint_id: endpoint.to_string(),
			job_id: job.to_string(),
			request_time,
			request_payload: json!({}),
			last_attempt: 0,
			num_attempts: 0,
			regions_complete: vec![],
			region_count: None,
		}
	}

	fn utilization(
		endpoint: &str,
		instance_count: u32,
		current_load: i64,
		requests: Vec<ImageRequestStatusRecord>,
	) -> EndpointUtilization {
		EndpointUtilization {
			endpoint_id: endpoint.to_string(),
			instance_count,
			current_load,
			requests,
		}
	}

	#[test]
	fn least_loaded_endpoint_wins() {
		let busy = utilization("busy", 1, 10, vec![record("busy", "job-old", 100)]);
		let idle = utilization("idle", 1, 0, vec![record("idle", "job-new", 200)]);
		let chosen = EndpointLoadImageScheduler::select_next_eligible(&[busy, idle]).unwrap();
		assert_eq!(chosen.job_id, "job-new");
	}

	#[test]
	fn oldest_request_wins_among_tied_endpoints() {
		let a = utilization("a", 2, 4, vec![record("a", "job-a", 300)]);
		let b = utilization("b", 2, 4, vec![record("b", "job-b", 100)]);
		let chosen = EndpointLoadImageScheduler::select_next_eligible(&[a, b]).unwrap();
		assert_eq!(chosen.job_id, "job-b");
	}

	#[test]
	fn instance_count_scales_the_load() {
		// Same absolute load, but more instances behind endpoint "big".
		let big = utilization("big", 8, 8, vec![record("big", "job-big", 500)]);
		let small = utilization("small", 1, 2, vec![record("small", "job-small", 100)]);
		let chosen = EndpointLoadImageScheduler::select_next_eligible(&[big, small]).unwrap();
		assert_eq!(chosen.job_id, "job-big");
	}

	#[test]
	fn empty_utilization_selects_nothing() {
		assert!(EndpointLoadImageScheduler::select_next_eligible(&[]).is_none());
	}
}
