//! Buffered image request queue.
//!
//! Pulls raw image requests off the external queue, persists them to the
//! lookahead table, and hands the scheduler a snapshot of the requests that
//! are currently eligible for an attempt. Finished or exhausted requests
//! are purged on each cycle; malformed and permanently-failed requests go
//! to the dead-letter queue.

use super::MessageQueue;
use crate::api::ImageRequest;
use crate::metrics::MetricsSink;
use anyhow::Result;
use serde_json::Value;
use skysift_core::types::epoch_seconds;
use skysift_store::{ImageRequestStatusRecord, RequestedJobsTable};
use std::sync::Arc;
use std::time::Duration;

pub struct BufferedImageRequestQueue {
	image_queue: Arc<dyn MessageQueue>,
	image_dlq: Arc<dyn MessageQueue>,
	requested_jobs_table: RequestedJobsTable,
	metrics: Arc<dyn MetricsSink>,
	max_jobs_lookahead: usize,
	retry_time: i64,
	max_retry_attempts: i64,
}

impl std::fmt::Debug for BufferedImageRequestQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BufferedImageRequestQueue")
			.field("max_jobs_lookahead", &self.max_jobs_lookahead)
			.field("retry_time", &self.retry_time)
			.field("max_retry_attempts", &self.max_retry_attempts)
			.finish()
	}
}

impl BufferedImageRequestQueue {
	pub fn new(
		image_queue: Arc<dyn MessageQueue>,
		image_dlq: Arc<dyn MessageQueue>,
		requested_jobs_table: RequestedJobsTable,
		metrics: Arc<dyn MetricsSink>,
		max_jobs_lookahead: usize,
		retry_time: i64,
		max_retry_attempts: i64,
	) -> Self {
		BufferedImageRequestQueue {
			image_queue,
			image_dlq,
			requested_jobs_table,
			metrics,
			max_jobs_lookahead,
			retry_time,
			max_retry_attempts,
		}
	}

	pub fn requested_jobs_table(&self) -> &RequestedJobsTable {
		&self.requested_jobs_table
	}

	/// The subset of buffered requests currently eligible to be attempted.
	///
	/// Any failure in here degrades to an empty snapshot; the scheduler will
	/// simply try again next cycle.
	pub async fn get_outstanding_requests(&self) -> Vec<ImageRequestStatusRecord> {
		match self.refresh().await {
			Ok(visible) => visible,
			Err(err) => {
				log::error!("error getting outstanding requests: {err:#}");
				vec![]
			}
		}
	}

	async fn refresh(&self) -> Result<Vec<ImageRequestStatusRecord>> {
		let outstanding = self.requested_jobs_table.get_outstanding_requests().await?;
		let mut outstanding = self.purge_finished_requests(outstanding).await;

		if outstanding.len() < self.max_jobs_lookahead {
			let fetched = self
				.fetch_new_requests(self.max_jobs_lookahead - outstanding.len())
				.await;
			outstanding.extend(fetched);
		}

		let now = epoch_seconds();
		let visible: Vec<ImageRequestStatusRecord> = outstanding
			.iter()
			.filter(|r| r.last_attempt + self.retry_time < now)
			.cloned()
			.collect();

		self
			.metrics
			.gauge("ApproximateNumberOfRequestsBuffered", outstanding.len() as f64);
		self
			.metrics
			.gauge("ApproximateNumberOfRequestsVisible", visible.len() as f64);

		Ok(visible)
	}

	/// Short-polls the input queue and moves valid requests into the table.
	///
	/// The table write happens before the queue delete: losing the delete
	/// only causes a redelivery, which the table then ignores as a duplicate.
	async fn fetch_new_requests(&self, max_messages_to_fetch: usize) -> Vec<ImageRequestStatusRecord> {
		let mut fetched = Vec::new();
		let mut remaining = max_messages_to_fetch;
		while remaining > 0 {
			let messages = match self
				.image_queue
				.receive(remaining.min(10), Duration::from_secs(1))
				.await
			{
				Ok(messages) => messages,
				Err(err) => {
					log::error!("error receiving image requests: {err:#}");
					break;
				}
			};
			if messages.is_empty() {
				break;
			}

			for message in messages {
				let request = serde_json::from_str::<Value>(&message.body)
					.map_err(anyhow::Error::from)
					.and_then(|body| {
						let request = ImageRequest::from_external_message(&body)?;
						request.validate()?;
						Ok((body, request))
					});
				match request {
					Ok((body, request)) => {
						match self
							.requested_jobs_table
							.add_new_request(&request.model_name, &request.job_id, body)
							.await
						{
							Ok(record) => {
								if let Err(err) = self.image_queue.delete(&message.receipt).await {
									// The record exists, so the redelivery will be ignored.
									log::error!("unable to delete buffered image request: {err:#}");
								}
								fetched.push(record);
								remaining = remaining.saturating_sub(1);
							}
							Err(err) => {
								// Leave the message on the queue for a retry attempt.
								log::error!("unable to buffer valid image request: {err:#}");
							}
						}
					}
					Err(err) => {
						log::info!("invalid image request, moving to DLQ: {err:#}");
						self.handle_invalid_message(&message.body, &message.receipt).await;
					}
				}
			}
		}
		fetched
	}

	async fn handle_invalid_message(&self, body: &str, receipt: &str) {
		if let Err(err) = self.image_dlq.send(body.to_string()).await {
			log::error!("unable to move invalid image request to the DLQ: {err:#}");
			return;
		}
		if let Err(err) = self.image_queue.delete(receipt).await {
			log::error!("unable to delete invalid image request: {err:#}");
		}
	}

	/// Drops finished requests and dead-letters exhausted ones.
	async fn purge_finished_requests(
		&self,
		outstanding: Vec<ImageRequestStatusRecord>,
	) -> Vec<ImageRequestStatusRecord> {
		let mut remaining = Vec::with_capacity(outstanding.len());
		for record in outstanding {
			let finished = record.region_count.is_some()
				&& record.region_count == Some(record.regions_complete.len() as i64);
			let result = if finished {
				self
					.requested_jobs_table
					.complete_request(&record.endpoint_id, &record.job_id)
					.await
			} else if record.num_attempts >= self.max_retry_attempts {
				self.dead_letter_and_complete(&record).await
			} else {
				remaining.push(record);
				continue;
			};
			if let Err(err) = result {
				log::error!("unable to clean up outstanding request: {err:#}");
			}
		}
		remaining
	}

	async fn dead_letter_and_complete(&self, record: &ImageRequestStatusRecord) -> Result<()> {
		log::warn!(
			"request {} exhausted its {} attempts, moving to DLQ",
			record.job_id,
			record.num_attempts
		);
		self
			.image_dlq
			.send(serde_json::to_string(&record.request_payload)?)
			.await?;
		self
			.requested_jobs_table
			.complete_request(&record.endpoint_id, &record.job_id)
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::metrics::testing::CapturingMetricsSink;
	use crate::queue::InMemoryQueue;
	use serde_json::json;
	use skysift_store::MemoryKvStore;

	fn request_body(job_id: &str) -> String {
		json!({
			"jobId": job_id,
			"imageUrls": ["s3://imagery/scene.ntf"],
			"imageProcessor": {"name": "detector", "type": "HTTP_ENDPOINT"},
			"outputs": [{"type": "S3", "bucket": "results", "prefix": "out"}],
		})
		.to_string()
	}

	struct Fixture {
		queue: Arc<InMemoryQueue>,
		dlq: Arc<InMemoryQueue>,
		buffered: BufferedImageRequestQueue,
	}

	fn fixture(max_retry_attempts: i64) -> Fixture {
		let queue = Arc::new(InMemoryQueue::new());
		let dlq = Arc::new(InMemoryQueue::new());
		let table = RequestedJobsTable::new(Arc::new(MemoryKvStore::new()), "requested");
		let buffered = BufferedImageRequestQueue::new(
			queue.clone(),
			dlq.clone(),
			table,
			Arc::new(CapturingMetricsSink::default()),
			500,
			600,
			max_retry_attempts,
		);
		Fixture { queue, dlq, buffered }
	}

	#[tokio::test]
	async fn valid_requests_move_from_queue_to_table() {
		let f = fixture(1);
		f.queue.send(request_body("job-1")).await.unwrap();

		let visible = f.buffered.get_outstanding_requests().await;
		assert_eq!(visible.len(), 1);
		assert_eq!(visible[0].job_id, "job-1");
		// Consumed from the queue once buffered.
		assert!(f.queue.is_empty());
		assert!(f.dlq.is_empty());
	}

	#[tokio::test]
	async fn malformed_requests_go_to_the_dlq() {
		let f = fixture(1);
		f.queue.send("this is not json".into()).await.unwrap();
		f.queue.send(request_body("job-1")).await.unwrap();

		let visible = f.buffered.get_outstanding_requests().await;
		assert_eq!(visible.len(), 1);
		assert_eq!(f.dlq.len(), 1);
		assert!(f.queue.is_empty());
	}

	#[tokio::test]
	async fn duplicate_delivery_produces_one_record() {
		let f = fixture(1);
		f.queue.send(request_body("job-1")).await.unwrap();
		f.queue.send(request_body("job-1")).await.unwrap();

		let visible = f.buffered.get_outstanding_requests().await;
		assert_eq!(visible.len(), 1);
		assert_eq!(
			f.buffered
				.requested_jobs_table()
				.get_outstanding_requests()
				.await
				.unwrap()
				.len(),
			1
		);
	}

	#[tokio::test]
	async fn exhausted_requests_are_dead_lettered() {
		let f = fixture(1);
		f.queue.send(request_body("job-1")).await.unwrap();

		let visible = f.buffered.get_outstanding_requests().await;
		f.buffered
			.requested_jobs_table()
			.start_next_attempt(&visible[0])
			.await
			.unwrap();

		// One attempt spent with max_retry_attempts = 1: purged to the DLQ.
		let visible = f.buffered.get_outstanding_requests().await;
		assert!(visible.is_empty());
		assert_eq!(f.dlq.len(), 1);
	}

	#[tokio::test]
	async fn recently_attempted_requests_are_not_visible() {
		let f = fixture(5);
		f.queue.send(request_body("job-1")).await.unwrap();
		let visible = f.buffered.get_outstanding_requests().await;
		f.buffered
			.requested_jobs_table()
			.start_next_attempt(&visible[0])
			.await
			.unwrap();

		// Attempted moments ago: buffered but no longer visible.
		let visible = f.buffered.get_outstanding_requests().await;
		assert!(visible.is_empty());
		assert_eq!(
			f.buffered
				.requested_jobs_table()
				.get_outstanding_requests()
				.await
				.unwrap()
				.len(),
			1
		);
	}

	#[tokio::test]
	async fn finished_requests_are_purged() {
		let f = fixture(5);
		f.queue.send(request_body("job-1")).await.unwrap();
		let visible = f.buffered.get_outstanding_requests().await;
		let record = &visible[0];

		let table = f.buffered.requested_jobs_table();
		table
			.update_request_details(&record.endpoint_id, &record.job_id, 1)
			.await
			.unwrap();
		table
			.complete_region(&record.endpoint_id, &record.job_id, "r-1")
			.await
			.unwrap();

		assert!(f.buffered.get_outstanding_requests().await.is_empty());
		assert!(table.get_outstanding_requests().await.unwrap().is_empty());
	}
}
