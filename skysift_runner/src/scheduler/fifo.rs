//! First-in-first-out image scheduler: a pass-through to the request queue.

use super::ImageScheduler;
use crate::api::ImageRequest;
use crate::queue::MessageQueue;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct FifoImageScheduler {
	image_queue: Arc<dyn MessageQueue>,
	receipts_by_job: Mutex<HashMap<String, String>>,
}

impl FifoImageScheduler {
	pub fn new(image_queue: Arc<dyn MessageQueue>) -> Self {
		FifoImageScheduler {
			image_queue,
			receipts_by_job: Mutex::new(HashMap::new()),
		}
	}
}

#[async_trait]
impl ImageScheduler for FifoImageScheduler {
	async fn get_next_scheduled_request(&self) -> Option<ImageRequest> {
		let messages = match self.image_queue.receive(1, Duration::ZERO).await {
			Ok(messages) => messages,
			Err(err) => {
				log::error!("unable to retrieve an image request from the queue: {err:#}");
				return None;
			}
		};
		let message = messages.into_iter().next()?;

		let parsed = serde_json::from_str::<Value>(&message.body)
			.map_err(anyhow::Error::from)
			.and_then(|body| {
				let request = ImageRequest::from_external_message(&body)?;
				request.validate()?;
				Ok(request)
			});
		match parsed {
			Ok(request) => {
				self
					.receipts_by_job
					.lock()
					.insert(request.job_id.clone(), message.receipt);
				Some(request)
			}
			Err(err) => {
				log::error!("failed to parse image request: {err:#}");
				if let Err(err) = self.image_queue.delete(&message.receipt).await {
					log::error!("unable to drop unparseable image request: {err:#}");
				}
				None
			}
		}
	}

	async fn finish_request(&self, request: &ImageRequest, should_retry: bool) -> Result<()> {
		let receipt = self
			.receipts_by_job
			.lock()
			.remove(&request.job_id)
			.with_context(|| format!("no in-flight message for job {}", request.job_id))?;
		if should_retry {
			self
				.image_queue
				.reset_visibility(&receipt, Duration::ZERO)
				.await
		} else {
			self.image_queue.delete(&receipt).await
		}
	}
}
