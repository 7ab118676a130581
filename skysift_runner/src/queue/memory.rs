//! In-memory queue with visibility-timeout semantics.

use super::{MessageQueue, QueueMessage};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
	id: u64,
	body: String,
	visible_at: Instant,
	receipt: Option<String>,
}

/// Reference queue used by tests and the demo binary.
#[derive(Debug)]
pub struct InMemoryQueue {
	entries: Mutex<Vec<Entry>>,
	counter: Mutex<u64>,
	visibility_timeout: Duration,
}

impl InMemoryQueue {
	pub fn new() -> Self {
		InMemoryQueue {
			entries: Mutex::new(vec![]),
			counter: Mutex::new(0),
			visibility_timeout: Duration::from_secs(30),
		}
	}

	pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
		self.visibility_timeout = visibility_timeout;
		self
	}

	/// Number of messages currently stored, visible or not.
	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn next_id(&self) -> u64 {
		let mut counter = self.counter.lock();
		*counter += 1;
		*counter
	}

	fn try_receive(&self, max_messages: usize) -> Vec<QueueMessage> {
		let now = Instant::now();
		let mut entries = self.entries.lock();
		let mut received = Vec::new();
		for entry in entries.iter_mut() {
			if received.len() >= max_messages {
				break;
			}
			if entry.visible_at <= now {
				let receipt = format!("{}#{}", entry.id, self.next_id());
				entry.visible_at = now + self.visibility_timeout;
				entry.receipt = Some(receipt.clone());
				received.push(QueueMessage {
					receipt,
					body: entry.body.clone(),
				});
			}
		}
		received
	}
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
	async fn send(&self, body: String) -> Result<()> {
		let id = self.next_id();
		self.entries.lock().push(Entry {
			id,
			body,
			visible_at: Instant::now(),
			receipt: None,
		});
		Ok(())
	}

	async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
		let deadline = Instant::now() + wait;
		loop {
			let received = self.try_receive(max_messages);
			if !received.is_empty() || Instant::now() >= deadline {
				return Ok(received);
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	}

	async fn delete(&self, receipt: &str) -> Result<()> {
		self
			.entries
			.lock()
			.retain(|entry| entry.receipt.as_deref() != Some(receipt));
		Ok(())
	}

	async fn reset_visibility(&self, receipt: &str, delay: Duration) -> Result<()> {
		let mut entries = self.entries.lock();
		for entry in entries.iter_mut() {
			if entry.receipt.as_deref() == Some(receipt) {
				entry.visible_at = Instant::now() + delay;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn received_messages_become_invisible() {
		let queue = InMemoryQueue::new();
		queue.send("one".into()).await.unwrap();

		let first = queue.receive(10, Duration::ZERO).await.unwrap();
		assert_eq!(first.len(), 1);
		// Still in the queue, but not visible.
		assert_eq!(queue.len(), 1);
		assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn delete_settles_a_message() {
		let queue = InMemoryQueue::new();
		queue.send("one".into()).await.unwrap();
		let received = queue.receive(1, Duration::ZERO).await.unwrap();
		queue.delete(&received[0].receipt).await.unwrap();
		assert!(queue.is_empty());
	}

	#[tokio::test]
	async fn reset_visibility_returns_message_immediately() {
		let queue = InMemoryQueue::new();
		queue.send("one".into()).await.unwrap();
		let received = queue.receive(1, Duration::ZERO).await.unwrap();
		queue
			.reset_visibility(&received[0].receipt, Duration::ZERO)
			.await
			.unwrap();
		let again = queue.receive(1, Duration::ZERO).await.unwrap();
		assert_eq!(again.len(), 1);
		assert_eq!(again[0].body, "one");
	}

	#[tokio::test]
	async fn receive_honors_the_batch_limit() {
		let queue = InMemoryQueue::new();
		for i in 0..15 {
			queue.send(format!("m{i}")).await.unwrap();
		}
		let batch = queue.receive(10, Duration::ZERO).await.unwrap();
		assert_eq!(batch.len(), 10);
	}
}
