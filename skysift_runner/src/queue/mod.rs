//! Message queue contract and implementations.
//!
//! The external image queue, the internal region queue and the dead-letter
//! queues all speak this interface. Messages become invisible while a
//! worker holds them and return to the queue when their visibility timeout
//! elapses or is reset.

mod buffered;
mod memory;

pub use buffered::BufferedImageRequestQueue;
pub use memory::InMemoryQueue;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

/// A received message plus the receipt used to settle it.
#[derive(Clone, Debug)]
pub struct QueueMessage {
	pub receipt: String,
	pub body: String,
}

#[async_trait]
pub trait MessageQueue: Send + Sync + Debug {
	async fn send(&self, body: String) -> Result<()>;

	/// Receives up to `max_messages`, waiting at most `wait` for the first.
	async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>>;

	/// Settles a message for good.
	async fn delete(&self, receipt: &str) -> Result<()>;

	/// Returns a message to the queue after the given delay.
	async fn reset_visibility(&self, receipt: &str, delay: Duration) -> Result<()>;
}
