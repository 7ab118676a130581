//! Error taxonomy for the worker.
//!
//! Most fallible paths use `anyhow`; the variants below are the typed
//! signals the core loop must distinguish. They travel inside
//! `anyhow::Error` and are recovered with `downcast_ref` at the loop
//! boundary to decide between retry, delayed retry and dropping the message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
	/// The request failed validation at admission; it goes to the DLQ.
	#[error("invalid image request: {0}")]
	InvalidImageRequest(String),

	/// Transient failure; the message returns to the queue immediately.
	#[error("job should be retried: {0}")]
	RetryableJob(String),

	/// The target endpoint is at its region ceiling; the message returns to
	/// the queue after the configured delay.
	#[error("region throttled: {0}")]
	SelfThrottledRegion(String),

	/// The request names an unsupported model hosting mode.
	#[error("unsupported model endpoint: {0}")]
	UnsupportedModel(String),

	#[error("failed to process image: {0}")]
	ProcessImage(String),

	#[error("failed to process region: {0}")]
	ProcessRegion(String),

	#[error("failed to aggregate features: {0}")]
	AggregateFeatures(String),

	/// No configured sink accepted the aggregate output.
	#[error("failed to write features to any sink: {0}")]
	AggregateOutput(String),
}

/// True when the error carries a [`RunnerError::RetryableJob`] signal.
pub fn is_retryable(err: &anyhow::Error) -> bool {
	matches!(err.downcast_ref::<RunnerError>(), Some(RunnerError::RetryableJob(_)))
}

/// True when the error carries a [`RunnerError::SelfThrottledRegion`] signal.
pub fn is_throttled(err: &anyhow::Error) -> bool {
	matches!(
		err.downcast_ref::<RunnerError>(),
		Some(RunnerError::SelfThrottledRegion(_))
	)
}
