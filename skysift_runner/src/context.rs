//! Task-local logging context.
//!
//! The core loop runs one request at a time but the tile workers fan out
//! into many tasks; attaching the job/image/region identifiers to a
//! task-local lets log lines carry their request context without threading
//! the identifiers through every call.

use std::future::Future;

tokio::task_local! {
	static LOG_CONTEXT: String;
}

/// Runs a future with the given logging context attached.
pub async fn with_context<F: Future>(context: String, future: F) -> F::Output {
	LOG_CONTEXT.scope(context, future).await
}

/// The current context, or an empty string outside any scope.
pub fn current_context() -> String {
	LOG_CONTEXT.try_with(|c| c.clone()).unwrap_or_default()
}

/// Formats a context string for an image-scoped task.
pub fn image_context(job_id: &str, image_id: &str) -> String {
	format!("job={job_id} image={image_id}")
}

/// Formats a context string for a region-scoped task.
pub fn region_context(job_id: &str, image_id: &str, region_id: &str) -> String {
	format!("job={job_id} image={image_id} region={region_id}")
}
