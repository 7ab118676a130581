//! Status enums shared by the progress tables and the status monitors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an image or region job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
	Started,
	InProgress,
	Success,
	Partial,
	Failed,
}

impl RequestStatus {
	/// True for statuses that end a job.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			RequestStatus::Success | RequestStatus::Partial | RequestStatus::Failed
		)
	}
}

impl fmt::Display for RequestStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			RequestStatus::Started => "STARTED",
			RequestStatus::InProgress => "IN_PROGRESS",
			RequestStatus::Success => "SUCCESS",
			RequestStatus::Partial => "PARTIAL",
			RequestStatus::Failed => "FAILED",
		})
	}
}

/// Outcome of a single tile inference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileState {
	Succeeded,
	Failed,
}

impl TileState {
	/// Field prefix used by the region table list-append updates.
	pub fn field_prefix(&self) -> &'static str {
		match self {
			TileState::Succeeded => "succeeded",
			TileState::Failed => "failed",
		}
	}
}

/// How a model endpoint is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelInvokeMode {
	/// A named endpoint on a hosted model runtime.
	HostedEndpoint,
	/// A plain HTTP endpoint reachable by URL.
	HttpEndpoint,
}

impl ModelInvokeMode {
	pub fn parse(value: &str) -> Option<Self> {
		match value {
			"HOSTED_ENDPOINT" | "SM_ENDPOINT" => Some(ModelInvokeMode::HostedEndpoint),
			"HTTP_ENDPOINT" => Some(ModelInvokeMode::HttpEndpoint),
			_ => None,
		}
	}
}

impl fmt::Display for ModelInvokeMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ModelInvokeMode::HostedEndpoint => "HOSTED_ENDPOINT",
			ModelInvokeMode::HttpEndpoint => "HTTP_ENDPOINT",
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn terminal_statuses() {
		assert!(!RequestStatus::Started.is_terminal());
		assert!(!RequestStatus::InProgress.is_terminal());
		assert!(RequestStatus::Success.is_terminal());
		assert!(RequestStatus::Partial.is_terminal());
		assert!(RequestStatus::Failed.is_terminal());
	}

	#[test]
	fn invoke_mode_parses_legacy_name() {
		assert_eq!(
			ModelInvokeMode::parse("SM_ENDPOINT"),
			Some(ModelInvokeMode::HostedEndpoint)
		);
		assert_eq!(
			ModelInvokeMode::parse("HTTP_ENDPOINT"),
			Some(ModelInvokeMode::HttpEndpoint)
		);
		assert_eq!(ModelInvokeMode::parse("FTP"), None);
	}
}
