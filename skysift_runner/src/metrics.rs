//! Minimal metrics seam.
//!
//! Metric emission plumbing is an external concern; the buffered queue only
//! needs somewhere to report its two gauges. The default sink logs.

use std::fmt::Debug;

pub trait MetricsSink: Send + Sync + Debug {
	fn gauge(&self, name: &str, value: f64);
}

/// Reports gauges as debug log lines.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
	fn gauge(&self, name: &str, value: f64) {
		log::debug!("metric {name} = {value}");
	}
}

#[cfg(test)]
pub mod testing {
	use super::MetricsSink;
	use parking_lot::Mutex;

	/// Captures gauges for assertions.
	#[derive(Debug, Default)]
	pub struct CapturingMetricsSink {
		pub gauges: Mutex<Vec<(String, f64)>>,
	}

	impl MetricsSink for CapturingMetricsSink {
		fn gauge(&self, name: &str, value: f64) {
			self.gauges.lock().push((name.to_string(), value));
		}
	}
}
