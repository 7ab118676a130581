//! Shared value types: pixel geometry, request statuses and tile encodings.

mod pixel;
mod status;
mod tile_format;

pub use pixel::*;
pub use status::*;
pub use tile_format::*;

/// Returns the current wall-clock time as integer epoch milliseconds.
pub fn epoch_millis() -> i64 {
	use std::time::{SystemTime, UNIX_EPOCH};
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

/// Returns the current wall-clock time as integer epoch seconds.
pub fn epoch_seconds() -> i64 {
	epoch_millis() / 1000
}

/// Formats the current time as an ISO-8601 UTC timestamp with seconds precision
/// and a `Z` suffix, e.g. `2026-03-01T12:34:56Z`.
pub fn iso8601_now() -> String {
	let now = time::OffsetDateTime::now_utc()
		.replace_nanosecond(0)
		.unwrap_or_else(|_| time::OffsetDateTime::now_utc());
	now
		.format(&time::format_description::well_known::Rfc3339)
		.unwrap_or_default()
}
