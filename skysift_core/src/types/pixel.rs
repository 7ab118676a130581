//! Pixel-space geometry used throughout the tiling and scheduling code.
//!
//! A [`PixelSize`] describes tile, overlap or region dimensions. A
//! [`PixelRegion`] is an axis-aligned rectangle anchored at an upper-left
//! (row, column) corner, matching the convention used by raster readers.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width and height in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelSize {
	pub width: u32,
	pub height: u32,
}

impl PixelSize {
	pub fn new(width: u32, height: u32) -> Self {
		PixelSize { width, height }
	}

	/// A square size, used for the `tile_size`/`tile_overlap` request fields
	/// that arrive as a single number.
	pub fn square(side: u32) -> Self {
		PixelSize::new(side, side)
	}
}

impl fmt::Display for PixelSize {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}x{}", self.width, self.height)
	}
}

/// A rectangle in image pixel space: upper-left corner `(row, col)` plus
/// `(width, height)`.
///
/// The rectangle may be empty (zero width or height). Coordinates are
/// non-negative because they always refer into a raster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRegion {
	/// Upper-left row (y).
	pub row: u32,
	/// Upper-left column (x).
	pub col: u32,
	pub width: u32,
	pub height: u32,
}

impl PixelRegion {
	pub fn new(row: u32, col: u32, width: u32, height: u32) -> Self {
		PixelRegion {
			row,
			col,
			width,
			height,
		}
	}

	/// The full extent of an image of the given size, anchored at the origin.
	pub fn of_image(width: u32, height: u32) -> Self {
		PixelRegion::new(0, 0, width, height)
	}

	/// Validating constructor used when bounds arrive from an external message.
	pub fn from_message(row: u32, col: u32, width: u32, height: u32) -> Result<Self> {
		ensure!(width > 0, "region width must be positive, got {width}");
		ensure!(height > 0, "region height must be positive, got {height}");
		Ok(PixelRegion::new(row, col, width, height))
	}

	pub fn size(&self) -> PixelSize {
		PixelSize::new(self.width, self.height)
	}

	/// One past the right-most column.
	pub fn right(&self) -> u32 {
		self.col + self.width
	}

	/// One past the bottom-most row.
	pub fn bottom(&self) -> u32 {
		self.row + self.height
	}

	pub fn is_empty(&self) -> bool {
		self.width == 0 || self.height == 0
	}

	pub fn area(&self) -> u64 {
		self.width as u64 * self.height as u64
	}

	/// Intersects two regions, returning `None` when they do not overlap.
	pub fn intersect(&self, other: &PixelRegion) -> Option<PixelRegion> {
		let row = self.row.max(other.row);
		let col = self.col.max(other.col);
		let bottom = self.bottom().min(other.bottom());
		let right = self.right().min(other.right());
		if bottom <= row || right <= col {
			return None;
		}
		Some(PixelRegion::new(row, col, right - col, bottom - row))
	}

	/// True when `other` lies fully inside this region.
	pub fn contains(&self, other: &PixelRegion) -> bool {
		other.row >= self.row
			&& other.col >= self.col
			&& other.bottom() <= self.bottom()
			&& other.right() <= self.right()
	}

	/// True when the pixel `(row, col)` lies inside this region.
	pub fn contains_pixel(&self, row: u32, col: u32) -> bool {
		row >= self.row && row < self.bottom() && col >= self.col && col < self.right()
	}
}

impl fmt::Display for PixelRegion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"(({},{}),({}x{}))",
			self.row, self.col, self.width, self.height
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn intersect_overlapping_regions() {
		let a = PixelRegion::new(0, 0, 100, 100);
		let b = PixelRegion::new(50, 50, 100, 100);
		assert_eq!(a.intersect(&b), Some(PixelRegion::new(50, 50, 50, 50)));
	}

	#[test]
	fn intersect_disjoint_regions_is_none() {
		let a = PixelRegion::new(0, 0, 10, 10);
		let b = PixelRegion::new(20, 20, 10, 10);
		assert_eq!(a.intersect(&b), None);
		// Touching edges do not intersect either.
		let c = PixelRegion::new(0, 10, 10, 10);
		assert_eq!(a.intersect(&c), None);
	}

	#[test]
	fn contains_and_edges() {
		let outer = PixelRegion::new(0, 0, 100, 100);
		assert!(outer.contains(&PixelRegion::new(10, 10, 90, 90)));
		assert!(!outer.contains(&PixelRegion::new(10, 10, 91, 90)));
		assert!(outer.contains_pixel(99, 99));
		assert!(!outer.contains_pixel(100, 0));
	}

	#[test]
	fn from_message_rejects_degenerate_bounds() {
		assert!(PixelRegion::from_message(0, 0, 0, 10).is_err());
		assert!(PixelRegion::from_message(0, 0, 10, 0).is_err());
		assert!(PixelRegion::from_message(5, 7, 10, 10).is_ok());
	}
}
