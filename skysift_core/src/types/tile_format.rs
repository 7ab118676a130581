//! Tile encoding formats and compressions accepted by image requests.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// File format used for encoded tiles sent to a model endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TileFormat {
	Nitf,
	Gtiff,
	Png,
	Jpeg,
}

impl TileFormat {
	pub fn parse(value: &str) -> Result<Self> {
		Ok(match value {
			"NITF" => TileFormat::Nitf,
			"GTIFF" => TileFormat::Gtiff,
			"PNG" => TileFormat::Png,
			"JPEG" => TileFormat::Jpeg,
			_ => bail!("unsupported tile format '{value}'"),
		})
	}

	/// Filename extension used for temporary tile files.
	pub fn extension(&self) -> &'static str {
		match self {
			TileFormat::Nitf => "ntf",
			TileFormat::Gtiff => "tif",
			TileFormat::Png => "png",
			TileFormat::Jpeg => "jpg",
		}
	}
}

impl Default for TileFormat {
	fn default() -> Self {
		TileFormat::Nitf
	}
}

impl fmt::Display for TileFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			TileFormat::Nitf => "NITF",
			TileFormat::Gtiff => "GTIFF",
			TileFormat::Png => "PNG",
			TileFormat::Jpeg => "JPEG",
		})
	}
}

/// Compression applied to encoded tiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TileCompression {
	None,
	Jpeg,
	J2k,
	Lzw,
}

impl TileCompression {
	pub fn parse(value: &str) -> Result<Self> {
		Ok(match value {
			"NONE" => TileCompression::None,
			"JPEG" => TileCompression::Jpeg,
			"J2K" => TileCompression::J2k,
			"LZW" => TileCompression::Lzw,
			_ => bail!("unsupported tile compression '{value}'"),
		})
	}
}

impl Default for TileCompression {
	fn default() -> Self {
		TileCompression::None
	}
}

impl fmt::Display for TileCompression {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			TileCompression::None => "NONE",
			TileCompression::Jpeg => "JPEG",
			TileCompression::J2k => "J2K",
			TileCompression::Lzw => "LZW",
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case("NITF", TileFormat::Nitf, "ntf")]
	#[case("GTIFF", TileFormat::Gtiff, "tif")]
	#[case("PNG", TileFormat::Png, "png")]
	#[case("JPEG", TileFormat::Jpeg, "jpg")]
	fn format_roundtrip(#[case] name: &str, #[case] format: TileFormat, #[case] ext: &str) {
		assert_eq!(TileFormat::parse(name).unwrap(), format);
		assert_eq!(format.to_string(), name);
		assert_eq!(format.extension(), ext);
	}

	#[test]
	fn unknown_values_are_rejected() {
		assert!(TileFormat::parse("BMP").is_err());
		assert!(TileCompression::parse("ZIP").is_err());
	}
}
