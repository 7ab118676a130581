//! Object-store sink: one GeoJSON file per completed image.

use super::{Sink, SinkContext, SinkMode};
use anyhow::{Context, Result};
use async_trait::async_trait;
use skysift_core::feature::{feature_collection_json, ImageFeature};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

/// Multipart settings for large bodies.
#[derive(Clone, Copy, Debug)]
pub struct UploadConfig {
	pub multipart_threshold: usize,
	pub multipart_chunk_size: usize,
}

impl Default for UploadConfig {
	fn default() -> Self {
		UploadConfig {
			multipart_threshold: 64 * 1024 * 1024,
			multipart_chunk_size: 128 * 1024 * 1024,
		}
	}
}

/// Object-store contract. The real backing service is external; the upload
/// configuration is part of the contract so implementations chunk large
/// bodies the same way.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync + Debug {
	/// Whether the bucket exists and is writable for this client.
	async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

	async fn put_object(
		&self,
		bucket: &str,
		key: &str,
		body: Vec<u8>,
		upload: &UploadConfig,
	) -> Result<()>;
}

/// Filesystem-backed reference client: buckets are directories.
#[derive(Clone, Debug)]
pub struct FsObjectStoreClient {
	root: PathBuf,
}

impl FsObjectStoreClient {
	pub fn new(root: PathBuf) -> Self {
		FsObjectStoreClient { root }
	}

	pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
		self.root.join(bucket).join(key)
	}
}

#[async_trait]
impl ObjectStoreClient for FsObjectStoreClient {
	async fn bucket_exists(&self, _bucket: &str) -> Result<bool> {
		Ok(true)
	}

	async fn put_object(
		&self,
		bucket: &str,
		key: &str,
		body: Vec<u8>,
		_upload: &UploadConfig,
	) -> Result<()> {
		let path = self.object_path(bucket, key);
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(&path, body)
			.await
			.with_context(|| format!("unable to write object {}", path.display()))?;
		Ok(())
	}
}

/// Writes the aggregate feature collection as a single GeoJSON object.
#[derive(Debug)]
pub struct ObjectStoreSink {
	client: Arc<dyn ObjectStoreClient>,
	bucket: String,
	prefix: String,
	#[allow(dead_code)]
	credentials: Option<String>,
	upload: UploadConfig,
}

impl ObjectStoreSink {
	pub fn new(
		client: Arc<dyn ObjectStoreClient>,
		bucket: &str,
		prefix: &str,
		credentials: Option<&str>,
	) -> Self {
		ObjectStoreSink {
			client,
			bucket: bucket.to_string(),
			prefix: prefix.to_string(),
			credentials: credentials.map(str::to_string),
			upload: UploadConfig::default(),
		}
	}

	/// The image id ends in the original image location; the object key is
	/// based on that file name.
	fn object_key(&self, image_id: &str) -> String {
		let basename = image_id.rsplit('/').next().unwrap_or(image_id);
		format!("{}/{}.geojson", self.prefix.trim_end_matches('/'), basename)
	}
}

#[async_trait]
impl Sink for ObjectStoreSink {
	fn name(&self) -> &'static str {
		"S3"
	}

	fn mode(&self) -> SinkMode {
		SinkMode::Aggregate
	}

	async fn write(&self, context: &SinkContext, features: &[ImageFeature]) -> Result<bool> {
		if !self.client.bucket_exists(&self.bucket).await? {
			log::error!("cannot read/write bucket {}", self.bucket);
			return Ok(false);
		}

		let key = self.object_key(&context.image_id);
		let body = serde_json::to_vec(&feature_collection_json(features))?;
		self
			.client
			.put_object(&self.bucket, &key, body, &self.upload)
			.await?;
		log::info!(
			"wrote aggregate feature collection for image '{}' to {}/{key}",
			context.image_id,
			self.bucket
		);
		Ok(true)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn writes_geojson_under_prefix_and_basename() {
		let dir = tempfile::tempdir().unwrap();
		let client = FsObjectStoreClient::new(dir.path().to_path_buf());
		let sink = ObjectStoreSink::new(Arc::new(client.clone()), "results", "jobs/job-1", None);

		let mut feature = ImageFeature::new();
		feature.set_property("p", json!(1));
		let context = SinkContext {
			job_id: "job-1".into(),
			image_id: "job-1:s3://imagery/scene.ntf".into(),
		};
		assert!(sink.write(&context, &[feature]).await.unwrap());

		let path = client.object_path("results", "jobs/job-1/scene.ntf.geojson");
		let written: serde_json::Value =
			serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
		assert_eq!(written["type"], "FeatureCollection");
		assert_eq!(written["features"].as_array().unwrap().len(), 1);
	}
}
