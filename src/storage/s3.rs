// envbackup/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{ObjectLocation, ObjectStore};
use crate::config::S3Config;
use crate::errors::{AppError, Result};

/// Object store backed by S3 or an S3-compatible service (DigitalOcean Spaces, MinIO).
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: s3::Client,
}

impl S3ObjectStore {
    /// Builds one client for the lifetime of the process; the SDK client is
    /// cheap to clone and safe to use from concurrent tasks.
    pub async fn connect(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id, secret, None, // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        let mut s3_config = s3::config::Builder::from(&sdk_config);
        if config.endpoint_url.is_some() {
            // S3-compatible services generally want path-style addressing
            s3_config = s3_config.force_path_style(true);
        }
        Self {
            client: s3::Client::from_conf(s3_config.build()),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_file(&self, location: &ObjectLocation, source: &Path) -> Result<u64> {
        debug!(source = %source.display(), dest = %location, "Uploading object");
        let size = tokio::fs::metadata(source).await?.len();
        let body = ByteStream::from_path(source).await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to create ByteStream from file {}: {}",
                source.display(),
                e
            ))
        })?;

        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "Failed to upload {} to {}: {}",
                    source.display(),
                    location,
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;

        Ok(size)
    }

    async fn get_file(&self, location: &ObjectLocation, dest: &Path) -> Result<u64> {
        debug!(source = %location, dest = %dest.display(), "Downloading object");
        if let Some(parent_dir) = dest.parent() {
            tokio::fs::create_dir_all(parent_dir).await?;
        }

        let mut object = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "Failed to get object {}: {}",
                    location,
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;

        let mut output_file = File::create(dest).await?;
        let mut total_bytes_downloaded = 0u64;
        while let Some(bytes_chunk) = object.body.try_next().await.map_err(|e| {
            AppError::Storage(format!("Failed to read body of {}: {}", location, e))
        })? {
            output_file.write_all(&bytes_chunk).await?;
            total_bytes_downloaded += bytes_chunk.len() as u64;
        }
        output_file.flush().await?;
        output_file.sync_all().await?;

        Ok(total_bytes_downloaded)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| {
                    AppError::Storage(format!(
                        "Failed to list s3://{}/{}: {}",
                        bucket,
                        prefix,
                        s3::error::DisplayErrorContext(&e)
                    ))
                })?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(bucket, prefix, count = keys.len(), "Listed objects");
        Ok(keys)
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<()> {
        debug!(object = %location, "Deleting object");
        self.client
            .delete_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "Failed to delete {}: {}",
                    location,
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn probe(&self, bucket: &str) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "Bucket {} is not accessible: {}",
                    bucket,
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;
        info!(bucket, "✓ Bucket is accessible");
        Ok(())
    }
}
