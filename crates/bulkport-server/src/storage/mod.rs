//! Object storage
//!
//! [`ObjectStore`] is the seam the engine reads uploaded files through and writes
//! extracted archive members to. [`Storage`] backs it with an S3-compatible bucket;
//! [`memory::MemoryObjectStore`] keeps objects in a map for tests and local runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument};

use crate::error::{ImportError, ImportResult};

pub mod config;
pub mod memory;

/// Streamed object body. Dropping it closes the underlying transfer.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub key: String,
    pub checksum: String,
    pub size: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket the store reads from and writes to
    fn bucket(&self) -> &str;

    async fn put(&self, key: &str, data: Vec<u8>, content_type: Option<&str>) -> ImportResult<UploadResult>;

    /// Whole object in memory
    async fn get(&self, key: &str) -> ImportResult<Vec<u8>>;

    /// Streamed object body
    async fn open_read(&self, key: &str) -> ImportResult<ObjectReader>;
}

fn store_error(err: anyhow::Error) -> ImportError {
    ImportError::ObjectStore(format!("{err:#}"))
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing storage");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "bulkport-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    #[instrument(skip(self, data))]
    pub async fn upload(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<UploadResult> {
        let checksum = calculate_sha256(&data);
        let size = data.len() as i64;

        debug!("Uploading {} bytes to s3://{}/{}", size, self.bucket, key);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request.send().await.context("Failed to upload to S3")?;

        info!("Uploaded s3://{}/{}", self.bucket, key);

        Ok(UploadResult {
            key: key.to_string(),
            checksum,
            size,
        })
    }

    #[instrument(skip(self))]
    pub async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let data = self
            .download_stream(key)
            .await?
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);

        Ok(data)
    }

    #[instrument(skip(self))]
    pub async fn download_stream(&self, key: &str) -> Result<ByteStream> {
        debug!("Getting stream from s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to get object from S3: {}", key))?;

        Ok(response.body)
    }
}

#[async_trait]
impl ObjectStore for Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: Option<&str>) -> ImportResult<UploadResult> {
        self.upload(key, data, content_type).await.map_err(store_error)
    }

    async fn get(&self, key: &str) -> ImportResult<Vec<u8>> {
        self.download(key).await.map_err(store_error)
    }

    async fn open_read(&self, key: &str) -> ImportResult<ObjectReader> {
        let stream = self.download_stream(key).await.map_err(store_error)?;
        Ok(Box::new(stream.into_async_read()))
    }
}

/// Hex-encoded SHA-256 of `data`
pub fn calculate_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
