use serde::{Deserialize, Serialize};
use std::env;

/// S3-compatible object store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bucket = env::var("S3_BUCKET").unwrap_or_else(|_| "bulkport-imports".to_string());
        if bucket.is_empty() {
            anyhow::bail!("S3_BUCKET cannot be empty");
        }

        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok().filter(|e| !e.is_empty()),
            region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket,
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "imports");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.bucket, "imports");
        assert!(config.path_style);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("S3_BUCKET", "tenant-uploads");
        std::env::set_var("S3_PATH_STYLE", "true");
        std::env::set_var("S3_ENDPOINT", "");

        let config = StorageConfig::from_env().unwrap();

        std::env::remove_var("S3_BUCKET");
        std::env::remove_var("S3_PATH_STYLE");
        std::env::remove_var("S3_ENDPOINT");

        assert_eq!(config.bucket, "tenant-uploads");
        assert!(config.path_style);
        assert_eq!(config.endpoint, None);
    }
}
