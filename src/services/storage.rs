use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use s3::creds::Credentials;
use s3::{Bucket, BucketConfiguration, Region};

/// Content store addressed by (bucket, key).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Create `bucket` unless it already exists.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Check that the store is reachable and `bucket` exists.
    async fn health_check(&self, bucket: &str) -> Result<(), StorageError>;
}

/// Client for S3-compatible object storage (MinIO, R2, ...).
pub struct S3BlobStore {
    region: Region,
    credentials: Credentials,
}

impl S3BlobStore {
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(bucket.with_path_style())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .bucket(bucket)?
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        check_status(bucket, key, response.status_code())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .bucket(bucket)?
            .get_object(key)
            .await
            .map_err(StorageError::S3)?;
        check_status(bucket, key, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        if self.bucket(bucket)?.exists().await.map_err(StorageError::S3)? {
            return Ok(());
        }
        let response = Bucket::create_with_path_style(
            bucket,
            self.region.clone(),
            self.credentials.clone(),
            BucketConfiguration::default(),
        )
        .await
        .map_err(StorageError::S3)?;
        // 409: created concurrently by another process.
        if response.success() || response.response_code == 409 {
            tracing::info!(bucket, "Bucket ready");
            Ok(())
        } else {
            Err(StorageError::Status {
                bucket: bucket.to_string(),
                key: String::new(),
                status: response.response_code,
            })
        }
    }

    async fn health_check(&self, bucket: &str) -> Result<(), StorageError> {
        if self.bucket(bucket)?.exists().await.map_err(StorageError::S3)? {
            Ok(())
        } else {
            Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: String::new(),
            })
        }
    }
}

fn check_status(bucket: &str, key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }),
        status => Err(StorageError::Status {
            bucket: bucket.to_string(),
            key: key.to_string(),
            status,
        }),
    }
}

/// Blob store kept in process memory. Buckets must be ensured before use,
/// mirroring S3. Writers to different buckets never contend.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    buckets: DashMap<String, HashMap<String, StoredBlob>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub content_type: String,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredBlob> {
        self.buckets
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.get(bucket).map_or(0, |objects| objects.len())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let mut objects = self.buckets.get_mut(bucket).ok_or_else(|| StorageError::NotFound {
            bucket: bucket.to_string(),
            key: String::new(),
        })?;
        objects.insert(
            key.to_string(),
            StoredBlob {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.object(bucket, key)
            .map(|blob| blob.data)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        self.buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn health_check(&self, bucket: &str) -> Result<(), StorageError> {
        if self.buckets.contains_key(bucket) {
            Ok(())
        } else {
            Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: String::new(),
            })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("Storage returned HTTP {status} for {bucket}/{key}")]
    Status {
        bucket: String,
        key: String,
        status: u16,
    },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
