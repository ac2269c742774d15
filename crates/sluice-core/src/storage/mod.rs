//! object_store backed storage.
//!
//! One provider type covers local directories, the in-memory store used by tests and
//! single-process deployments, and S3.

mod url;

pub use url::BackendConfig;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::emit;
use crate::error::{IoSnafu, ObjectStoreSnafu, S3ConfigSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over the supported backends.
#[derive(Clone)]
pub struct StorageProvider {
    config: BackendConfig,
    object_store: Arc<dyn ObjectStore>,
    canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

fn status_of<T, E>(result: &Result<T, E>) -> RequestStatus {
    if result.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        Self::for_url_with_options(url, HashMap::new()).await
    }

    /// Create a storage provider for the given URL with backend options.
    ///
    /// Options are only consulted for S3, where keys follow `AmazonS3ConfigKey` names
    /// such as `aws_region` or `aws_endpoint`.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let config = BackendConfig::parse_url(url)?;

        let object_store: Arc<dyn ObjectStore> = match &config {
            BackendConfig::Local { path } => {
                tokio::fs::create_dir_all(path).await.context(IoSnafu)?;
                Arc::new(LocalFileSystem::new_with_prefix(path).context(ObjectStoreSnafu)?)
            }
            BackendConfig::Memory { .. } => Arc::new(InMemory::new()),
            BackendConfig::S3 { bucket, .. } => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                for (key, value) in &options {
                    let key: AmazonS3ConfigKey = key.parse().context(S3ConfigSnafu)?;
                    builder = builder.with_config(key, value);
                }
                Arc::new(builder.build().context(S3ConfigSnafu)?)
            }
        };

        Ok(Self {
            config,
            object_store,
            canonical_url: url.to_string(),
        })
    }

    /// Wrap an existing object store, mainly for sharing one `InMemory` between components.
    pub fn from_object_store(object_store: Arc<dyn ObjectStore>, url: &str) -> Self {
        Self {
            config: BackendConfig::Memory { key: None },
            object_store,
            canonical_url: url.to_string(),
        }
    }

    /// The URL this provider was built from.
    pub fn url(&self) -> &str {
        &self.canonical_url
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: status_of(&result),
            duration: start.elapsed(),
        });

        result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)
    }

    /// Put bytes to a path.
    pub async fn put(&self, path: &Path, bytes: impl Into<Bytes>) -> Result<(), StorageError> {
        self.put_payload(path, PutPayload::from(bytes.into())).await
    }

    /// Put a payload to a path.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put(&path, payload).await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: status_of(&result),
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// List every object under `prefix`, returned relative to the configured key prefix.
    pub async fn list(&self, prefix: Option<&Path>) -> Result<Vec<Path>, StorageError> {
        let full_prefix: Option<Path> = match (self.config.key(), prefix) {
            (Some(key), Some(prefix)) => Some(key.parts().chain(prefix.parts()).collect()),
            (Some(key), None) => Some(key.clone()),
            (None, prefix) => prefix.cloned(),
        };
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let start = Instant::now();
        let result: Result<Vec<Path>, object_store::Error> = self
            .object_store
            .list(full_prefix.as_ref())
            .map_ok(|meta| meta.location.parts().skip(key_part_count).collect())
            .try_collect()
            .await;

        emit!(StorageRequest {
            operation: StorageOperation::List,
            status: status_of(&result),
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)
    }

    /// Delete a file at the given path.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.delete(&path).await;

        emit!(StorageRequest {
            operation: StorageOperation::Delete,
            status: status_of(&result),
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }
}
