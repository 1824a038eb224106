use crate::error::StoreError;
use crate::{EntryStream, ObjectEntry, UploadMode};
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use secstor_core::S3Store;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const PART_SIZE: usize = 16 * 1024 * 1024;

pub fn client(config: &S3Store) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(&config.bucket)
        .with_access_key_id(&config.access_key)
        .with_secret_access_key(&config.secret_key)
        .with_allow_http(!config.https);

    if let Some(region) = &config.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &config.endpoint {
        let endpoint = if endpoint.contains("://") {
            endpoint.clone()
        } else {
            let scheme = if config.https { "https" } else { "http" };
            format!("{}://{}", scheme, endpoint)
        };
        builder = builder.with_endpoint(endpoint);
    }

    let store = builder
        .build()
        .map_err(|e| StoreError::Configuration(format!("bucket {}: {}", config.bucket, e)))?;
    Ok(Arc::new(store))
}

pub struct S3Backend {
    config: S3Store,
    client: Arc<dyn ObjectStore>,
}

impl S3Backend {
    pub fn new(config: S3Store, client: Arc<dyn ObjectStore>) -> Self {
        Self { config, client }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub async fn fetch(&self, key: &str, local_dir: &Path) -> Result<PathBuf, StoreError> {
        let location = ObjectPath::from(key);
        let name = location
            .filename()
            .ok_or_else(|| StoreError::Configuration(format!("{} names no object", key)))?
            .to_string();

        let result = self.client.get(&location).await?;

        fs::create_dir_all(local_dir).await?;
        let dest = local_dir.join(&name);
        let mut file = fs::File::create(&dest).await?;
        let mut body = result.into_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        tracing::debug!("Downloaded s3://{}/{} to {:?}", self.config.bucket, key, dest);
        Ok(dest)
    }

    pub async fn store(&self, local_file: &Path, key: &str) -> Result<UploadMode, StoreError> {
        let size = fs::metadata(local_file).await?.len();
        let location = ObjectPath::from(key);

        if self.config.single_upload(size) {
            tracing::info!(
                bucket = %self.config.bucket,
                key,
                size,
                "Uploading in a single request"
            );
            let bytes = fs::read(local_file).await?;
            self.client.put(&location, PutPayload::from(bytes)).await?;
            return Ok(UploadMode::Single);
        }

        tracing::info!(
            bucket = %self.config.bucket,
            key,
            size,
            "Uploading in multiple parts"
        );
        let mut upload = self.client.put_multipart(&location).await?;
        let mut file = fs::File::open(local_file).await?;
        let result = async {
            loop {
                let mut part = Vec::with_capacity(PART_SIZE);
                let read = (&mut file).take(PART_SIZE as u64).read_to_end(&mut part).await?;
                if read == 0 {
                    break;
                }
                upload.put_part(PutPayload::from(part)).await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;

        match result {
            Ok(()) => {
                upload.complete().await?;
                Ok(UploadMode::Multipart)
            }
            Err(e) => {
                if let Err(abort) = upload.abort().await {
                    tracing::warn!("Failed to abort multipart upload of {}: {}", key, abort);
                }
                Err(e)
            }
        }
    }

    pub async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.client.delete(&ObjectPath::from(key)).await?;
        Ok(())
    }

    /// Deletes the object named by the prefix and every object under it,
    /// returning how many went.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let location = ObjectPath::from(prefix);
        let mut keys: Vec<ObjectPath> = self
            .client
            .list(Some(&location))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;

        match self.client.head(&location).await {
            Ok(meta) if !keys.contains(&meta.location) => keys.push(meta.location),
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        for key in &keys {
            self.client.delete(key).await?;
        }
        tracing::debug!(
            "Deleted {} objects under s3://{}/{}",
            keys.len(),
            self.config.bucket,
            prefix
        );
        Ok(keys.len())
    }

    pub fn list(&self, prefix: &str) -> EntryStream<'_> {
        let prefix = ObjectPath::from(prefix);
        Box::pin(
            self.client
                .list(Some(&prefix))
                .map_ok(|meta| ObjectEntry {
                    key: meta.location.to_string(),
                    size: Some(meta.size as u64),
                })
                .map_err(StoreError::from),
        )
    }
}

/// Template unique name or volume id of an object key: the segment before
/// the file name.
pub fn parent_segment(key: &str) -> Option<&str> {
    let (dir, _) = key.rsplit_once('/')?;
    Some(dir.rsplit_once('/').map_or(dir, |(_, last)| last))
}
