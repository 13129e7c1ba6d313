use crate::blob_store::{BlobStore, BucketStatus, ObjectChunks, ObjectSummary, StoreError};
use crate::config::StorageConfig;
use crate::paging::Page;
use async_trait::async_trait;
use aws_config::profile::ProfileFileCredentialsProvider;
use aws_config::BehaviorVersion;
use aws_runtime::env_config::file::{EnvConfigFileKind, EnvConfigFiles};
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Blob store backed by an S3-compatible service
pub struct S3BlobStore {
    client: S3Client,
    region: String,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3BlobStore {
    /// Create a new S3 blob store.
    ///
    /// When `credentials_file` is given it is read as an AWS shared-credentials
    /// file and its default profile is used instead of the ambient provider chain.
    pub async fn new(config: &StorageConfig, credentials_file: Option<&Path>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let Some(path) = credentials_file {
            let files = EnvConfigFiles::builder()
                .with_file(EnvConfigFileKind::Credentials, path)
                .build();
            let provider = ProfileFileCredentialsProvider::builder()
                .profile_files(files)
                .build();
            loader = loader.credentials_provider(provider);
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for GCS interoperability or MinIO
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = config.endpoint_url.as_deref().unwrap_or("default"),
            "S3 blob store initialized"
        );

        Self {
            client,
            region: config.region.clone(),
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: config.part_size_bytes,
        }
    }

    fn uses_multipart(&self, len: usize) -> bool {
        len > self.multipart_threshold_bytes
    }

    /// Single-part upload for small objects
    async fn simple_upload(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/gzip")
            .send()
            .await
            .map_err(|e| StoreError::Put {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }

    /// Multipart upload for large objects; aborted on any failure
    async fn multipart_upload(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        let put_error = |message: String| StoreError::Put {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };

        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type("application/gzip")
            .send()
            .await
            .map_err(|e| put_error(DisplayErrorContext(&e).to_string()))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| put_error("no upload id in response".to_string()))?
            .to_string();

        match self.upload_parts(bucket, key, &upload_id, body).await {
            Ok(()) => Ok(()),
            Err(message) => {
                warn!(bucket = %bucket, key = %key, error = %message, "Aborting multipart upload");
                if let Err(e) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        bucket = %bucket,
                        key = %key,
                        error = %DisplayErrorContext(&e),
                        "Failed to abort multipart upload"
                    );
                }
                Err(put_error(message))
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        body: Bytes,
    ) -> Result<(), String> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in split_parts(&body, self.part_size_bytes).into_iter().enumerate() {
            let part_number = (index + 1) as i32;
            let response = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| format!("part {part_number}: {}", DisplayErrorContext(&e)))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        debug!(key = %key, parts = completed_parts.len(), "Completing multipart upload");

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| DisplayErrorContext(&e).to_string())?;

        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self))]
    async fn create_bucket(&self, bucket: &str) -> Result<BucketStatus, StoreError> {
        let mut request = self.client.create_bucket().bucket(bucket);

        // us-east-1 is the implicit location and must not be sent as a constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(BucketStatus::Created),
            Err(e)
                if e.as_service_error()
                    .map(|e| e.is_bucket_already_owned_by_you())
                    .unwrap_or(false) =>
            {
                Ok(BucketStatus::AlreadyOwned)
            }
            Err(e) => Err(StoreError::CreateBucket {
                bucket: bucket.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }

    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        if self.uses_multipart(body.len()) {
            self.multipart_upload(bucket, key, body).await
        } else {
            self.simple_upload(bucket, key, body).await
        }
    }

    #[instrument(skip(self))]
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| get_error(bucket, key, e))?;

        let body = response.body.collect().await.map_err(|e| StoreError::Get {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })?;

        Ok(body.into_bytes())
    }

    #[instrument(skip(self))]
    async fn stream_object(&self, bucket: &str, key: &str) -> Result<ObjectChunks, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| get_error(bucket, key, e))?;

        let (bucket, key) = (bucket.to_string(), key.to_string());
        let chunks = stream::try_unfold(response.body, move |mut body| {
            let (bucket, key) = (bucket.clone(), key.clone());
            async move {
                let chunk = body.try_next().await.map_err(|e| StoreError::Get {
                    bucket,
                    key,
                    message: e.to_string(),
                })?;
                Ok(chunk.map(|chunk| (chunk, body)))
            }
        });

        Ok(chunks.boxed())
    }

    async fn list_objects_page(
        &self,
        bucket: &str,
        page_token: Option<String>,
    ) -> Result<Page<ObjectSummary>, StoreError> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(page_token)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_bucket())
                    .unwrap_or(false)
                {
                    StoreError::NoSuchBucket(bucket.to_string())
                } else {
                    StoreError::List {
                        bucket: bucket.to_string(),
                        message: DisplayErrorContext(&e).to_string(),
                    }
                }
            })?;

        let items = response
            .contents()
            .iter()
            .filter_map(|object| {
                object.key().map(|key| ObjectSummary {
                    name: key.to_string(),
                    size: object.size().and_then(|size| u64::try_from(size).ok()),
                })
            })
            .collect();

        Ok(Page {
            items,
            next_page_token: response.next_continuation_token().map(String::from),
        })
    }
}

fn get_error(bucket: &str, key: &str, e: SdkError<GetObjectError>) -> StoreError {
    if e.as_service_error()
        .map(|e| e.is_no_such_key())
        .unwrap_or(false)
    {
        return StoreError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
    }
    StoreError::Get {
        bucket: bucket.to_string(),
        key: key.to_string(),
        message: DisplayErrorContext(&e).to_string(),
    }
}

/// Split `body` into parts of at most `part_size` bytes without copying
fn split_parts(body: &Bytes, part_size: usize) -> Vec<Bytes> {
    let part_size = part_size.max(1);
    (0..body.len())
        .step_by(part_size)
        .map(|start| body.slice(start..(start + part_size).min(body.len())))
        .collect()
}
