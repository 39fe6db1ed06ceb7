use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::core::config::Settings;
use crate::services::ports::{DocumentStore, StoredDocument, StoredVideo, VideoStore};
use crate::services::scratch::ScratchFile;

/// Video uploads kept in S3-compatible object storage.
#[derive(Debug, Clone)]
pub(crate) struct S3VideoStore {
    client: Client,
    bucket: String,
    endpoint: String,
}

impl S3VideoStore {
    pub(crate) async fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        if settings.s3().access_key.is_empty() || settings.s3().secret_key.is_empty() {
            return Ok(None);
        }

        let creds = Credentials::new(
            settings.s3().access_key.clone(),
            settings.s3().secret_key.clone(),
            None,
            None,
            "linguacheck-static",
        );

        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(settings.s3().endpoint.clone())
            .region(aws_config::Region::new(settings.s3().region.clone()))
            .credentials_provider(creds)
            .load()
            .await;

        Ok(Some(Self {
            client: Client::new(&config),
            bucket: settings.s3().bucket.clone(),
            endpoint: settings.s3().endpoint.trim_end_matches('/').to_string(),
        }))
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

#[async_trait]
impl VideoStore for S3VideoStore {
    async fn upload(&self, file: &ScratchFile, object_id: &str) -> anyhow::Result<StoredVideo> {
        let key = object_id.to_string();
        let body = ByteStream::from_path(file.path())
            .await
            .context("Failed to open scratch file for upload")?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(file.content_type())
            .content_length(file.size() as i64)
            .metadata("sha256", file.sha256())
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload video object {key}"))?;

        tracing::info!(key = %key, size = file.size(), "Video uploaded");
        let url = self.object_url(&key);
        Ok(StoredVideo { id: key, url })
    }

    /// S3 treats deleting a missing key as success.
    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(id)
            .send()
            .await
            .with_context(|| format!("Failed to delete video object {id}"))?;
        Ok(())
    }
}

/// Stand-in for a storage backend that has no credentials configured. Every
/// upload fails, which the saga reports as a failed step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UnconfiguredStore {
    pub(crate) name: &'static str,
}

#[async_trait]
impl VideoStore for UnconfiguredStore {
    async fn upload(&self, _file: &ScratchFile, _object_id: &str) -> anyhow::Result<StoredVideo> {
        anyhow::bail!("{} is not configured", self.name)
    }

    async fn delete(&self, _id: &str) -> anyhow::Result<()> {
        anyhow::bail!("{} is not configured", self.name)
    }
}

#[async_trait]
impl DocumentStore for UnconfiguredStore {
    async fn upload(&self, _file: &ScratchFile, _object_id: &str) -> anyhow::Result<StoredDocument> {
        anyhow::bail!("{} is not configured", self.name)
    }

    async fn delete(&self, _id: &str) -> anyhow::Result<()> {
        anyhow::bail!("{} is not configured", self.name)
    }
}
