use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::core::config::Settings;
use crate::services::ports::{DocumentStore, StoredDocument};
use crate::services::scratch::ScratchFile;

#[derive(Debug, Deserialize)]
struct UploadedFile {
    url: String,
    view_link: Option<String>,
}

/// REST document service: `POST {base}/files` and `DELETE {base}/files?id=`.
///
/// The service stores each file under the id sent with it, so a delete for that id
/// works whether or not the upload response ever arrived.
#[derive(Debug, Clone)]
pub(crate) struct HttpDocumentStore {
    client: Client,
    base_url: String,
    api_token: String,
    root_folder: String,
}

impl HttpDocumentStore {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        let documents = settings.documents();
        if documents.base_url.is_empty() {
            return Ok(None);
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(settings.assessment().upload_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Some(Self {
            client,
            base_url: documents.base_url.trim_end_matches('/').to_string(),
            api_token: documents.api_token.clone(),
            root_folder: documents.root_folder.trim_matches('/').to_string(),
        }))
    }

    fn remote_id(&self, object_id: &str) -> String {
        let id = object_id.trim_matches('/');
        match (self.root_folder.is_empty(), id.is_empty()) {
            (true, _) => id.to_string(),
            (false, true) => self.root_folder.clone(),
            (false, false) => format!("{}/{}", self.root_folder, id),
        }
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn upload(&self, file: &ScratchFile, object_id: &str) -> Result<StoredDocument> {
        let bytes = file.read_bytes().await?;
        let part = Part::bytes(bytes)
            .file_name(file.filename().to_string())
            .mime_str(file.content_type())
            .context("Invalid document content type")?;
        let form = Form::new()
            .text("id", self.remote_id(object_id))
            .text("sha256", file.sha256().to_string())
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&self.api_token)
            .multipart(form)
            .send()
            .await
            .context("Failed to reach document store")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Document store rejected upload ({status}): {body}"));
        }

        let uploaded: UploadedFile =
            response.json().await.context("Failed to parse document store response")?;
        tracing::info!(document_id = object_id, size = file.size(), "Document uploaded");

        let view_link = uploaded.view_link.unwrap_or_else(|| uploaded.url.clone());
        Ok(StoredDocument { id: object_id.to_string(), url: uploaded.url, view_link })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/files", self.base_url))
            .query(&[("id", self.remote_id(id))])
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to reach document store")?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // Already gone counts as deleted.
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(anyhow!("Document store refused to delete {id} ({status})")),
        }
    }
}
