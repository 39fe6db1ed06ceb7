use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};
use tokio::io::AsyncWriteExt;

/// Upload staged on local disk while it is handed to a storage collaborator.
///
/// The backing file is removed when the value is dropped, so every exit path of a
/// submission releases it.
#[derive(Debug)]
pub(crate) struct ScratchFile {
    path: TempPath,
    filename: String,
    content_type: String,
    size: u64,
    sha256: String,
}

/// Incremental writer used while a multipart field is streamed in.
pub(crate) struct ScratchWriter {
    file: tokio::fs::File,
    path: TempPath,
    hasher: Sha256,
    filename: String,
    content_type: String,
    size: u64,
    max_bytes: u64,
}

impl ScratchWriter {
    pub(crate) fn create(filename: &str, content_type: &str, max_bytes: u64) -> Result<Self> {
        let (file, path) = NamedTempFile::new()
            .context("Failed to create scratch file")?
            .into_parts();

        Ok(Self {
            file: tokio::fs::File::from_std(file),
            path,
            hasher: Sha256::new(),
            filename: sanitized_filename(filename),
            content_type: content_type.to_string(),
            size: 0,
            max_bytes,
        })
    }

    pub(crate) async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let next_size = self.size + chunk.len() as u64;
        if next_size > self.max_bytes {
            bail!("{} exceeds the {} byte limit", self.filename, self.max_bytes);
        }

        self.file.write_all(chunk).await.context("Failed to write scratch file")?;
        self.hasher.update(chunk);
        self.size = next_size;
        Ok(())
    }

    pub(crate) async fn finish(mut self) -> Result<ScratchFile> {
        self.file.flush().await.context("Failed to flush scratch file")?;
        if self.size == 0 {
            bail!("{} is empty", self.filename);
        }

        Ok(ScratchFile {
            path: self.path,
            filename: self.filename,
            content_type: self.content_type,
            size: self.size,
            sha256: hex::encode(self.hasher.finalize()),
        })
    }
}

impl ScratchFile {
    pub(crate) async fn from_bytes(filename: &str, content_type: &str, bytes: &[u8]) -> Result<Self> {
        let mut writer = ScratchWriter::create(filename, content_type, bytes.len() as u64)?;
        writer.write_chunk(bytes).await?;
        writer.finish().await
    }

    pub(crate) fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub(crate) fn filename(&self) -> &str {
        &self.filename
    }

    pub(crate) fn content_type(&self) -> &str {
        &self.content_type
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn sha256(&self) -> &str {
        &self.sha256
    }

    pub(crate) async fn read_bytes(&self) -> Result<Vec<u8>> {
        tokio::fs::read(self.path()).await.context("Failed to read scratch file")
    }
}

pub(crate) fn sanitized_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '_' || *c == '-')
        .collect();

    if sanitized.is_empty() {
        "upload".to_string()
    } else {
        sanitized
    }
}
