//! Attachment object store.
//!
//! Files are stored under `{data_dir}/attachments/{public_id}` and served
//! back over `GET /files/{public_id}`. The store stands in for an external
//! object-storage service: uploads run under a hard timeout and expiry is
//! a fatal error, never retried. An upload is all-or-nothing — on failure,
//! files written so far are removed best-effort and nothing is reported
//! as stored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Error in uploading files: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload timed out")]
    Timeout,
}

/// One file received from a multipart request, ready to store.
#[derive(Debug)]
pub struct UploadFile {
    pub bytes: Vec<u8>,
}

/// A stored file: the id under which it lives and the URL clients fetch.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub public_id: String,
    pub url: String,
}

#[derive(Debug)]
pub struct AttachmentStore {
    root: PathBuf,
    public_base_url: String,
    upload_timeout: Duration,
}

impl AttachmentStore {
    pub fn new(data_dir: &str, public_base_url: String, upload_timeout: Duration) -> Self {
        Self {
            root: Path::new(data_dir).join("attachments"),
            public_base_url,
            upload_timeout,
        }
    }

    fn file_path(&self, public_id: &str) -> PathBuf {
        self.root.join(public_id)
    }

    fn url_for(&self, public_id: &str) -> String {
        format!("{}/files/{}", self.public_base_url, public_id)
    }

    /// Store a batch of files under fresh ids. The whole batch runs under
    /// the configured timeout; on expiry or I/O failure the already-written
    /// files are cleaned up and the error propagates to the caller.
    pub async fn upload(&self, files: Vec<UploadFile>) -> Result<Vec<StoredFile>, StorageError> {
        let ids: Vec<String> = files.iter().map(|_| Uuid::new_v4().to_string()).collect();

        let result = tokio::time::timeout(self.upload_timeout, self.write_all(&ids, files))
            .await
            .unwrap_or(Err(StorageError::Timeout));

        match result {
            Ok(stored) => Ok(stored),
            Err(err) => {
                self.delete(&ids).await;
                Err(err)
            }
        }
    }

    async fn write_all(
        &self,
        ids: &[String],
        files: Vec<UploadFile>,
    ) -> Result<Vec<StoredFile>, StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let mut stored = Vec::with_capacity(files.len());
        for (id, file) in ids.iter().zip(files) {
            tokio::fs::write(self.file_path(id), &file.bytes).await?;
            stored.push(StoredFile {
                public_id: id.clone(),
                url: self.url_for(id),
            });
        }
        Ok(stored)
    }

    /// Best-effort removal; missing files are fine.
    pub async fn delete(&self, public_ids: &[String]) {
        for id in public_ids {
            let _ = tokio::fs::remove_file(self.file_path(id)).await;
        }
    }

    /// Read a stored file's bytes, `None` when absent.
    pub async fn read(&self, public_id: &str) -> Option<Vec<u8>> {
        // Ids are UUIDs we generated; anything else never hits the filesystem.
        Uuid::parse_str(public_id).ok()?;
        tokio::fs::read(self.file_path(public_id)).await.ok()
    }
}

/// GET /files/{public_id} — raw bytes of a stored attachment.
pub async fn serve_file(
    State(state): State<AppState>,
    UrlPath(public_id): UrlPath<String>,
) -> Response {
    match state.storage.read(&public_id).await {
        Some(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
