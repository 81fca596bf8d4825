//! Blob storage for compressed images and QR codes.

use std::sync::Arc;

use async_trait::async_trait;
use rearch::CapsuleHandle;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;
use tracing::{error, info, instrument};
use url::Url;

use crate::config::settings_capsule;

pub fn object_store_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn ObjectStore> {
    let settings = get.as_ref(settings_capsule);
    Arc::new(SupabaseStorage::new(
        reqwest::Client::new(),
        settings.supabase_url.clone(),
        settings.supabase_key.clone(),
        settings.storage_bucket.clone(),
    ))
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object path {0:?}")]
    InvalidPath(String),
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upload rejected with status {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `data` at `path`, replacing anything already there, and returns its public URL.
    async fn upload_file(
        &self,
        path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

/// Supabase Storage REST client for a single public bucket.
pub struct SupabaseStorage {
    client: reqwest::Client,
    base_url: Url,
    key: String,
    bucket: String,
}

impl SupabaseStorage {
    #[must_use]
    pub const fn new(client: reqwest::Client, base_url: Url, key: String, bucket: String) -> Self {
        Self {
            client,
            base_url,
            key,
            bucket,
        }
    }

    fn endpoint(&self, prefix: &str, path: &str) -> Result<Url, StorageError> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
            return Err(StorageError::InvalidPath(path.to_owned()));
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/storage/v1/object/{prefix}{}/{path}", self.bucket))
            .map_err(|_| StorageError::InvalidPath(path.to_owned()))
    }

    fn upload_url(&self, path: &str) -> Result<Url, StorageError> {
        self.endpoint("", path)
    }

    /// URL anyone can fetch the object from once uploaded.
    ///
    /// # Errors
    /// Will return [`Err`] if `path` is empty, absolute, or climbs out of the bucket.
    pub fn public_url(&self, path: &str) -> Result<Url, StorageError> {
        self.endpoint("public/", path)
    }
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    #[instrument(skip(self, data), fields(bucket = %self.bucket, len = data.len()))]
    async fn upload_file(
        &self,
        path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let upload_url = self.upload_url(path)?;
        let public_url = self.public_url(path)?;

        let response = self
            .client
            .post(upload_url)
            .header(AUTHORIZATION, format!("Bearer {}", self.key))
            .header("apikey", &self.key)
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(data)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, "Object store rejected upload");
            return Err(StorageError::Rejected { status, body });
        }

        info!(%public_url, "Uploaded object");
        Ok(public_url.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn storage() -> SupabaseStorage {
        SupabaseStorage::new(
            reqwest::Client::new(),
            Url::parse("https://proj.supabase.co/").unwrap(),
            "secret".to_owned(),
            "luugon-files".to_owned(),
        )
    }

    #[test]
    fn test_public_url() {
        assert_eq!(
            storage().public_url("qr/abc123.png").unwrap().as_str(),
            "https://proj.supabase.co/storage/v1/object/public/luugon-files/qr/abc123.png"
        );
    }

    #[test]
    fn test_upload_url() {
        assert_eq!(
            storage().upload_url("images/abc123.jpg").unwrap().as_str(),
            "https://proj.supabase.co/storage/v1/object/luugon-files/images/abc123.jpg"
        );
    }

    fn storage_at(server: &mockito::Server) -> SupabaseStorage {
        SupabaseStorage::new(
            reqwest::Client::new(),
            Url::parse(&server.url()).unwrap(),
            "secret".to_owned(),
            "luugon-files".to_owned(),
        )
    }

    #[tokio::test]
    async fn test_upload_file_sends_upsert_and_returns_public_url() {
        let mut server = mockito::Server::new_async().await;
        let upload = server
            .mock("POST", "/storage/v1/object/luugon-files/images/abc123.jpg")
            .match_header("authorization", "Bearer secret")
            .match_header("apikey", "secret")
            .match_header("content-type", "image/jpeg")
            .match_header("x-upsert", "true")
            .match_body(vec![0xFF, 0xD8, 0xFF])
            .with_status(200)
            .with_body(r#"{"Key":"luugon-files/images/abc123.jpg"}"#)
            .create_async()
            .await;

        let public_url = storage_at(&server)
            .upload_file("images/abc123.jpg", vec![0xFF, 0xD8, 0xFF], "image/jpeg")
            .await
            .unwrap();

        upload.assert_async().await;
        assert_eq!(
            public_url,
            format!(
                "{}/storage/v1/object/public/luugon-files/images/abc123.jpg",
                server.url()
            )
        );
    }

    #[tokio::test]
    async fn test_upload_file_rejected_status() {
        let mut server = mockito::Server::new_async().await;
        let upload = server
            .mock("POST", "/storage/v1/object/luugon-files/qr/abc123.png")
            .with_status(403)
            .with_body("new row violates row-level security policy")
            .create_async()
            .await;

        let err = storage_at(&server)
            .upload_file("qr/abc123.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap_err();

        upload.assert_async().await;
        assert!(matches!(
            err,
            StorageError::Rejected { status, ref body }
                if status == reqwest::StatusCode::FORBIDDEN
                    && body == "new row violates row-level security policy"
        ));
    }

    #[tokio::test]
    async fn test_upload_file_bad_path_skips_request() {
        let mut server = mockito::Server::new_async().await;
        let upload = server
            .mock("POST", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let err = storage_at(&server)
            .upload_file("../escape.png", vec![1], "image/png")
            .await
            .unwrap_err();

        upload.assert_async().await;
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }

    #[test]
    fn test_rejects_bad_paths() {
        let storage = storage();
        for path in ["", "/images/a.jpg", "images/../../secret"] {
            assert!(
                matches!(storage.public_url(path), Err(StorageError::InvalidPath(_))),
                "{path}"
            );
        }
    }
}
