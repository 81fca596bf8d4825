use std::{path::Path, sync::Arc};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rearch::CapsuleHandle;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::{Settings, settings_capsule},
    image_compress::{
        COMPRESSED_CONTENT_TYPE, COMPRESSED_EXTENSION, CompressedImage, ImageCompressError,
        compress_image,
    },
    item_repo::{
        ContentType, Item, ItemContent, ItemRepository, NewItem, UnknownContentType,
        item_repository_capsule,
    },
    object_store::{ObjectStore, object_store_capsule},
    qr::{QR_EXTENSION, QrImage, encode_qr},
    rate_limit::{RateLimiter, rate_limiter_capsule},
    sanitize::sanitize,
    short_code::{ShortCodeGenerator, short_code_generator_capsule},
};

/// How many fresh short codes to try before giving up on a submission.
const MINT_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_name: Option<String>,
    /// Media type declared by the client, not sniffed
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// One inbound submission, as loosely typed as it arrived.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Submission {
    pub kind: String,
    pub content: Option<String>,
    pub file: Option<UploadedFile>,
}

#[derive(Debug, Serialize)]
pub struct CompressResponse {
    pub item_id: Uuid,
    pub short_code: String,
    pub short_url: String,
    pub qr_code_url: Option<String>,
    pub original_size_kb: u64,
    pub compressed_size_kb: u64,
    pub compression_ratio: f64,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ItemPayload {
    Text { content: String },
    Image { file_path: String },
}

pub fn ingest_service_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn IngestService> {
    Arc::new(IngestServiceImpl {
        item_repo: Arc::clone(get.as_ref(item_repository_capsule)),
        object_store: Arc::clone(get.as_ref(object_store_capsule)),
        rate_limiter: Arc::clone(get.as_ref(rate_limiter_capsule)),
        short_codes: *get.as_ref(short_code_generator_capsule),
        settings: get.as_ref(settings_capsule).clone(),
    })
}

#[async_trait]
pub trait IngestService: Send + Sync {
    /// Admits, validates, transforms, and persists one submission.
    async fn compress(
        &self,
        client_id: &str,
        submission: Submission,
    ) -> Result<CompressResponse, CompressError>;

    async fn get_item(&self, short_code: &str) -> Result<ItemPayload, GetItemError>;

    /// Regenerates the QR image for an existing short code.
    async fn get_qr_code(&self, short_code: &str) -> Result<QrImage, GetQrError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid type: {0}")]
    UnknownType(#[from] UnknownContentType),
    #[error("text content is required")]
    EmptyText,
    #[error("text content exceeds maximum length of {max} characters")]
    TextTooLong { max: usize },
    #[error("image file is required")]
    MissingFile,
    #[error("invalid image type; allowed types: {}", allowed.join(", "))]
    UnsupportedMediaType { allowed: Vec<String> },
    #[error("invalid file extension; allowed extensions: {}", allowed.join(", "))]
    UnsupportedExtension { allowed: Vec<String> },
    #[error("file size exceeds maximum of {max_mb}MB")]
    FileTooLarge { max_mb: usize },
}

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("too many requests; please try again later")]
    RateLimited,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("invalid image: {0}")]
    InvalidImage(#[from] ImageCompressError),
    #[error("internal error: {0}")]
    Internal(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

#[derive(Debug, Error)]
pub enum GetItemError {
    #[error("item not found")]
    NotFound,
    #[error("item has expired")]
    Expired,
    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum GetQrError {
    #[error("item not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

/// Compressed size over original size, or 0.0 when nothing went in.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compression_ratio(original_size_kb: u64, compressed_size_kb: u64) -> f64 {
    if original_size_kb == 0 {
        return 0.0;
    }
    compressed_size_kb as f64 / original_size_kb as f64
}

/// A submission that passed validation.
enum Validated {
    Text(String),
    Image(Vec<u8>),
}

enum Transformed {
    Text(String),
    Image(CompressedImage),
}

struct IngestServiceImpl {
    item_repo: Arc<dyn ItemRepository>,
    object_store: Arc<dyn ObjectStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    short_codes: ShortCodeGenerator,
    settings: Settings,
}

impl IngestServiceImpl {
    fn validate(&self, submission: Submission) -> Result<Validated, ValidationError> {
        match submission.kind.parse::<ContentType>()? {
            ContentType::Text => {
                let content = submission
                    .content
                    .filter(|content| !content.trim().is_empty())
                    .ok_or(ValidationError::EmptyText)?;
                if content.chars().count() > self.settings.max_text_length {
                    return Err(ValidationError::TextTooLong {
                        max: self.settings.max_text_length,
                    });
                }
                Ok(Validated::Text(content))
            }
            ContentType::Image => {
                // NOTE: browsers send an empty part when the file input is left blank
                let file = submission
                    .file
                    .filter(|file| !file.data.is_empty())
                    .ok_or(ValidationError::MissingFile)?;
                self.validate_media_type(file.content_type.as_deref())?;
                self.validate_extension(file.file_name.as_deref())?;
                if file.data.len() > self.settings.max_file_size_bytes {
                    return Err(ValidationError::FileTooLarge {
                        max_mb: self.settings.max_file_size_bytes / (1024 * 1024),
                    });
                }
                Ok(Validated::Image(file.data))
            }
        }
    }

    fn validate_media_type(&self, content_type: Option<&str>) -> Result<(), ValidationError> {
        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .unwrap_or_default();
        if self
            .settings
            .allowed_image_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(essence))
        {
            Ok(())
        } else {
            Err(ValidationError::UnsupportedMediaType {
                allowed: self.settings.allowed_image_types.clone(),
            })
        }
    }

    /// Only checked when the client supplied a file name.
    fn validate_extension(&self, file_name: Option<&str>) -> Result<(), ValidationError> {
        let Some(file_name) = file_name.filter(|name| !name.is_empty()) else {
            return Ok(());
        };
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()));
        match extension {
            Some(ext) if self.settings.allowed_image_extensions.contains(&ext) => Ok(()),
            _ => Err(ValidationError::UnsupportedExtension {
                allowed: self.settings.allowed_image_extensions.clone(),
            }),
        }
    }

    async fn mint_short_code(&self) -> Result<String, CompressError> {
        for _ in 0..MINT_ATTEMPTS {
            let short_code = self.short_codes.generate();
            match self.item_repo.get_item_by_short_code(&short_code).await {
                Ok(None) => return Ok(short_code),
                Ok(Some(_)) => warn!(%short_code, "Generated short code that was already taken"),
                Err(err) => {
                    return Err(CompressError::Internal(
                        err.context("Failed to check short code availability"),
                    ));
                }
            }
        }
        Err(CompressError::Internal(anyhow!(
            "Exhausted short code attempts"
        )))
    }

    async fn transform(&self, validated: Validated) -> Result<(Transformed, u64), CompressError> {
        match validated {
            Validated::Text(text) => {
                let original_size_kb = text.len() as u64 / 1024;
                Ok((Transformed::Text(sanitize(&text)), original_size_kb))
            }
            Validated::Image(data) => {
                let original_size_kb = data.len() as u64 / 1024;
                let options = self.settings.image;
                let compressed = tokio::task::spawn_blocking(move || compress_image(&data, options))
                    .await
                    .context("Image compression task failed")
                    .map_err(CompressError::Internal)??;
                Ok((Transformed::Image(compressed), original_size_kb))
            }
        }
    }

    /// Generates and uploads the QR image; any failure here only costs the QR URL.
    async fn store_qr_code(&self, short_code: &str, short_url: &str) -> Option<String> {
        let qr = encode_qr(short_url)
            .inspect_err(|err| warn!(?err, short_code, "Skipping QR code generation"))
            .ok()?;
        let path = format!("qr/{short_code}.{QR_EXTENSION}");
        self.object_store
            .upload_file(&path, qr.data, qr.content_type)
            .await
            .inspect_err(|err| warn!(?err, short_code, "Skipping QR code upload"))
            .ok()
    }

    async fn find_item(&self, short_code: &str) -> anyhow::Result<Option<Item>> {
        self.item_repo
            .get_item_by_short_code(short_code)
            .await
            .context("Failed to look up item")
    }
}

#[async_trait]
impl IngestService for IngestServiceImpl {
    #[instrument(skip(self, submission), fields(kind = %submission.kind))]
    async fn compress(
        &self,
        client_id: &str,
        submission: Submission,
    ) -> Result<CompressResponse, CompressError> {
        if !self.rate_limiter.is_allowed(client_id) {
            info!(client_id, "Rejected rate limited client");
            return Err(CompressError::RateLimited);
        }

        let validated = self.validate(submission)?;
        let short_code = self.mint_short_code().await?;
        let short_url = self.settings.short_url(&short_code);

        let (transformed, original_size_kb) = self.transform(validated).await?;

        let (content, compressed_size_kb) = match transformed {
            Transformed::Text(sanitized) => {
                let compressed_size_kb = sanitized.len() as u64 / 1024;
                (ItemContent::Text(sanitized), compressed_size_kb)
            }
            Transformed::Image(compressed) => {
                let path = format!("images/{short_code}.{COMPRESSED_EXTENSION}");
                let file_path = self
                    .object_store
                    .upload_file(&path, compressed.data, COMPRESSED_CONTENT_TYPE)
                    .await
                    .context("Failed to upload compressed image")
                    .map_err(CompressError::Internal)?;
                (ItemContent::Image { file_path }, compressed.size_kb)
            }
        };

        let qr_code_url = self.store_qr_code(&short_code, &short_url).await;

        let new_item = NewItem {
            short_code: short_code.clone(),
            content,
            original_size_kb,
            compressed_size_kb,
            expires_at: self
                .settings
                .item_ttl
                .map(|ttl| OffsetDateTime::now_utc() + ttl),
        };
        let item = self.item_repo.create_item(new_item).await.map_err(|err| {
            // NOTE: blobs uploaded above are left orphaned; there's no compensating delete
            error!(?err, %short_code, "Failed to persist item");
            CompressError::Internal(err.context("Failed to persist item"))
        })?;

        info!(item_id = %item.id, %short_code, "Created item");
        Ok(CompressResponse {
            item_id: item.id,
            short_code,
            short_url,
            qr_code_url,
            original_size_kb,
            compressed_size_kb,
            compression_ratio: compression_ratio(original_size_kb, compressed_size_kb),
        })
    }

    #[instrument(skip(self))]
    async fn get_item(&self, short_code: &str) -> Result<ItemPayload, GetItemError> {
        let item = self
            .find_item(short_code)
            .await
            .map_err(GetItemError::Internal)?
            .ok_or(GetItemError::NotFound)?;

        if item.is_expired_at(OffsetDateTime::now_utc()) {
            return Err(GetItemError::Expired);
        }

        Ok(match item.content {
            ItemContent::Text(content) => ItemPayload::Text { content },
            ItemContent::Image { file_path } => ItemPayload::Image { file_path },
        })
    }

    #[instrument(skip(self))]
    async fn get_qr_code(&self, short_code: &str) -> Result<QrImage, GetQrError> {
        let item = self
            .find_item(short_code)
            .await
            .map_err(GetQrError::Internal)?
            .ok_or(GetQrError::NotFound)?;

        encode_qr(&self.settings.short_url(&item.short_code))
            .context("Failed to regenerate QR code")
            .map_err(GetQrError::Internal)
    }
}
