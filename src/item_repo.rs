use std::{fmt, str::FromStr, sync::Arc};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DbConn, EntityTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{config::db_conn_capsule, orm::item};

pub fn item_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn ItemRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(ItemRepositoryImpl { db })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
}

impl ContentType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown content type {0:?}; must be 'text' or 'image'")]
pub struct UnknownContentType(pub String);

impl FromStr for ContentType {
    type Err = UnknownContentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            other => Err(UnknownContentType(other.to_owned())),
        }
    }
}

/// The stored payload; which variant is present is what the content type means.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemContent {
    /// Sanitized text body
    Text(String),
    /// Public URL of the compressed image blob
    Image { file_path: String },
}

impl ItemContent {
    #[must_use]
    pub const fn content_type(&self) -> ContentType {
        match self {
            Self::Text(_) => ContentType::Text,
            Self::Image { .. } => ContentType::Image,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewItem {
    pub short_code: String,
    pub content: ItemContent,
    pub original_size_kb: u64,
    pub compressed_size_kb: u64,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub id: Uuid,
    pub short_code: String,
    pub content: ItemContent,
    pub original_size_kb: u64,
    pub compressed_size_kb: u64,
    pub created_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
}

impl Item {
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }
}

#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// Inserts a new row; the id and creation time are assigned here.
    async fn create_item(&self, item: NewItem) -> anyhow::Result<Item>;

    async fn get_item_by_short_code(&self, short_code: &str) -> anyhow::Result<Option<Item>>;

    /// Returns whether a row was actually removed.
    async fn delete_item(&self, id: Uuid) -> anyhow::Result<bool>;

    /// Removes every item whose expiry is before `now`, returning how many were removed.
    async fn delete_expired_items(&self, now: OffsetDateTime) -> anyhow::Result<u64>;
}

struct ItemRepositoryImpl {
    db: DbConn,
}

#[async_trait]
impl ItemRepository for ItemRepositoryImpl {
    #[instrument(skip(self, item), fields(short_code = %item.short_code))]
    async fn create_item(&self, item: NewItem) -> anyhow::Result<Item> {
        let content_type = item.content.content_type();
        let (original_content, file_path) = match item.content {
            ItemContent::Text(text) => (Some(text), None),
            ItemContent::Image { file_path } => (None, Some(file_path)),
        };

        let to_insert = item::ActiveModel {
            id: Set(Uuid::new_v4()),
            short_code: Set(item.short_code),
            content_type: Set(content_type.as_str().to_owned()),
            original_content: Set(original_content),
            file_path: Set(file_path),
            original_size_kb: Set(item.original_size_kb.try_into()?),
            compressed_size_kb: Set(item.compressed_size_kb.try_into()?),
            created_at: Set(OffsetDateTime::now_utc()),
            expires_at: Set(item.expires_at),
        };

        let inserted = to_insert
            .insert(&self.db)
            .await
            .context("Failed to insert item")?;
        inserted.try_into()
    }

    #[instrument(skip(self))]
    async fn get_item_by_short_code(&self, short_code: &str) -> anyhow::Result<Option<Item>> {
        item::Entity::find()
            .filter(item::Column::ShortCode.eq(short_code))
            .one(&self.db)
            .await
            .context("Failed to query item by short code")?
            .map(Item::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn delete_item(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = item::Entity::delete_by_id(id)
            .exec(&self.db)
            .await
            .context("Failed to delete item")?;
        Ok(result.rows_affected > 0)
    }

    #[instrument(skip(self))]
    async fn delete_expired_items(&self, now: OffsetDateTime) -> anyhow::Result<u64> {
        let result = item::Entity::delete_many()
            .filter(item::Column::ExpiresAt.lt(now))
            .exec(&self.db)
            .await
            .context("Failed to delete expired items")?;
        info!(deleted = result.rows_affected, "Deleted expired items");
        Ok(result.rows_affected)
    }
}

impl TryFrom<item::Model> for Item {
    type Error = anyhow::Error;

    fn try_from(model: item::Model) -> Result<Self, Self::Error> {
        let content_type: ContentType = model.content_type.parse()?;
        let content = match (content_type, model.original_content, model.file_path) {
            (ContentType::Text, Some(text), None) => ItemContent::Text(text),
            (ContentType::Image, None, Some(file_path)) => ItemContent::Image { file_path },
            (content_type, text, file_path) => bail!(
                "item {} has inconsistent content for {content_type}: text present = {}, file present = {}",
                model.id,
                text.is_some(),
                file_path.is_some(),
            ),
        };

        Ok(Self {
            id: model.id,
            short_code: model.short_code,
            content,
            original_size_kb: model
                .original_size_kb
                .try_into()
                .map_err(|_| anyhow!("negative original size on item {}", model.id))?,
            compressed_size_kb: model
                .compressed_size_kb
                .try_into()
                .map_err(|_| anyhow!("negative compressed size on item {}", model.id))?,
            created_at: model.created_at,
            expires_at: model.expires_at,
        })
    }
}
