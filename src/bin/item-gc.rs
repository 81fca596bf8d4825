use anyhow::Context;
use luugon::{config, item_repo::item_repository_capsule};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

/// Purges expired items, or deletes the single item whose id is given as the first argument.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let target = std::env::args()
        .nth(1)
        .map(|raw| Uuid::parse_str(&raw).with_context(|| format!("{raw} is not a valid item id")))
        .transpose()?;

    let container = config::init_container().await?;
    let item_repo = container.read(item_repository_capsule);

    if let Some(id) = target {
        let deleted = item_repo
            .delete_item(id)
            .await
            .context("Failed to delete item")?;
        info!(%id, deleted, "Finished deleting item");
    } else {
        let deleted = item_repo
            .delete_expired_items(OffsetDateTime::now_utc())
            .await
            .context("Failed to delete expired items")?;
        info!(deleted, "Purged expired items");
    }
    Ok(())
}
