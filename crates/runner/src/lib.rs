pub mod feed;
pub mod version;

use std::sync::Arc;

use anyhow::{Context, Result};
use schema_store::{MemSchemaStore, SchemaStore, SqliteSchemaStore};
use schemawatch_config::StoreCfg;
use tracing::{info, warn};

pub use feed::{FeedStats, feed_lines};

/// Open the durable store named by the `store` config section.
pub fn open_store(cfg: &StoreCfg) -> Result<Arc<dyn SchemaStore>> {
    match cfg {
        StoreCfg::Sqlite { path } => {
            let store = SqliteSchemaStore::new(path).with_context(|| {
                format!("opening sqlite store at {}", path.display())
            })?;
            info!(path = %path.display(), "sqlite schema store opened");
            Ok(Arc::new(store))
        }
        StoreCfg::Memory => {
            warn!("using in-memory schema store, nothing survives a restart");
            Ok(Arc::new(MemSchemaStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_configured_stores() {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = open_store(&StoreCfg::Sqlite {
            path: dir.path().join("nested/schemas.db"),
        })
        .unwrap();
        assert!(sqlite.load_models(None).await.unwrap().is_empty());
        assert!(dir.path().join("nested/schemas.db").exists());

        let mem = open_store(&StoreCfg::Memory).unwrap();
        assert!(mem.load_versions(None).await.unwrap().is_empty());
    }
}
