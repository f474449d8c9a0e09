//! Character -> project map cache.
//!
//! A process-wide structure with a 60-second TTL and an explicit
//! `invalidate()` entry point, called after any operator mutation of
//! projects, characters, generation_styles or world_settings. Entries own
//! their data; lookups are pure.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use anzu_protocol::defaults::CHAR_CACHE_TTL_SECS;

use crate::pool::DbPool;
use crate::store::projects::character_project_pairs;

#[derive(Debug, Default)]
struct CacheState {
    map: HashMap<String, String>,
    refreshed_at: Option<DateTime<Utc>>,
}

/// TTL-cached character slug -> project name map.
#[derive(Debug)]
pub struct CharacterProjectCache {
    state: RwLock<CacheState>,
    ttl: Duration,
}

impl Default for CharacterProjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CharacterProjectCache {
    pub fn new() -> Self {
        CharacterProjectCache {
            state: RwLock::new(CacheState::default()),
            ttl: Duration::seconds(CHAR_CACHE_TTL_SECS),
        }
    }

    #[cfg(test)]
    fn with_ttl(ttl: Duration) -> Self {
        CharacterProjectCache {
            state: RwLock::new(CacheState::default()),
            ttl,
        }
    }

    /// The full map, refreshed from the store when stale.
    pub async fn get_map(&self, pool: &DbPool) -> Result<HashMap<String, String>> {
        {
            let state = self.state.read().await;
            if let Some(refreshed_at) = state.refreshed_at {
                if Utc::now() - refreshed_at < self.ttl {
                    return Ok(state.map.clone());
                }
            }
        }
        self.refresh(pool).await
    }

    /// Project for one character, or None if unknown.
    pub async fn project_for(&self, pool: &DbPool, slug: &str) -> Result<Option<String>> {
        Ok(self.get_map(pool).await?.get(slug).cloned())
    }

    /// Drop the cached map; the next lookup reloads.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        state.map.clear();
        state.refreshed_at = None;
        debug!("Character->project cache invalidated");
    }

    async fn refresh(&self, pool: &DbPool) -> Result<HashMap<String, String>> {
        let pairs = character_project_pairs(pool).await?;
        let map: HashMap<String, String> = pairs.into_iter().collect();

        let mut state = self.state.write().await;
        state.map = map.clone();
        state.refreshed_at = Some(Utc::now());
        debug!("Character->project cache refreshed: {} entries", map.len());
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;
    use crate::pool::{create_pool, DbConfig};
    use crate::store::projects::{create_character, create_project};

    async fn setup() -> DbPool {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_cache_serves_stale_until_invalidated() {
        let pool = setup().await;
        let project_id = create_project(&pool, "P1", None, None, None, None).await.unwrap();
        create_character(&pool, project_id, "luigi", "Luigi", Some("green"), None, None)
            .await
            .unwrap();

        let cache = CharacterProjectCache::new();
        assert_eq!(
            cache.project_for(&pool, "luigi").await.unwrap().as_deref(),
            Some("P1")
        );

        // New character is invisible while the TTL holds...
        create_character(&pool, project_id, "peach", "Peach", Some("pink"), None, None)
            .await
            .unwrap();
        assert!(cache.project_for(&pool, "peach").await.unwrap().is_none());

        // ...and visible after an explicit invalidation.
        cache.invalidate().await;
        assert_eq!(
            cache.project_for(&pool, "peach").await.unwrap().as_deref(),
            Some("P1")
        );
    }

    #[tokio::test]
    async fn test_cache_refreshes_after_ttl() {
        let pool = setup().await;
        let project_id = create_project(&pool, "P1", None, None, None, None).await.unwrap();
        create_character(&pool, project_id, "luigi", "Luigi", Some("green"), None, None)
            .await
            .unwrap();

        let cache = CharacterProjectCache::with_ttl(Duration::seconds(0));
        cache.get_map(&pool).await.unwrap();

        create_character(&pool, project_id, "peach", "Peach", Some("pink"), None, None)
            .await
            .unwrap();
        // Zero TTL means every read refreshes.
        assert!(cache.project_for(&pool, "peach").await.unwrap().is_some());
    }
}
