//! User contact resolution with a TTL cache and staleness flag.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use courier_common::UserInfo;

/// Identity service contract. `Ok(None)` means the user is unknown.
#[async_trait]
pub trait UserInfoProvider: Send + Sync {
    async fn resolve(&self, user_id: &str) -> Result<Option<UserInfo>>;
}

/// Resolution result annotated with cache staleness.
#[derive(Debug, Clone)]
pub struct ResolvedUserInfo {
    pub info: UserInfo,
    /// True when the entry came from cache after the provider failed.
    pub stale: bool,
}

struct CachedEntry {
    info: UserInfo,
    fetched_at: Instant,
}

/// Caching decorator. Fresh entries are served from cache; on provider
/// failure an expired entry is served with `stale = true` rather than
/// failing the delivery.
pub struct CachedUserInfoProvider {
    inner: Arc<dyn UserInfoProvider>,
    ttl: Duration,
    cache: DashMap<String, CachedEntry>,
}

impl CachedUserInfoProvider {
    pub fn new(inner: Arc<dyn UserInfoProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
        }
    }

    pub async fn resolve(&self, user_id: &str) -> Result<Option<ResolvedUserInfo>> {
        if let Some(entry) = self.cache.get(user_id) {
            if entry.fetched_at.elapsed() <= self.ttl {
                return Ok(Some(ResolvedUserInfo {
                    info: entry.info.clone(),
                    stale: false,
                }));
            }
        }

        match self.inner.resolve(user_id).await {
            Ok(Some(info)) => {
                self.cache.insert(
                    user_id.to_string(),
                    CachedEntry { info: info.clone(), fetched_at: Instant::now() },
                );
                Ok(Some(ResolvedUserInfo { info, stale: false }))
            }
            Ok(None) => {
                self.cache.remove(user_id);
                Ok(None)
            }
            Err(e) => match self.cache.get(user_id) {
                Some(entry) => {
                    warn!(user_id = %user_id, error = %e, "Identity service failed, serving stale entry");
                    Ok(Some(ResolvedUserInfo { info: entry.info.clone(), stale: true }))
                }
                None => Err(e),
            },
        }
    }
}

/// Fixed map of users, for tests and the development composition root.
#[derive(Default)]
pub struct StaticUserInfoProvider {
    users: DashMap<String, UserInfo>,
}

impl StaticUserInfoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: UserInfo) {
        self.users.insert(info.user_id.clone(), info);
    }

    pub fn with_user(self, info: UserInfo) -> Self {
        self.insert(info);
        self
    }
}

#[async_trait]
impl UserInfoProvider for StaticUserInfoProvider {
    async fn resolve(&self, user_id: &str) -> Result<Option<UserInfo>> {
        Ok(self.users.get(user_id).map(|entry| entry.value().clone()))
    }
}
