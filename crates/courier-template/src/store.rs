//! Read-through template store.
//!
//! Templates are cached per (type, language) with a per-entry TTL and an LRU
//! bound. A language miss falls back to the default language. Only one
//! loader runs per key; concurrent readers wait on the loading guard.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use courier_common::{NotificationType, Template};

use crate::render::TemplateRenderer;
use crate::repository::TemplateRepository;
use crate::{Result, TemplateError};

const DEFAULT_LANGUAGE: &str = "en";

type CacheKey = (NotificationType, String);

#[derive(Debug, Clone)]
pub struct TemplateStoreConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    pub default_language: String,
}

impl Default for TemplateStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            ttl: Duration::from_secs(24 * 3_600),
            default_language: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

struct CacheEntry {
    template: Template,
    loaded_at: Instant,
    last_used: Instant,
}

/// Supplies templates by (type, language) with read-through caching.
pub struct TemplateStore {
    config: TemplateStoreConfig,
    repository: Arc<dyn TemplateRepository>,
    cache: DashMap<CacheKey, CacheEntry>,
    /// Per-key guards so only one loader hits the repository per key.
    loading: DashMap<CacheKey, Arc<Mutex<()>>>,
    /// Shared renderer whose output cache is cleared on any template update.
    renderer: Arc<TemplateRenderer>,
}

impl TemplateStore {
    pub fn new(
        config: TemplateStoreConfig,
        repository: Arc<dyn TemplateRepository>,
        renderer: Arc<TemplateRenderer>,
    ) -> Self {
        Self {
            config,
            repository,
            cache: DashMap::new(),
            loading: DashMap::new(),
            renderer,
        }
    }

    /// Resolve a template, trying (type, language) first and the default
    /// language on a miss. Returns `None` when neither exists.
    pub async fn get(
        &self,
        notification_type: NotificationType,
        language: &str,
    ) -> Result<Option<Template>> {
        if let Some(template) = self.get_exact(notification_type, language).await? {
            return Ok(Some(template));
        }

        if language != self.config.default_language {
            debug!(
                notification_type = %notification_type,
                language = %language,
                "Template miss, falling back to default language"
            );
            let fallback = self.config.default_language.clone();
            return self.get_exact(notification_type, &fallback).await;
        }

        Ok(None)
    }

    async fn get_exact(
        &self,
        notification_type: NotificationType,
        language: &str,
    ) -> Result<Option<Template>> {
        let key: CacheKey = (notification_type, language.to_string());

        if let Some(mut entry) = self.cache.get_mut(&key) {
            if entry.loaded_at.elapsed() <= self.config.ttl {
                entry.last_used = Instant::now();
                metrics::counter!("template.store.cache_hit").increment(1);
                return Ok(Some(entry.template.clone()));
            }
            drop(entry);
            self.cache.remove(&key);
        }

        // One loader per key; latecomers re-check the cache after the lock.
        let guard = self
            .loading
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _locked = guard.lock().await;

        if let Some(entry) = self.cache.get(&key) {
            return Ok(Some(entry.template.clone()));
        }

        metrics::counter!("template.store.cache_miss").increment(1);
        let loaded = self
            .repository
            .find_by_type_and_language(notification_type, language)
            .await?;

        if let Some(template) = &loaded {
            self.insert_bounded(key.clone(), template.clone());
        }
        self.loading.remove(&key);

        Ok(loaded)
    }

    fn insert_bounded(&self, key: CacheKey, template: Template) {
        while self.cache.len() >= self.config.max_entries {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|entry| entry.value().last_used)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(victim) => {
                    self.cache.remove(&victim);
                }
                None => break,
            }
        }

        let now = Instant::now();
        self.cache.insert(
            key,
            CacheEntry {
                template,
                loaded_at: now,
                last_used: now,
            },
        );
    }

    /// Persist a template and invalidate derived cache state.
    ///
    /// The rendered-output cache is cleared wholesale: rendered entries are
    /// keyed by (type, language, variables), not content, so any update of a
    /// template could leave stale renderings behind.
    pub async fn put(&self, template: Template) -> Result<()> {
        if template.body_text.is_empty() {
            return Err(TemplateError::EmptyBody);
        }

        let key: CacheKey = (template.notification_type, template.language.clone());
        self.repository.save(template).await?;
        self.cache.remove(&key);
        self.renderer.invalidate_cache();
        metrics::counter!("template.store.put").increment(1);
        Ok(())
    }

    /// Remove a template and its cache entries.
    pub async fn delete(
        &self,
        notification_type: NotificationType,
        language: &str,
    ) -> Result<bool> {
        let removed = self.repository.delete(notification_type, language).await?;
        self.invalidate(notification_type, language);
        self.renderer.invalidate_cache();
        Ok(removed)
    }

    /// Clear cache entries for a key without touching the repository.
    pub fn invalidate(&self, notification_type: NotificationType, language: &str) {
        self.cache.remove(&(notification_type, language.to_string()));
    }

    pub async fn available_languages(&self) -> Result<Vec<String>> {
        self.repository
            .find_available_languages()
            .await
            .map_err(TemplateError::Repository)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn renderer(&self) -> &Arc<TemplateRenderer> {
        &self.renderer
    }
}

impl std::fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStore")
            .field("cached", &self.cache.len())
            .finish()
    }
}
