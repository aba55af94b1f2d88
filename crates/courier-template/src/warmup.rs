//! Startup template warm-up.
//!
//! Loads critical templates (password reset, email verification, session
//! reminder) for every configured language with bounded parallelism, and
//! exposes progress through a read-only snapshot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tracing::{info, warn};

use courier_common::NotificationType;

use crate::store::TemplateStore;

/// Read-only warm-up progress snapshot.
#[derive(Debug, Clone)]
pub struct WarmupProgress {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct WarmupState {
    total: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
    started_at: RwLock<Option<DateTime<Utc>>>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
}

pub struct TemplateWarmer {
    store: Arc<TemplateStore>,
    languages: Vec<String>,
    parallelism: usize,
    state: Arc<WarmupState>,
}

impl TemplateWarmer {
    pub fn new(store: Arc<TemplateStore>, languages: Vec<String>, parallelism: usize) -> Self {
        Self {
            store,
            languages,
            parallelism: parallelism.max(1),
            state: Arc::new(WarmupState {
                total: AtomicUsize::new(0),
                processed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                started_at: RwLock::new(None),
                finished_at: RwLock::new(None),
            }),
        }
    }

    /// Run the warm-up to completion. Individual load failures are counted
    /// and logged; they never abort the sweep.
    pub async fn run(&self) {
        let keys: Vec<(NotificationType, String)> = NotificationType::all()
            .iter()
            .filter(|notification_type| notification_type.is_critical())
            .flat_map(|notification_type| {
                self.languages
                    .iter()
                    .map(move |language| (*notification_type, language.clone()))
            })
            .collect();

        self.state.total.store(keys.len(), Ordering::SeqCst);
        *self.state.started_at.write() = Some(Utc::now());

        info!(
            total = keys.len(),
            parallelism = self.parallelism,
            "Starting template warm-up"
        );

        let store = self.store.clone();
        let state = self.state.clone();

        stream::iter(keys)
            .for_each_concurrent(self.parallelism, |(notification_type, language)| {
                let store = store.clone();
                let state = state.clone();
                async move {
                    match store.get(notification_type, &language).await {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            warn!(
                                notification_type = %notification_type,
                                language = %language,
                                "Warm-up found no template"
                            );
                            state.failed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            warn!(
                                notification_type = %notification_type,
                                language = %language,
                                error = %e,
                                "Warm-up load failed"
                            );
                            state.failed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    state.processed.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        *self.state.finished_at.write() = Some(Utc::now());
        let progress = self.progress();
        info!(
            processed = progress.processed,
            failed = progress.failed,
            "Template warm-up complete"
        );
    }

    /// Spawn the warm-up as a background task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    pub fn progress(&self) -> WarmupProgress {
        WarmupProgress {
            total: self.state.total.load(Ordering::SeqCst),
            processed: self.state.processed.load(Ordering::SeqCst),
            failed: self.state.failed.load(Ordering::SeqCst),
            started_at: *self.state.started_at.read(),
            finished_at: *self.state.finished_at.read(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{RendererConfig, TemplateRenderer};
    use crate::repository::{InMemoryTemplateRepository, TemplateRepository};
    use crate::store::TemplateStoreConfig;
    use courier_common::Template;

    #[tokio::test]
    async fn warms_critical_templates_and_counts_misses() {
        let repo = Arc::new(InMemoryTemplateRepository::new());
        // Only password reset exists; the other critical types will miss.
        repo.save(Template {
            notification_type: NotificationType::PasswordReset,
            language: "en".into(),
            subject: "s".into(),
            body_text: "b".into(),
            body_html: None,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        let store = Arc::new(TemplateStore::new(
            TemplateStoreConfig::default(),
            repo,
            Arc::new(TemplateRenderer::new(RendererConfig::default())),
        ));

        let warmer = TemplateWarmer::new(store.clone(), vec!["en".into()], 3);
        warmer.run().await;

        let progress = warmer.progress();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.processed, 3);
        assert_eq!(progress.failed, 2);
        assert!(progress.started_at.is_some());
        assert!(progress.finished_at.is_some());
        assert_eq!(store.cache_len(), 1);
    }
}
