//! Template repository contract and the in-memory adapter used by tests and
//! the development composition root.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use courier_common::{NotificationType, Template};

/// Persistence contract for templates. Admin CRUD flows and the store's
/// read-through loads go through this interface.
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn find_by_type_and_language(
        &self,
        notification_type: NotificationType,
        language: &str,
    ) -> Result<Option<Template>>;

    /// Insert or replace the template for its (type, language) key.
    async fn save(&self, template: Template) -> Result<()>;

    async fn delete(&self, notification_type: NotificationType, language: &str) -> Result<bool>;

    /// Distinct languages with at least one template.
    async fn find_available_languages(&self) -> Result<Vec<String>>;
}

/// DashMap-backed repository.
#[derive(Default)]
pub struct InMemoryTemplateRepository {
    templates: DashMap<(NotificationType, String), Template>,
}

impl InMemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateRepository {
    async fn find_by_type_and_language(
        &self,
        notification_type: NotificationType,
        language: &str,
    ) -> Result<Option<Template>> {
        Ok(self
            .templates
            .get(&(notification_type, language.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, template: Template) -> Result<()> {
        self.templates
            .insert((template.notification_type, template.language.clone()), template);
        Ok(())
    }

    async fn delete(&self, notification_type: NotificationType, language: &str) -> Result<bool> {
        Ok(self
            .templates
            .remove(&(notification_type, language.to_string()))
            .is_some())
    }

    async fn find_available_languages(&self) -> Result<Vec<String>> {
        let mut languages: Vec<String> = self
            .templates
            .iter()
            .map(|entry| entry.key().1.clone())
            .collect();
        languages.sort();
        languages.dedup();
        Ok(languages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn template(notification_type: NotificationType, language: &str) -> Template {
        Template {
            notification_type,
            language: language.to_string(),
            subject: "Subject".into(),
            body_text: "Body".into(),
            body_html: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let repo = InMemoryTemplateRepository::new();
        repo.save(template(NotificationType::PasswordReset, "en")).await.unwrap();

        let found = repo
            .find_by_type_and_language(NotificationType::PasswordReset, "en")
            .await
            .unwrap();
        assert!(found.is_some());

        let missing = repo
            .find_by_type_and_language(NotificationType::PasswordReset, "de")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn available_languages_deduplicated() {
        let repo = InMemoryTemplateRepository::new();
        repo.save(template(NotificationType::PasswordReset, "en")).await.unwrap();
        repo.save(template(NotificationType::SessionReminder, "en")).await.unwrap();
        repo.save(template(NotificationType::PasswordReset, "de")).await.unwrap();

        let languages = repo.find_available_languages().await.unwrap();
        assert_eq!(languages, vec!["de".to_string(), "en".to_string()]);
    }
}
