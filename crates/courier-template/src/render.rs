//! Variable substitution and the rendered-output cache.
//!
//! Placeholders use `{{name}}` syntax; the engine-style `${name}` alias is
//! accepted for backward parsing. Variable names match
//! `[A-Za-z_][A-Za-z0-9_]*`. Values substituted into the HTML body are
//! HTML-escaped; the text body receives literal values.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use tracing::debug;

use courier_common::{RenderedMessage, Template};

use crate::{Result, TemplateError};

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}|\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .expect("placeholder regex is valid")
    })
}

/// Extract the set of placeholder names from a single content field.
fn extract_from(content: &str, into: &mut BTreeSet<String>) {
    for captures in placeholder_regex().captures_iter(content) {
        let name = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str().to_string());
        if let Some(name) = name {
            into.insert(name);
        }
    }
}

/// The variables a template requires: the union of placeholder names across
/// subject, text body, and HTML body. Extraction is a single pass per field
/// and idempotent.
pub fn required_variables(template: &Template) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    extract_from(&template.subject, &mut names);
    extract_from(&template.body_text, &mut names);
    if let Some(html) = &template.body_html {
        extract_from(html, &mut names);
    }
    names
}

fn html_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// String-coerce a variable value. JSON strings substitute without quotes.
fn coerce(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn substitute(content: &str, variables: &HashMap<String, serde_json::Value>, escape: bool) -> String {
    placeholder_regex()
        .replace_all(content, |captures: &regex::Captures<'_>| {
            let name = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match variables.get(name) {
                Some(value) => {
                    let coerced = coerce(value);
                    if escape {
                        html_escape(&coerced)
                    } else {
                        coerced
                    }
                }
                // Unreachable after the completeness check; keep the
                // placeholder visible if it ever happens.
                None => captures.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Configuration for the renderer's output cache.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub cache_max_entries: usize,
    pub cache_ttl: Duration,
    /// Rendered text bodies above this size are not cached.
    pub cache_max_body_bytes: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            cache_max_entries: 5_000,
            cache_ttl: Duration::from_secs(3_600),
            cache_max_body_bytes: 100 * 1024,
        }
    }
}

struct CachedRender {
    message: RenderedMessage,
    inserted_at: Instant,
}

/// Bounded TTL cache for rendered output, keyed by a stable hash of
/// (type, language, sorted variables). Cleared wholesale on template updates
/// because keys do not encode template content.
pub struct RenderedCache {
    config: RendererConfig,
    entries: DashMap<u64, CachedRender>,
    insertion_order: Mutex<VecDeque<u64>>,
}

impl RenderedCache {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            insertion_order: Mutex::new(VecDeque::new()),
        }
    }

    fn key(template: &Template, variables: &HashMap<String, serde_json::Value>) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        template.notification_type.as_str().hash(&mut hasher);
        template.language.hash(&mut hasher);
        let mut pairs: Vec<(&String, String)> =
            variables.iter().map(|(k, v)| (k, coerce(v))).collect();
        pairs.sort();
        for (name, value) in pairs {
            name.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        hasher.finish()
    }

    fn get(&self, key: u64) -> Option<RenderedMessage> {
        let entry = self.entries.get(&key)?;
        if entry.inserted_at.elapsed() > self.config.cache_ttl {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.message.clone())
    }

    fn insert(&self, key: u64, message: RenderedMessage) {
        if message.body_text.len() > self.config.cache_max_body_bytes {
            debug!(bytes = message.body_text.len(), "Rendered body too large to cache");
            return;
        }

        let mut order = self.insertion_order.lock();
        while order.len() >= self.config.cache_max_entries {
            if let Some(oldest) = order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
        order.push_back(key);
        drop(order);

        self.entries.insert(key, CachedRender { message, inserted_at: Instant::now() });
    }

    /// Drop every cached rendering. Called whenever any template changes.
    pub fn clear(&self) {
        self.entries.clear();
        self.insertion_order.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Substitutes variables into template fields and returns a `RenderedMessage`.
pub struct TemplateRenderer {
    cache: RenderedCache,
}

impl TemplateRenderer {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            cache: RenderedCache::new(config),
        }
    }

    /// Render `template` with `variables`.
    ///
    /// Fails with `MissingVariables` when the template's required set is not
    /// covered. Values substituted into the HTML body are escaped; the text
    /// body keeps literal characters.
    pub fn render(
        &self,
        template: &Template,
        variables: &HashMap<String, serde_json::Value>,
    ) -> Result<RenderedMessage> {
        if template.body_text.is_empty() {
            return Err(TemplateError::EmptyBody);
        }

        let required = required_variables(template);
        let missing: BTreeSet<String> = required
            .iter()
            .filter(|name| !variables.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(TemplateError::MissingVariables { names: missing });
        }

        let key = RenderedCache::key(template, variables);
        if let Some(cached) = self.cache.get(key) {
            metrics::counter!("template.render.cache_hit").increment(1);
            return Ok(cached);
        }

        let message = RenderedMessage {
            subject: substitute(&template.subject, variables, false),
            body_text: substitute(&template.body_text, variables, false),
            body_html: template
                .body_html
                .as_ref()
                .map(|html| substitute(html, variables, true)),
            variable_count: required.len(),
            processed_at: Utc::now(),
        };

        metrics::counter!("template.render.cache_miss").increment(1);
        self.cache.insert(key, message.clone());
        Ok(message)
    }

    /// Invalidate every cached rendering.
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new(RendererConfig::default())
    }
}
