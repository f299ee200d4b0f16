//! Free-model catalog: discovery, normalization, and caching across the
//! three upstream sources.
//!
//! Each source is fetched independently and cached with its own TTL. A
//! source fetch failure retains the previous snapshot rather than
//! emptying the catalog — a single upstream hiccup should never make
//! every model disappear.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::RwLock;

use crate::config::Config;

/// One of the three upstream sources this gateway aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Ollama,
    OpenCodeZen,
    OpenRouter,
}

impl Source {
    /// Flat-listing sort priority: lower sorts first.
    fn priority(self) -> u8 {
        match self {
            Source::Ollama => 0,
            Source::OpenCodeZen => 1,
            Source::OpenRouter => 2,
        }
    }

    /// Provider-option sort priority within a grouped entry.
    fn grouped_priority(self) -> u8 {
        match self {
            Source::OpenCodeZen => 0,
            Source::OpenRouter => 1,
            Source::Ollama => 2,
        }
    }
}

/// A discovered free model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub source: Source,
    pub capabilities: Vec<String>,
    pub is_free: bool,
    pub discovered_at: DateTime<Utc>,
}

struct SourceSnapshot {
    models: Vec<ModelDescriptor>,
    fetched_at: DateTime<Utc>,
}

/// Unified, cached, free-model catalog.
pub struct Scanner {
    http: reqwest::Client,
    ttl: chrono::Duration,
    ollama_base_url: String,
    opencode_zen_base_url: String,
    opencode_zen_api_key: Option<String>,
    opencode_zen_allow_list: Vec<(String, String)>,
    openrouter_base_url: String,
    openrouter_api_key: Option<String>,
    ollama: RwLock<Option<SourceSnapshot>>,
    opencode_zen: RwLock<Option<SourceSnapshot>>,
    openrouter: RwLock<Option<SourceSnapshot>>,
}

impl Scanner {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            ttl: chrono::Duration::seconds(config.scanner_ttl_seconds as i64),
            ollama_base_url: config.ollama_base_url.clone(),
            opencode_zen_base_url: config.opencode_zen_base_url.clone(),
            opencode_zen_api_key: config.opencode_zen_api_key.clone(),
            opencode_zen_allow_list: default_opencode_zen_allow_list(),
            openrouter_base_url: config.openrouter_base_url.clone(),
            openrouter_api_key: config.openrouter_api_key.clone(),
            ollama: RwLock::new(None),
            opencode_zen: RwLock::new(None),
            openrouter: RwLock::new(None),
        }
    }

    /// Whether `open_code_zen` has a credential on file (required to *use*
    /// a model, not to list it).
    pub fn opencode_zen_configured(&self) -> bool {
        self.opencode_zen_api_key.is_some()
    }

    /// Whether `openrouter` has a credential on file.
    pub fn openrouter_configured(&self) -> bool {
        self.openrouter_api_key.is_some()
    }

    fn is_stale(snapshot: &Option<SourceSnapshot>, ttl: chrono::Duration) -> bool {
        match snapshot {
            None => true,
            Some(s) => Utc::now() - s.fetched_at > ttl,
        }
    }

    async fn refresh_ollama(&self) -> anyhow::Result<()> {
        let url = format!("{}/api/tags", self.ollama_base_url);
        let result = self.http.get(&url).send().await;
        let models = match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<OllamaTagsResponse>().await {
                Ok(body) => body
                    .models
                    .into_iter()
                    .map(|m| ModelDescriptor {
                        id: format!("ollama/{}", m.name),
                        display_name: m.name,
                        source: Source::Ollama,
                        capabilities: vec!["chat".to_string()],
                        is_free: true,
                        discovered_at: Utc::now(),
                    })
                    .collect::<Vec<_>>(),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to parse ollama catalog, keeping previous snapshot");
                    return Ok(());
                }
            },
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "ollama catalog fetch returned non-2xx, keeping previous snapshot");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(error = %err, "ollama catalog fetch failed, keeping previous snapshot");
                return Ok(());
            }
        };

        *self.ollama.write().map_err(|e| anyhow::anyhow!("ollama cache lock poisoned: {e}"))? =
            Some(SourceSnapshot { models, fetched_at: Utc::now() });
        Ok(())
    }

    async fn refresh_opencode_zen(&self) -> anyhow::Result<()> {
        // The allow-list is an enumerated constant set (see open question in the
        // design notes); listing does not require a credential, only usage does.
        let models = self
            .opencode_zen_allow_list
            .iter()
            .map(|(id, display_name)| ModelDescriptor {
                id: format!("open_code_zen/{id}"),
                display_name: display_name.clone(),
                source: Source::OpenCodeZen,
                capabilities: vec!["chat".to_string()],
                is_free: true,
                discovered_at: Utc::now(),
            })
            .collect();

        *self
            .opencode_zen
            .write()
            .map_err(|e| anyhow::anyhow!("opencode_zen cache lock poisoned: {e}"))? =
            Some(SourceSnapshot { models, fetched_at: Utc::now() });
        Ok(())
    }

    async fn refresh_openrouter(&self) -> anyhow::Result<()> {
        let url = format!("{}/api/v1/models", self.openrouter_base_url);
        let request = self.http.get(&url);
        let request = match &self.openrouter_api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };

        let result = request.send().await;
        let models = match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<OpenRouterModelsResponse>().await {
                Ok(body) => body
                    .data
                    .into_iter()
                    .filter(|m| m.pricing.prompt == "0" && m.pricing.completion == "0")
                    .map(|m| ModelDescriptor {
                        id: format!("openrouter/{}", m.id),
                        display_name: m.name.unwrap_or_else(|| m.id.clone()),
                        source: Source::OpenRouter,
                        capabilities: vec!["chat".to_string()],
                        is_free: true,
                        discovered_at: Utc::now(),
                    })
                    .collect::<Vec<_>>(),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to parse openrouter catalog, keeping previous snapshot");
                    return Ok(());
                }
            },
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "openrouter catalog fetch returned non-2xx, keeping previous snapshot");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(error = %err, "openrouter catalog fetch failed, keeping previous snapshot");
                return Ok(());
            }
        };

        *self
            .openrouter
            .write()
            .map_err(|e| anyhow::anyhow!("openrouter cache lock poisoned: {e}"))? =
            Some(SourceSnapshot { models, fetched_at: Utc::now() });
        Ok(())
    }

    /// Run forever, refreshing every source on a fixed cadence. Intended to be
    /// spawned as its own task alongside the HTTP server (§5: "the C3
    /// refresher" is one of the independent tasks sharing the runtime),
    /// so a catalog refresh happens even if no request calls `list_*` in
    /// the meantime.
    pub async fn run_periodic_refresh(&self, interval: std::time::Duration) {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if let Err(err) = self.ensure_fresh(false).await {
                tracing::warn!(error = %err, "periodic catalog refresh failed");
            }
        }
    }

    /// Ensure every source's cache is fresh (or `force_refresh` bypasses the TTL check).
    pub async fn ensure_fresh(&self, force_refresh: bool) -> anyhow::Result<()> {
        let ollama_stale = force_refresh || {
            let guard = self.ollama.read().map_err(|e| anyhow::anyhow!("ollama cache lock poisoned: {e}"))?;
            Self::is_stale(&guard, self.ttl)
        };
        let opencode_zen_stale = force_refresh || {
            let guard = self
                .opencode_zen
                .read()
                .map_err(|e| anyhow::anyhow!("opencode_zen cache lock poisoned: {e}"))?;
            Self::is_stale(&guard, self.ttl)
        };
        let openrouter_stale = force_refresh || {
            let guard = self
                .openrouter
                .read()
                .map_err(|e| anyhow::anyhow!("openrouter cache lock poisoned: {e}"))?;
            Self::is_stale(&guard, self.ttl)
        };

        if ollama_stale {
            if let Err(err) = self.refresh_ollama().await {
                tracing::warn!(error = %err, "ollama catalog refresh failed");
            }
        }
        if opencode_zen_stale {
            if let Err(err) = self.refresh_opencode_zen().await {
                tracing::warn!(error = %err, "opencode_zen catalog refresh failed");
            }
        }
        if openrouter_stale {
            if let Err(err) = self.refresh_openrouter().await {
                tracing::warn!(error = %err, "openrouter catalog refresh failed");
            }
        }
        Ok(())
    }

    /// Flat listing ordered by `(source priority, display_name)`.
    pub async fn list_flat(&self, force_refresh: bool) -> anyhow::Result<Vec<ModelDescriptor>> {
        self.ensure_fresh(force_refresh).await?;

        let mut all = Vec::new();
        for snap in [&self.ollama, &self.opencode_zen, &self.openrouter] {
            let guard = snap.read().map_err(|e| anyhow::anyhow!("catalog cache lock poisoned: {e}"))?;
            if let Some(snapshot) = guard.as_ref() {
                all.extend(snapshot.models.iter().cloned());
            }
        }
        all.retain(|m| m.is_free);
        all.sort_by(|a, b| {
            a.source
                .priority()
                .cmp(&b.source.priority())
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        Ok(all)
    }

    /// Whether `model_id` is present in the most recent (or still-fresh) listing.
    pub async fn contains(&self, model_id: &str) -> anyhow::Result<bool> {
        Ok(self.list_flat(false).await?.iter().any(|m| m.id == model_id))
    }

    /// Grouped listing: one entry per canonical display name, with provider options
    /// sorted `open_code_zen` first, then `openrouter`, then `ollama`.
    pub async fn list_grouped(&self, force_refresh: bool) -> anyhow::Result<Vec<GroupedModel>> {
        let flat = self.list_flat(force_refresh).await?;
        let mut groups: Vec<GroupedModel> = Vec::new();

        for model in flat {
            if let Some(existing) = groups.iter_mut().find(|g| g.name == model.display_name) {
                existing.providers.push(ProviderOption {
                    id: model.id,
                    source: model.source,
                    is_free: model.is_free,
                });
            } else {
                groups.push(GroupedModel {
                    id: model.display_name.clone(),
                    name: model.display_name,
                    capabilities: model.capabilities,
                    providers: vec![ProviderOption {
                        id: model.id,
                        source: model.source,
                        is_free: model.is_free,
                    }],
                });
            }
        }

        for group in &mut groups {
            group
                .providers
                .sort_by_key(|p| p.source.grouped_priority());
        }

        Ok(groups)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderOption {
    pub id: String,
    pub source: Source,
    pub is_free: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupedModel {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub providers: Vec<ProviderOption>,
}

#[derive(serde::Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(serde::Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(serde::Deserialize)]
struct OpenRouterModelsResponse {
    data: Vec<OpenRouterModel>,
}

#[derive(serde::Deserialize)]
struct OpenRouterModel {
    id: String,
    name: Option<String>,
    pricing: OpenRouterPricing,
}

#[derive(serde::Deserialize)]
struct OpenRouterPricing {
    prompt: String,
    completion: String,
}

/// Split a catalog id into its source and the bare upstream model name,
/// the inverse of the `{source}/{name}` construction each `refresh_*`
/// does above.
pub fn parse_model_id(id: &str) -> Option<(Source, &str)> {
    if let Some(rest) = id.strip_prefix("ollama/") {
        Some((Source::Ollama, rest))
    } else if let Some(rest) = id.strip_prefix("open_code_zen/") {
        Some((Source::OpenCodeZen, rest))
    } else if let Some(rest) = id.strip_prefix("openrouter/") {
        Some((Source::OpenRouter, rest))
    } else {
        None
    }
}

/// The OpenCode Zen "beta free" allow-list. Hard-coded per the open question in
/// the design notes: whether to refresh it dynamically is unresolved upstream,
/// so this gateway treats it as a build-time constant, same as the source does.
fn default_opencode_zen_allow_list() -> Vec<(String, String)> {
    vec![
        ("grok-code".to_string(), "Grok Code (Zen Beta)".to_string()),
        ("glm-4.6".to_string(), "GLM 4.6 (Zen Beta)".to_string()),
        ("qwen3-coder".to_string(), "Qwen3 Coder (Zen Beta)".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, display_name: &str, source: Source, is_free: bool) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            display_name: display_name.to_string(),
            source,
            capabilities: vec!["chat".to_string()],
            is_free,
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn source_priority_orders_ollama_before_opencode_zen_before_openrouter() {
        assert!(Source::Ollama.priority() < Source::OpenCodeZen.priority());
        assert!(Source::OpenCodeZen.priority() < Source::OpenRouter.priority());
    }

    #[test]
    fn grouped_priority_orders_opencode_zen_before_openrouter_before_ollama() {
        assert!(Source::OpenCodeZen.grouped_priority() < Source::OpenRouter.grouped_priority());
        assert!(Source::OpenRouter.grouped_priority() < Source::Ollama.grouped_priority());
    }

    #[test]
    fn non_free_descriptor_is_excluded_by_construction_check() {
        let paid = descriptor("openrouter/x", "X", Source::OpenRouter, false);
        assert!(!paid.is_free);
    }

    #[test]
    fn parse_model_id_splits_source_and_name() {
        assert_eq!(parse_model_id("ollama/llama3"), Some((Source::Ollama, "llama3")));
        assert_eq!(
            parse_model_id("open_code_zen/grok-code"),
            Some((Source::OpenCodeZen, "grok-code"))
        );
        assert_eq!(
            parse_model_id("openrouter/foo/bar"),
            Some((Source::OpenRouter, "foo/bar"))
        );
        assert_eq!(parse_model_id("unknown/x"), None);
    }
}
