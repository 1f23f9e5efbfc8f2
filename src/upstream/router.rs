//! Model routing
//!
//! Resolves a model name to a provider: explicit map first, then the
//! provider model lists by priority, then a name-prefix match, then the
//! configured default. Also produces the ordered fallback list used by
//! the dispatcher.

use crate::config::{ProviderConfig, RouterConfig, Settings};
use crate::error::{ProxyError, ProxyResult};

pub struct Router {
    config: RouterConfig,
    providers: Vec<ProviderConfig>,
}

impl Router {
    pub fn from_settings(settings: &Settings) -> Self {
        Router {
            config: settings.router.clone(),
            providers: settings.providers.clone(),
        }
    }

    fn enabled_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.enabled && p.name.eq_ignore_ascii_case(name))
    }

    /// Resolve a model to its primary provider.
    pub fn resolve(&self, model: &str) -> ProxyResult<ProviderConfig> {
        if let Some(name) = self.config.model_map.get(model) {
            if let Some(provider) = self.enabled_provider(name) {
                return Ok(provider.clone());
            }
        }

        // min-priority scan over providers that list the model; iteration
        // order breaks ties, so the scan is stable
        let mut best: Option<&ProviderConfig> = None;
        for provider in self.providers.iter().filter(|p| p.enabled) {
            if !provider.supports_model(model) {
                continue;
            }
            match best {
                Some(current) if current.priority <= provider.priority => {}
                _ => best = Some(provider),
            }
        }
        if let Some(provider) = best {
            return Ok(provider.clone());
        }

        // length-prefix match: a provider named "claude" catches every
        // "claude-*" model
        let mut best: Option<&ProviderConfig> = None;
        for provider in self.providers.iter().filter(|p| p.enabled) {
            if provider.name.len() >= model.len() || !model.starts_with(&provider.name) {
                continue;
            }
            match best {
                Some(current) if current.priority <= provider.priority => {}
                _ => best = Some(provider),
            }
        }
        if let Some(provider) = best {
            return Ok(provider.clone());
        }

        if let Some(name) = &self.config.default_provider {
            if let Some(provider) = self.enabled_provider(name) {
                return Ok(provider.clone());
            }
        }

        Err(ProxyError::NoProviderForModel(model.to_string()))
    }

    /// Primary first, then every other enabled provider that supports the
    /// model or declares no model list at all, ascending by priority.
    /// With fallback disabled the list is just the primary.
    pub fn fallback_list(&self, model: &str) -> ProxyResult<Vec<ProviderConfig>> {
        let primary = self.resolve(model)?;
        if !self.config.fallback {
            return Ok(vec![primary]);
        }
        let mut rest: Vec<ProviderConfig> = self
            .providers
            .iter()
            .filter(|p| p.enabled && p.name != primary.name)
            .filter(|p| p.models.is_empty() || p.supports_model(model))
            .cloned()
            .collect();
        rest.sort_by_key(|p| p.priority);
        let mut list = vec![primary];
        list.extend(rest);
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiFormat;
    use std::collections::HashMap;

    fn provider(name: &str, models: &[&str], priority: i32, enabled: bool) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            base_url: format!("https://{}.example", name),
            api_key: String::new(),
            format: ApiFormat::OpenAI,
            models: models.iter().map(|m| m.to_string()).collect(),
            enabled,
            priority,
            timeout_secs: 60,
        }
    }

    fn router(config: RouterConfig, providers: Vec<ProviderConfig>) -> Router {
        Router { config, providers }
    }

    #[test]
    fn explicit_map_wins() {
        let mut model_map = HashMap::new();
        model_map.insert("gpt-4o".to_string(), "special".to_string());
        let r = router(
            RouterConfig {
                model_map,
                default_provider: None,
                fallback: false,
            },
            vec![
                provider("openai", &["gpt-4o"], 0, true),
                provider("special", &[], 10, true),
            ],
        );
        assert_eq!(r.resolve("gpt-4o").unwrap().name, "special");
    }

    #[test]
    fn lowest_priority_value_wins_model_scan() {
        let r = router(
            RouterConfig::default(),
            vec![
                provider("backup", &["gpt-4o"], 5, true),
                provider("primary", &["gpt-4o"], 1, true),
            ],
        );
        assert_eq!(r.resolve("gpt-4o").unwrap().name, "primary");
    }

    #[test]
    fn disabled_providers_are_invisible() {
        let r = router(
            RouterConfig::default(),
            vec![provider("openai", &["gpt-4o"], 0, false)],
        );
        assert!(matches!(
            r.resolve("gpt-4o"),
            Err(ProxyError::NoProviderForModel(_))
        ));
    }

    #[test]
    fn prefix_match_catches_model_families() {
        let r = router(
            RouterConfig::default(),
            vec![provider("claude", &[], 0, true)],
        );
        assert_eq!(r.resolve("claude-sonnet-4-20250514").unwrap().name, "claude");
    }

    #[test]
    fn default_provider_is_last_resort() {
        let r = router(
            RouterConfig {
                model_map: HashMap::new(),
                default_provider: Some("fallback".to_string()),
                fallback: false,
            },
            vec![provider("fallback", &[], 0, true)],
        );
        assert_eq!(r.resolve("whatever-model").unwrap().name, "fallback");
    }

    #[test]
    fn fallback_list_orders_by_priority() {
        let r = router(
            RouterConfig {
                model_map: HashMap::new(),
                default_provider: None,
                fallback: true,
            },
            vec![
                provider("primary", &["gpt-4o"], 0, true),
                provider("open-models", &[], 3, true),
                provider("secondary", &["gpt-4o"], 1, true),
                provider("unrelated", &["claude-3"], 2, true),
                provider("disabled", &[], 0, false),
            ],
        );
        let list = r.fallback_list("gpt-4o").unwrap();
        let names: Vec<_> = list.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["primary", "secondary", "open-models"]);
    }
}
