//! Immutable runtime settings shared by every request.
//!
//! Built once at startup (see the binary's `Config`) and handed out behind an `Arc`. Nothing in
//! here is ever mutated after construction; per-request values are derived into fresh copies.
use crate::horde::PollPolicy;
use crate::params::{GenerationParams, builtin_defaults};
use anyhow::anyhow;
use bon::Builder;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

pub const DEFAULT_UPSTREAM_URL: &str = "https://aihorde.net/api/v2";

/// The horde blocks requests carrying default HTTP client user agents.
pub const HORDE_USER_AGENT: &str = "Mozilla/5.0";

/// Fields of the async generation body that request settings must never replace.
const RESERVED_REQUEST_KEYS: &[&str] = &["prompt", "params", "models"];

#[derive(Debug, Clone, Builder)]
pub struct HordeSettings {
    #[builder(default = default_upstream_url())]
    pub upstream_url: Url,
    #[builder(default = 2048)]
    pub max_prompt_length: usize,
    /// Models used when a request asks for the `list` model.
    #[builder(default)]
    pub predefined_models: Vec<String>,
    #[builder(default = builtin_defaults())]
    pub default_params: GenerationParams,
    /// Extra top-level fields of every async generation request (`trusted_workers`, `nsfw`, ...).
    #[builder(default)]
    pub request_settings: Map<String, Value>,
    #[builder(default)]
    pub poll_policy: PollPolicy,
    /// Upper bound on waiting for the response head of any single upstream call.
    #[builder(default = Duration::from_secs(60))]
    pub request_timeout: Duration,
    #[builder(into, default = HORDE_USER_AGENT.to_string())]
    pub user_agent: String,
}

impl Default for HordeSettings {
    fn default() -> Self {
        HordeSettings::builder().build()
    }
}

fn default_upstream_url() -> Url {
    Url::parse(DEFAULT_UPSTREAM_URL).expect("default upstream URL is valid")
}

impl HordeSettings {
    /// Joins `path` onto the upstream base URL, keeping any path prefix of the base.
    pub fn endpoint(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.upstream_url.clone();

        let base = url.path().trim_end_matches('/').to_owned();
        let path = path.trim_start_matches('/');
        url.set_path(&format!("{base}/{path}"));
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }
}

/// Contents of the optional defaults file.
///
/// ```json
/// { "params": { "max_length": 300, "rep_pen": 1.1 }, "settings": { "trusted_workers": true } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HordeDefaults {
    #[serde(default = "builtin_defaults")]
    pub params: GenerationParams,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl HordeDefaults {
    pub async fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read defaults file {}: {}", path.display(), e))?;

        let defaults = Self::from_json(&contents)
            .map_err(|e| anyhow!("Failed to parse defaults file {}: {}", path.display(), e))?;

        info!(
            "Loaded {} default params and {} request settings from {}",
            defaults.params.len(),
            defaults.settings.len(),
            path.display()
        );
        Ok(defaults)
    }

    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let mut defaults: HordeDefaults = serde_json::from_str(contents)?;
        for key in RESERVED_REQUEST_KEYS {
            if defaults.settings.remove(*key).is_some() {
                warn!("Ignoring reserved request setting '{}' in defaults file", key);
            }
        }
        Ok(defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_keeps_base_path() {
        let settings = HordeSettings::default();
        assert_eq!(
            settings.endpoint("/generate/text/async", None).as_str(),
            "https://aihorde.net/api/v2/generate/text/async"
        );
    }

    #[test]
    fn test_endpoint_with_trailing_slash_base_and_query() {
        let settings = HordeSettings::builder()
            .upstream_url("http://localhost:7001/api/".parse().unwrap())
            .build();
        assert_eq!(
            settings.endpoint("status/heartbeat", Some("a=1&b=2")).as_str(),
            "http://localhost:7001/api/status/heartbeat?a=1&b=2"
        );
        assert_eq!(
            settings.endpoint("status/heartbeat", Some("")).as_str(),
            "http://localhost:7001/api/status/heartbeat"
        );
    }

    #[test]
    fn test_builder_defaults() {
        let settings = HordeSettings::default();
        assert_eq!(settings.max_prompt_length, 2048);
        assert!(settings.predefined_models.is_empty());
        assert_eq!(settings.default_params, builtin_defaults());
        assert_eq!(settings.user_agent, HORDE_USER_AGENT);
        assert_eq!(settings.poll_policy, PollPolicy::default());
    }

    #[test]
    fn test_defaults_file_drops_reserved_settings() {
        let defaults = HordeDefaults::from_json(
            &json!({
                "params": {"max_length": 300},
                "settings": {"trusted_workers": true, "prompt": "hijack", "models": []}
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(defaults.params["max_length"], json!(300));
        assert_eq!(defaults.settings.len(), 1);
        assert_eq!(defaults.settings["trusted_workers"], json!(true));
    }

    #[test]
    fn test_defaults_file_without_params_uses_builtins() {
        let defaults = HordeDefaults::from_json("{}").unwrap();
        assert_eq!(defaults.params, builtin_defaults());
        assert!(defaults.settings.is_empty());
    }

    #[tokio::test]
    async fn test_defaults_file_missing() {
        let result = HordeDefaults::from_file(Path::new("/nonexistent/defaults.json")).await;
        assert!(result.is_err());
    }
}
