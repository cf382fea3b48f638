//! Resolution of the caller's `model` field into the horde models a job is submitted against.
use crate::client::{HttpClient, send_for_bytes};
use crate::errors::GatewayError;
use crate::settings::HordeSettings;
use axum::body::Body;
use axum::http::{Method, header};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

/// Asks for up to [`ACTIVE_MODEL_CAP`] models that currently have active workers.
pub const FETCH_ACTIVE_KEYWORD: &str = "random";
const FETCH_ACTIVE_ALIASES: &[&str] = &[FETCH_ACTIVE_KEYWORD, "any_text_model"];

/// Asks for the statically configured model list.
pub const PREDEFINED_LIST_KEYWORD: &str = "list";

/// First N active models, in whatever order the horde lists them. Not a ranking.
pub const ACTIVE_MODEL_CAP: usize = 10;

const MODEL_STATS_PATH: &str = "stats/text/models";

/// A non-empty list of upstream model names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetModelSet(Vec<String>);

impl TargetModelSet {
    /// Returns `None` for an empty list.
    pub fn new(models: Vec<String>) -> Option<Self> {
        if models.is_empty() {
            None
        } else {
            Some(Self(models))
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// How a requested model identifier is to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSelector<'a> {
    FetchActive,
    PredefinedList,
    Single(&'a str),
}

impl<'a> ModelSelector<'a> {
    pub fn parse(model: &'a str) -> Self {
        if FETCH_ACTIVE_ALIASES.contains(&model) {
            ModelSelector::FetchActive
        } else if model == PREDEFINED_LIST_KEYWORD {
            ModelSelector::PredefinedList
        } else {
            ModelSelector::Single(model)
        }
    }
}

/// Resolves `model` into the set of horde models to submit against.
///
/// Single model names are passed through unchecked; an unknown name surfaces later as an
/// upstream submission error.
#[instrument(skip(client, settings))]
pub async fn resolve_models<T: HttpClient + ?Sized>(
    client: &T,
    settings: &HordeSettings,
    model: &str,
) -> Result<TargetModelSet, GatewayError> {
    match ModelSelector::parse(model) {
        ModelSelector::FetchActive => {
            info!("Special model name '{}' detected, fetching available models", model);
            let models = fetch_active_models(client, settings).await;
            TargetModelSet::new(models).ok_or(GatewayError::NoAvailableModels)
        }
        ModelSelector::PredefinedList => {
            info!("Special model name '{}' detected, using predefined model list", model);
            TargetModelSet::new(settings.predefined_models.clone()).ok_or_else(|| {
                GatewayError::ConfigurationError(format!(
                    "The predefined model list is empty but the '{PREDEFINED_LIST_KEYWORD}' model was requested"
                ))
            })
        }
        ModelSelector::Single(name) => Ok(TargetModelSet(vec![name.to_owned()])),
    }
}

/// Queries the horde's model statistics. Any failure is logged and yields no models.
async fn fetch_active_models<T: HttpClient + ?Sized>(
    client: &T,
    settings: &HordeSettings,
) -> Vec<String> {
    let url = settings.endpoint(MODEL_STATS_PATH, None);
    let request = match axum::http::Request::builder()
        .method(Method::GET)
        .uri(url.as_str())
        .header(header::USER_AGENT, &settings.user_agent)
        .body(Body::empty())
    {
        Ok(request) => request,
        Err(e) => {
            error!("Failed to build model stats request: {}", e);
            return Vec::new();
        }
    };

    let stats = match send_for_bytes(client, request, settings.request_timeout).await {
        Ok((status, body)) if status.is_success() => serde_json::from_slice::<Value>(&body)
            .map_err(|e| format!("unreadable model stats: {e}")),
        Ok((status, _)) => Err(format!("model stats returned {status}")),
        Err(e) => Err(e.to_string()),
    };

    match stats {
        Ok(stats) => {
            let models = active_models_from_stats(&stats, ACTIVE_MODEL_CAP);
            debug!("Available text models from Horde: {:?}", models);
            models
        }
        Err(e) => {
            error!("Failed to fetch models from Horde: {}", e);
            Vec::new()
        }
    }
}

/// Flattens `{bucket: {model: active_count}}` into the names with a positive count.
///
/// Duplicates across buckets are dropped, keeping the first occurrence; at most `cap` names are
/// returned. Malformed buckets or counts are skipped.
pub fn active_models_from_stats(stats: &Value, cap: usize) -> Vec<String> {
    let mut models: Vec<String> = Vec::new();

    let buckets = stats.as_object().into_iter().flat_map(|b| b.values());
    for bucket in buckets.filter_map(Value::as_object) {
        for (name, count) in bucket {
            if models.len() == cap {
                return models;
            }
            let active = count.as_f64().is_some_and(|count| count > 0.0);
            if active && !models.iter().any(|m| m == name) {
                models.push(name.clone());
            }
        }
    }
    models
}
