//! Mapping of OpenAI generation parameters onto horde generation parameters.
use crate::models::ChatRequest;
use serde_json::{Map, Value, json};

/// Generation parameters for a single horde job.
pub type GenerationParams = Map<String, Value>;

const FALLBACK_MAX_LENGTH: u32 = 500;
const FALLBACK_TEMPERATURE: f64 = 0.7;
const FALLBACK_TOP_P: f64 = 0.9;
const FALLBACK_TOP_K: u32 = 50;

/// The default generation parameters every job starts from.
pub fn builtin_defaults() -> GenerationParams {
    Map::from_iter([
        ("n".to_string(), json!(1)),
        ("max_length".to_string(), json!(FALLBACK_MAX_LENGTH)),
    ])
}

/// Overlays the caller's parameters onto a fresh copy of `defaults`.
///
/// Supplied values replace the default key by key (`max_tokens` lands on `max_length`). Keys the
/// caller left out keep the configured default, or a fixed fallback when the defaults don't have
/// one either. `return_type` is always forced to `"text"`.
pub fn map_params(defaults: &GenerationParams, request: &ChatRequest) -> GenerationParams {
    let mut params = defaults.clone();

    overlay(&mut params, "max_length", &request.max_tokens, json!(FALLBACK_MAX_LENGTH));
    overlay(&mut params, "temperature", &request.temperature, json!(FALLBACK_TEMPERATURE));
    overlay(&mut params, "top_p", &request.top_p, json!(FALLBACK_TOP_P));
    overlay(&mut params, "top_k", &request.top_k, json!(FALLBACK_TOP_K));
    overlay(&mut params, "seed", &request.seed, Value::Null);

    params.insert("return_type".into(), json!("text"));
    params
}

/// Supplied values are inserted verbatim, `null` included; they are not type-checked here.
fn overlay(params: &mut GenerationParams, key: &str, supplied: &Option<Value>, fallback: Value) {
    match supplied {
        Some(value) => {
            params.insert(key.to_owned(), value.clone());
        }
        None => {
            params.entry(key).or_insert(fallback);
        }
    }
}
