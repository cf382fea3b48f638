/// Axum handler for the translated chat completions route
use crate::AppState;
use crate::auth::BearerToken;
use crate::client::HttpClient;
use crate::errors::GatewayError;
use crate::horde::HordeApi;
use crate::models::{ChatRequest, ChatResponse};
use crate::params::map_params;
use crate::prompt::build_prompt;
use crate::resolver::resolve_models;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use tracing::{debug, info, instrument};

/// Translates an OpenAI chat completion into a horde async job, waits for it, and answers in the
/// OpenAI shape.
///
/// The bearer token is checked before the body is parsed, and nothing reaches the horde until the
/// body has a model and at least one message.
#[instrument(skip_all)]
pub async fn chat_completions<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    BearerToken(api_key): BearerToken,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, GatewayError> {
    let Json(request) = payload.map_err(|e| {
        GatewayError::MalformedRequest(format!("Request must be JSON: {}", e.body_text()))
    })?;

    let model = request.model.as_deref().filter(|model| !model.is_empty());
    let messages = request
        .messages
        .as_deref()
        .filter(|messages| !messages.is_empty());
    let (Some(model), Some(messages)) = (model, messages) else {
        return Err(GatewayError::MalformedRequest(
            "Missing 'model' or 'messages' in request body".into(),
        ));
    };
    info!(model, messages = messages.len(), "Received chat completion request");

    let models = resolve_models(&state.http_client, &state.settings, model).await?;
    let prompt = build_prompt(messages, state.settings.max_prompt_length);
    let params = map_params(&state.settings.default_params, &request);

    let api = HordeApi::new(&state.http_client, &state.settings, &api_key);
    let completed = api.generate(prompt, params, models).await?;

    let response =
        ChatResponse::from_generation(&completed.job.id, model, &completed.job.prompt, completed.text);
    debug!(usage = ?response.usage, "Sending chat completion response");
    Ok(Json(response))
}
