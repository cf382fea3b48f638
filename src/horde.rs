//! Asynchronous job orchestration against the horde text generation API.
//!
//! A job goes `Submitted -> Polling -> {Completed | TimedOut | Failed}` and is never revisited
//! once terminal. The poll loop runs inside the caller's request future: when the client
//! disconnects, axum drops that future and polling stops with it.
use crate::client::{HttpClient, send_for_bytes};
use crate::errors::GatewayError;
use crate::models::{HordeAsyncResponse, HordeGenerationRequest, HordeJobStatus};
use crate::params::GenerationParams;
use crate::resolver::TargetModelSet;
use crate::settings::HordeSettings;
use axum::body::{Body, Bytes};
use axum::http::{Method, StatusCode, header};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

const ASYNC_GENERATE_PATH: &str = "generate/text/async";
const STATUS_PATH: &str = "generate/text/status";
const APIKEY_HEADER: &str = "apikey";

/// How often to poll a job and how long to wait for it before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Polling,
    Completed,
    TimedOut,
    Failed,
}

/// One in-flight generation on the horde.
#[derive(Debug, Clone)]
pub struct UpstreamJob {
    pub id: String,
    pub submitted_at: Instant,
    pub models: TargetModelSet,
    pub params: GenerationParams,
    pub prompt: String,
}

/// A job that reached `Completed`, with the text of its first generation.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub job: UpstreamJob,
    pub text: String,
}

/// Client for the horde's async text endpoints, acting on behalf of one caller.
pub struct HordeApi<'a, T: HttpClient + ?Sized> {
    client: &'a T,
    settings: &'a HordeSettings,
    api_key: &'a str,
}

impl<'a, T: HttpClient + ?Sized> HordeApi<'a, T> {
    pub fn new(client: &'a T, settings: &'a HordeSettings, api_key: &'a str) -> Self {
        Self {
            client,
            settings,
            api_key,
        }
    }

    /// Submits a job and polls it to a terminal state.
    pub async fn generate(
        &self,
        prompt: String,
        params: GenerationParams,
        models: TargetModelSet,
    ) -> Result<CompletedJob, GatewayError> {
        let job = self.submit(prompt, params, models).await?;
        let text = self.wait_for_completion(&job).await?;
        Ok(CompletedJob { job, text })
    }

    #[instrument(skip_all, fields(models = ?models.as_slice()))]
    pub async fn submit(
        &self,
        prompt: String,
        params: GenerationParams,
        models: TargetModelSet,
    ) -> Result<UpstreamJob, GatewayError> {
        let payload = HordeGenerationRequest {
            prompt: &prompt,
            params: &params,
            models: models.as_slice(),
            settings: &self.settings.request_settings,
        };
        let body = serde_json::to_vec(&payload).map_err(|e| GatewayError::SubmissionFailed {
            details: e.to_string(),
        })?;
        debug!("Sending to Horde: {}", String::from_utf8_lossy(&body));

        let (status, body) = self
            .send(Method::POST, ASYNC_GENERATE_PATH, Body::from(body))
            .await?;
        if !status.is_success() {
            return Err(GatewayError::SubmissionFailed {
                details: describe_failure(status, &body),
            });
        }

        let accepted: HordeAsyncResponse =
            serde_json::from_slice(&body).map_err(|e| GatewayError::SubmissionFailed {
                details: format!("unreadable submission response: {e}"),
            })?;
        let id = accepted
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::SubmissionFailed {
                details: "Failed to get generation ID from Horde".into(),
            })?;

        info!(job_id = %id, kudos = ?accepted.kudos, state = ?JobState::Submitted, "Job submitted");
        Ok(UpstreamJob {
            id,
            submitted_at: Instant::now(),
            models,
            params,
            prompt,
        })
    }

    /// Fetches the current status of a job once.
    pub async fn poll_status(&self, job_id: &str) -> Result<HordeJobStatus, GatewayError> {
        let path = format!("{STATUS_PATH}/{job_id}");
        let (status, body) = self.send(Method::GET, &path, Body::empty()).await?;
        if !status.is_success() {
            return Err(GatewayError::upstream(describe_failure(status, &body)));
        }
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::upstream(format!("unreadable job status: {e}")))
    }

    /// Polls `job` every `interval` until it is done, faulted, failing, or past its deadline.
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn wait_for_completion(&self, job: &UpstreamJob) -> Result<String, GatewayError> {
        let policy = self.settings.poll_policy;
        let deadline = job.submitted_at + policy.timeout;
        let mut polls = 0u32;

        while Instant::now() < deadline {
            polls += 1;
            // A stalled status call must not outlive the generation deadline.
            let status = match tokio::time::timeout_at(deadline, self.poll_status(&job.id)).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!(polls, state = ?JobState::Failed, "Polling failed");
                    return Err(e);
                }
                Err(_) => break,
            };

            if status.done {
                let generation = status.generations.into_iter().next().ok_or_else(|| {
                    warn!(polls, state = ?JobState::Failed, "Job finished without generations");
                    GatewayError::upstream("Horde reported the job done without any generations")
                })?;
                info!(
                    polls,
                    model = ?generation.model,
                    worker = ?generation.worker_name,
                    state = ?JobState::Completed,
                    "Job completed"
                );
                debug!("Generated text from Horde: {}", generation.text);
                return Ok(generation.text);
            }

            if status.faulted {
                warn!(polls, state = ?JobState::Failed, "Job faulted on the horde");
                return Err(GatewayError::upstream("Horde reported the job as faulted"));
            }

            debug!(
                polls,
                wait_time = ?status.wait_time,
                queue_position = ?status.queue_position,
                state = ?JobState::Polling,
                "Job not done yet"
            );
            tokio::time::sleep(policy.interval).await;
        }

        warn!(polls, timeout = ?policy.timeout, state = ?JobState::TimedOut, "Job timed out");
        Err(GatewayError::GenerationTimedOut {
            job_id: job.id.clone(),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Body,
    ) -> Result<(StatusCode, Bytes), GatewayError> {
        let url = self.settings.endpoint(path, None);
        let request = axum::http::Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(APIKEY_HEADER, self.api_key)
            .header(header::USER_AGENT, &self.settings.user_agent)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .map_err(GatewayError::upstream)?;

        send_for_bytes(self.client, request, self.settings.request_timeout)
            .await
            .map_err(GatewayError::upstream)
    }
}

fn describe_failure(status: StatusCode, body: &[u8]) -> String {
    format!(
        "upstream returned {}: {}",
        status,
        String::from_utf8_lossy(body)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHttpClient, json_response, scripted_horde};
    use serde_json::json;

    fn fast_settings(timeout: Duration) -> HordeSettings {
        HordeSettings::builder()
            .poll_policy(PollPolicy {
                interval: Duration::from_millis(1),
                timeout,
            })
            .build()
    }

    fn models() -> TargetModelSet {
        TargetModelSet::new(vec!["m1".to_string()]).unwrap()
    }

    fn pending() -> serde_json::Value {
        json!({"done": false, "faulted": false, "wait_time": 3, "queue_position": 1})
    }

    #[tokio::test]
    async fn test_done_on_third_poll_stops_polling() {
        let client = scripted_horde(
            json!({}),
            "abc123",
            vec![
                pending(),
                pending(),
                json!({"done": true, "generations": [{"text": "Hello", "model": "m1"}]}),
                json!({"done": true, "generations": [{"text": "Too late"}]}),
            ],
        );
        let settings = fast_settings(Duration::from_secs(5));
        let api = HordeApi::new(&client, &settings, "key");

        let completed = api
            .generate("User: hi".into(), Default::default(), models())
            .await
            .unwrap();

        assert_eq!(completed.job.id, "abc123");
        assert_eq!(completed.text, "Hello");
        assert_eq!(client.requests_to("/generate/text/status/abc123").len(), 3);
    }

    #[tokio::test]
    async fn test_submission_carries_key_user_agent_and_payload() {
        let client = scripted_horde(
            json!({}),
            "job-1",
            vec![json!({"done": true, "generations": [{"text": "ok"}]})],
        );
        let settings = HordeSettings::builder()
            .request_settings(serde_json::Map::from_iter([(
                "trusted_workers".to_string(),
                json!(true),
            )]))
            .build();
        let api = HordeApi::new(&client, &settings, "secret-key");

        let params = serde_json::Map::from_iter([("n".to_string(), json!(1))]);
        api.generate("User: hi".into(), params, models())
            .await
            .unwrap();

        let submissions = client.requests_to("/generate/text/async");
        assert_eq!(submissions.len(), 1);
        let submission = &submissions[0];
        assert_eq!(submission.method, "POST");
        assert_eq!(
            submission.uri,
            "https://aihorde.net/api/v2/generate/text/async"
        );
        assert_eq!(submission.header("apikey"), Some("secret-key"));
        assert_eq!(
            submission.header("user-agent"),
            Some(crate::settings::HORDE_USER_AGENT)
        );

        let body: serde_json::Value = serde_json::from_slice(&submission.body).unwrap();
        assert_eq!(
            body,
            json!({
                "prompt": "User: hi",
                "params": {"n": 1},
                "models": ["m1"],
                "trusted_workers": true
            })
        );

        let polls = client.requests_to("/generate/text/status/job-1");
        assert_eq!(polls[0].header("apikey"), Some("secret-key"));
    }

    #[tokio::test]
    async fn test_never_done_times_out() {
        let client = scripted_horde(json!({}), "slow", vec![pending()]);
        let settings = fast_settings(Duration::from_millis(30));
        let api = HordeApi::new(&client, &settings, "key");

        let err = api
            .generate("User: hi".into(), Default::default(), models())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::GenerationTimedOut { ref job_id } if job_id == "slow"));
        assert!(!client.requests_to("/generate/text/status/slow").is_empty());
    }

    /// Accepts jobs instantly but never answers a status request.
    #[derive(Debug, Clone)]
    struct StalledStatusClient;

    #[async_trait::async_trait]
    impl HttpClient for StalledStatusClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, crate::client::BoxError> {
            if req.uri().path().ends_with(ASYNC_GENERATE_PATH) {
                return Ok(json_response(StatusCode::ACCEPTED, json!({"id": "stalled"})));
            }
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_poll_is_cut_at_generation_deadline() {
        let settings = HordeSettings::builder()
            .poll_policy(PollPolicy {
                interval: Duration::from_millis(1),
                timeout: Duration::from_millis(50),
            })
            .request_timeout(Duration::from_secs(60))
            .build();
        let api = HordeApi::new(&StalledStatusClient, &settings, "key");

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            api.generate("User: hi".into(), Default::default(), models()),
        )
        .await
        .expect("poll loop should stop at the generation deadline");

        assert!(matches!(
            result,
            Err(GatewayError::GenerationTimedOut { job_id }) if job_id == "stalled"
        ));
    }

    #[tokio::test]
    async fn test_submission_rejected_by_upstream() {
        let client = MockHttpClient::new(StatusCode::BAD_REQUEST, r#"{"message": "No models"}"#);
        let settings = fast_settings(Duration::from_secs(1));
        let api = HordeApi::new(&client, &settings, "key");

        let err = api
            .submit("User: hi".into(), Default::default(), models())
            .await
            .unwrap_err();

        match err {
            GatewayError::SubmissionFailed { details } => {
                assert!(details.contains("400"));
                assert!(details.contains("No models"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submission_without_id_fails() {
        let client = MockHttpClient::new(StatusCode::ACCEPTED, r#"{"kudos": 10}"#);
        let settings = fast_settings(Duration::from_secs(1));
        let api = HordeApi::new(&client, &settings, "key");

        let err = api
            .submit("User: hi".into(), Default::default(), models())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SubmissionFailed { .. }));
    }

    #[tokio::test]
    async fn test_failed_poll_is_not_retried() {
        let client = MockHttpClient::with_responder(|request| {
            if request.uri.ends_with("/generate/text/async") {
                Ok(json_response(StatusCode::ACCEPTED, json!({"id": "j"})))
            } else {
                Err("connection reset".to_string())
            }
        });
        let settings = fast_settings(Duration::from_secs(5));
        let api = HordeApi::new(&client, &settings, "key");

        let err = api
            .generate("User: hi".into(), Default::default(), models())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UpstreamRequestFailed { .. }));
        assert_eq!(client.requests_to("/generate/text/status/j").len(), 1);
    }

    #[tokio::test]
    async fn test_poll_error_status_fails() {
        let client = MockHttpClient::with_responder(|request| {
            if request.uri.ends_with("/generate/text/async") {
                Ok(json_response(StatusCode::ACCEPTED, json!({"id": "gone"})))
            } else {
                Ok(json_response(StatusCode::NOT_FOUND, json!({"message": "not found"})))
            }
        });
        let settings = fast_settings(Duration::from_secs(5));
        let api = HordeApi::new(&client, &settings, "key");

        let err = api
            .generate("User: hi".into(), Default::default(), models())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamRequestFailed { .. }));
    }

    #[tokio::test]
    async fn test_done_without_generations_fails() {
        let client = scripted_horde(json!({}), "empty", vec![json!({"done": true, "generations": []})]);
        let settings = fast_settings(Duration::from_secs(5));
        let api = HordeApi::new(&client, &settings, "key");

        let err = api
            .generate("User: hi".into(), Default::default(), models())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamRequestFailed { .. }));
    }

    #[tokio::test]
    async fn test_faulted_job_fails_before_deadline() {
        let client = scripted_horde(json!({}), "bad", vec![json!({"done": false, "faulted": true})]);
        let settings = fast_settings(Duration::from_secs(60));
        let api = HordeApi::new(&client, &settings, "key");

        let err = api
            .generate("User: hi".into(), Default::default(), models())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamRequestFailed { .. }));
        assert_eq!(client.requests_to("/generate/text/status/bad").len(), 1);
    }
}
