use std::time::Duration;

use flux_contracts::config::{ApiKey, Environment, DEFAULT_API_BASE};
use flux_contracts::logging::Logger;
use flux_contracts::redact::scrub_secret;
use flux_contracts::tasks::{SubmittedTask, TaskSnapshot};
use reqwest::Url;
use serde_json::Value;

use crate::error::{truncate_text, ApiError};
use crate::payload::GenerationRequest;
use crate::poller::TaskSource;
use crate::transport::{
    HttpMethod, HttpReply, HttpRequest, HttpTransport, ReqwestTransport, DEFAULT_REDIRECT_LIMIT,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: String,
    pub api_key: ApiKey,
    pub environment: Environment,
    /// Per-call limit; kept well under the poll session timeout.
    pub request_timeout: Duration,
    pub download_timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_key: ApiKey) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key,
            environment: Environment::Development,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Authenticated client for the generation API.
pub struct FluxClient<T: HttpTransport = ReqwestTransport> {
    config: ClientConfig,
    transport: T,
    logger: Logger,
}

impl FluxClient<ReqwestTransport> {
    pub fn new(config: ClientConfig, logger: Logger) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(DEFAULT_REDIRECT_LIMIT)
            .map_err(|err| ApiError::from_transport(err, config.environment))?;
        Ok(Self::with_transport(config, transport, logger))
    }
}

impl<T: HttpTransport> FluxClient<T> {
    pub fn with_transport(config: ClientConfig, transport: T, logger: Logger) -> Self {
        logger.debug(format!(
            "client ready: base={} key={} (from {})",
            config.api_base,
            config.api_key.redacted(),
            config.api_key.source()
        ));
        Self {
            config,
            transport,
            logger,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Absolute `http(s)://` endpoints are used as-is, anything else is
    /// joined onto the API base.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        let trimmed = endpoint.trim();
        let lowered = trimmed.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            return trimmed.to_string();
        }
        format!("{}/{}", self.config.api_base, trimmed.trim_start_matches('/'))
    }

    pub fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint_url(endpoint);
        let request = HttpRequest {
            method,
            url: url.clone(),
            headers: vec![
                ("accept".to_string(), "application/json".to_string()),
                (
                    "x-key".to_string(),
                    self.config.api_key.expose().to_string(),
                ),
            ],
            body: body.cloned(),
            timeout: self.config.request_timeout,
        };
        self.logger.debug(format!(
            "{} {url} (x-key {})",
            method.as_str(),
            self.config.api_key.redacted()
        ));
        let reply = self.send(&request)?;
        self.decode_json(method, &url, &reply)
    }

    pub fn submit(&self, model: &str, request: &GenerationRequest) -> Result<SubmittedTask, ApiError> {
        let body = request.to_payload().map_err(|err| ApiError::Decode {
            message: format!("failed to encode request: {err}"),
        })?;
        let payload = self.request(HttpMethod::Post, model, Some(&body))?;
        let submitted = SubmittedTask::from_payload(&payload).ok_or_else(|| ApiError::Decode {
            message: "submission response missing id".to_string(),
        })?;
        self.logger.info(format!(
            "submitted task {} to {}",
            submitted.id,
            self.endpoint_url(model)
        ));
        Ok(submitted)
    }

    /// One status fetch. A non-empty `polling_url` wins over the
    /// `get_result?id=` endpoint.
    pub fn get_result(
        &self,
        task_id: &str,
        polling_url: Option<&str>,
    ) -> Result<TaskSnapshot, ApiError> {
        let endpoint = match polling_url.map(str::trim).filter(|url| !url.is_empty()) {
            Some(url) => url.to_string(),
            None => self.status_url(task_id)?,
        };
        let payload = self.request(HttpMethod::Get, &endpoint, None)?;
        Ok(TaskSnapshot::from_payload(task_id, payload))
    }

    /// Fetches a finished artifact. Delivery URLs are pre-signed, so the API
    /// key is not sent along.
    pub fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let request = HttpRequest {
            method: HttpMethod::Get,
            url: url.trim().to_string(),
            headers: Vec::new(),
            body: None,
            timeout: self.config.download_timeout,
        };
        self.logger.debug(format!("downloading {}", request.url));
        let reply = self.send(&request)?;
        if !reply.is_success() {
            let err = self.redact(ApiError::from_status(
                reply.status,
                &reply.text(),
                self.config.environment,
            ));
            self.logger
                .warn(format!("download failed for {}: {err}", request.url));
            return Err(err);
        }
        Ok(reply.body)
    }

    fn status_url(&self, task_id: &str) -> Result<String, ApiError> {
        let base = self.endpoint_url("get_result");
        let mut url = Url::parse(&base).map_err(|_| ApiError::InvalidEndpoint {
            endpoint: base.clone(),
        })?;
        url.query_pairs_mut().append_pair("id", task_id.trim());
        Ok(url.to_string())
    }

    fn send(&self, request: &HttpRequest) -> Result<HttpReply, ApiError> {
        self.transport.send(request).map_err(|err| {
            let err = self.redact(ApiError::from_transport(err, self.config.environment));
            self.logger.warn(self.scrub(&format!(
                "{} {} failed: {err}",
                request.method.as_str(),
                request.url
            )));
            err
        })
    }

    fn decode_json(&self, method: HttpMethod, url: &str, reply: &HttpReply) -> Result<Value, ApiError> {
        let text = reply.text();
        if !reply.is_success() {
            let err = self.redact(ApiError::from_status(
                reply.status,
                &text,
                self.config.environment,
            ));
            self.logger.warn(self.scrub(&format!(
                "{} {url} returned {}: {err}",
                method.as_str(),
                reply.status
            )));
            return Err(err);
        }
        serde_json::from_str::<Value>(&text).map_err(|err| {
            let detail = if self.config.environment.is_production() {
                "response was not valid JSON".to_string()
            } else {
                format!("{err}: {}", truncate_text(&text, 200))
            };
            self.redact(ApiError::Decode { message: detail })
        })
    }

    fn scrub(&self, line: &str) -> String {
        scrub_secret(line, self.config.api_key.expose())
    }

    /// Every error leaving the client goes through here, so callers can log
    /// or persist it as-is.
    fn redact(&self, err: ApiError) -> ApiError {
        err.redacted(self.config.api_key.expose())
    }
}

impl<T: HttpTransport> TaskSource for FluxClient<T> {
    fn fetch_task(
        &self,
        task_id: &str,
        status_endpoint: Option<&str>,
    ) -> Result<TaskSnapshot, ApiError> {
        self.get_result(task_id, status_endpoint)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use flux_contracts::config::{ApiKey, ApiKeySource, Environment};
    use flux_contracts::events::{read_events, EventWriter};
    use flux_contracts::logging::{LogLevel, Logger};
    use flux_contracts::tasks::TaskState;
    use serde_json::json;

    use super::{ClientConfig, FluxClient};
    use crate::error::{ApiError, PollFailureKind};
    use crate::payload::GenerationRequest;
    use crate::poller::{PollOptions, TaskPoller};
    use crate::transport::{
        HttpMethod, HttpReply, HttpRequest, HttpTransport, TransportError, TransportErrorKind,
    };

    const SECRET: &str = "bfl-live-0123456789-wxyz";

    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<HttpReply, TransportError>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn with(replies: Vec<Result<HttpReply, TransportError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<HttpRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn send(&self, request: &HttpRequest) -> Result<HttpReply, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::new(TransportErrorKind::Other, "no reply")))
        }
    }

    fn reply(status: u16, body: &str) -> Result<HttpReply, TransportError> {
        Ok(HttpReply {
            status,
            body: body.as_bytes().to_vec(),
        })
    }

    fn config(environment: Environment) -> ClientConfig {
        ClientConfig::new(ApiKey::new(SECRET, ApiKeySource::Explicit))
            .with_api_base("https://api.example.test/v1/")
            .with_environment(environment)
    }

    #[test]
    fn request_attaches_key_and_accept_headers() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with(vec![reply(200, "{\"ok\":true}")]);
        let client = FluxClient::with_transport(
            config(Environment::Development),
            transport,
            Logger::silent(),
        );
        let value = client.request(HttpMethod::Get, "/credits", None)?;
        assert_eq!(value, json!({"ok": true}));

        let seen = client.transport.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].url, "https://api.example.test/v1/credits");
        assert_eq!(seen[0].header("x-key"), Some(SECRET));
        assert_eq!(seen[0].header("Accept"), Some("application/json"));
        assert_eq!(seen[0].timeout, super::DEFAULT_REQUEST_TIMEOUT);
        Ok(())
    }

    #[test]
    fn submit_posts_payload_to_model_endpoint() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with(vec![reply(
            200,
            r#"{"id":"task-9","polling_url":"https://api.example.test/v1/get_result?id=task-9"}"#,
        )]);
        let client = FluxClient::with_transport(
            config(Environment::Development),
            transport,
            Logger::silent(),
        );
        let request = GenerationRequest {
            width: Some(768),
            ..GenerationRequest::new("boat")
        };
        let submitted = client.submit("flux-pro-1.1", &request)?;
        assert_eq!(submitted.id, "task-9");
        assert!(submitted.polling_url.is_some());

        let seen = client.transport.seen();
        assert_eq!(seen[0].method, HttpMethod::Post);
        assert_eq!(seen[0].url, "https://api.example.test/v1/flux-pro-1.1");
        assert_eq!(seen[0].body, Some(json!({"prompt": "boat", "width": 768})));
        Ok(())
    }

    #[test]
    fn get_result_prefers_polling_url_and_encodes_task_id() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with(vec![
            reply(200, r#"{"id":"a b","status":"Pending"}"#),
            reply(200, r#"{"id":"a b","status":"Ready","result":{"sample":"https://cdn.test/x.jpg"}}"#),
        ]);
        let client = FluxClient::with_transport(
            config(Environment::Development),
            transport,
            Logger::silent(),
        );
        let pending = client.get_result("a b", None)?;
        assert_eq!(pending.state, TaskState::Pending);
        let ready = client.get_result("a b", Some("https://eu.example.test/v1/get_result?id=a"))?;
        assert_eq!(ready.artifact.as_deref(), Some("https://cdn.test/x.jpg"));

        let seen = client.transport.seen();
        assert_eq!(seen[0].url, "https://api.example.test/v1/get_result?id=a+b");
        assert_eq!(seen[1].url, "https://eu.example.test/v1/get_result?id=a");
        Ok(())
    }

    #[test]
    fn http_statuses_surface_as_typed_errors() {
        let transport = ScriptedTransport::with(vec![
            reply(401, r#"{"detail":"Not authenticated"}"#),
            reply(503, "upstream busy"),
            reply(200, "not json"),
        ]);
        let client = FluxClient::with_transport(
            config(Environment::Development),
            transport,
            Logger::silent(),
        );
        let auth = client.get_result("t", None).unwrap_err();
        assert!(matches!(auth, ApiError::AuthenticationFailed { .. }));
        let busy = client.get_result("t", None).unwrap_err();
        assert!(busy.is_transient());
        let garbled = client.get_result("t", None).unwrap_err();
        assert!(matches!(garbled, ApiError::Decode { .. }));
    }

    #[test]
    fn logs_never_contain_the_raw_secret() {
        let transport = ScriptedTransport::with(vec![
            reply(403, &format!("{{\"detail\":\"key {SECRET} is disabled\"}}")),
            Err(TransportError::new(
                TransportErrorKind::Timeout,
                format!("timed out talking to proxy with {SECRET}"),
            )),
        ]);
        let (logger, sink) = Logger::new(LogLevel::Debug).with_memory_sink();
        let client =
            FluxClient::with_transport(config(Environment::Development), transport, logger);
        let _ = client.request(HttpMethod::Get, "get_result?id=t", None);
        let _ = client.request(HttpMethod::Get, "get_result?id=t", None);

        let messages = sink.messages();
        assert!(messages.len() >= 4);
        for message in &messages {
            assert!(!message.contains(SECRET), "leaked secret in: {message}");
        }
        assert!(messages.iter().any(|message| message.contains("***wxyz")));
    }

    #[test]
    fn echoed_secret_never_reaches_poller_logs_or_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let transport = ScriptedTransport::with(vec![
            reply(503, &format!("{{\"detail\":\"upstream saw x-key {SECRET}\"}}")),
            reply(403, &format!("{{\"detail\":\"key {SECRET} is disabled\"}}")),
        ]);
        let (logger, sink) = Logger::new(LogLevel::Debug)
            .with_events(EventWriter::new(&events_path, "run-k"))
            .with_memory_sink();
        let client = Arc::new(FluxClient::with_transport(
            config(Environment::Development),
            transport,
            logger.clone(),
        ));
        let poller = TaskPoller::new(client.clone(), logger);
        let options = PollOptions {
            backoff_cap: Some(Duration::ZERO),
            ..PollOptions::default()
        };

        let err = poller.wait_for_result("task-1", &options).unwrap_err();
        assert_eq!(err.kind(), PollFailureKind::Request);
        assert!(!err.to_string().contains(SECRET));
        assert!(err.to_string().contains("***wxyz"));

        for message in sink.messages() {
            assert!(!message.contains(SECRET), "leaked secret in log: {message}");
        }
        let events = read_events(&events_path)?;
        let types: Vec<&str> = events
            .iter()
            .map(|row| row["type"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(types, vec!["poll_started", "poll_retry", "poll_failed"]);
        for row in &events {
            assert!(!row.to_string().contains(SECRET), "leaked secret in event: {row}");
        }
        Ok(())
    }

    #[test]
    fn download_skips_api_key_and_maps_failures() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with(vec![reply(200, "JPEGDATA"), reply(404, "gone")]);
        let client = FluxClient::with_transport(
            config(Environment::Production),
            transport,
            Logger::silent(),
        );
        assert_eq!(client.download("https://cdn.test/x.jpg")?, b"JPEGDATA".to_vec());
        let err = client.download("https://cdn.test/y.jpg").unwrap_err();
        assert_eq!(
            err,
            ApiError::Http {
                status: 404,
                detail: "Resource not found.".to_string()
            }
        );
        assert!(client.transport.seen()[0].header("x-key").is_none());
        Ok(())
    }
}
