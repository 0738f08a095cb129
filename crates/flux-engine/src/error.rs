use std::time::Duration;

use flux_contracts::config::Environment;
use flux_contracts::redact::scrub_secret;
use serde_json::Value;
use thiserror::Error;

use crate::transport::{TransportError, TransportErrorKind};

const MAX_DETAIL_CHARS: usize = 512;

/// Failure of a single call through [`crate::FluxClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("authentication failed (401): {detail}")]
    AuthenticationFailed { detail: String },
    #[error("invalid parameters (422): {detail}")]
    InvalidParameters { detail: String },
    #[error("rate limited (429): {detail}")]
    RateLimited { detail: String },
    #[error("service unavailable ({status}): {detail}")]
    ServiceUnavailable { status: u16, detail: String },
    #[error("request failed ({status}): {detail}")]
    Http { status: u16, detail: String },
    #[error("request moderated: {detail}")]
    Moderated { status: Option<u16>, detail: String },
    #[error("transport error: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    #[error("invalid response: {message}")]
    Decode { message: String },
    #[error("invalid endpoint: {endpoint}")]
    InvalidEndpoint { endpoint: String },
}

impl ApiError {
    /// Maps a non-2xx reply. Bodies that mention moderation become
    /// [`ApiError::Moderated`] whatever the status code.
    pub fn from_status(status: u16, body: &str, environment: Environment) -> Self {
        let verbose = extract_detail(body);
        if verbose.to_ascii_lowercase().contains("moderated") {
            let detail = if environment.is_production() {
                "Request was rejected by content moderation.".to_string()
            } else {
                verbose
            };
            return Self::Moderated {
                status: Some(status),
                detail,
            };
        }
        let detail = if environment.is_production() || verbose.is_empty() {
            generic_status_message(status).to_string()
        } else {
            verbose
        };
        match status {
            401 => Self::AuthenticationFailed { detail },
            422 => Self::InvalidParameters { detail },
            429 => Self::RateLimited { detail },
            502 | 503 => Self::ServiceUnavailable { status, detail },
            _ => Self::Http { status, detail },
        }
    }

    pub fn from_transport(err: TransportError, environment: Environment) -> Self {
        let message = if environment.is_production() {
            generic_transport_message(err.kind).to_string()
        } else {
            err.message
        };
        Self::Transport {
            kind: err.kind,
            message,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::AuthenticationFailed { .. } => Some(401),
            Self::InvalidParameters { .. } => Some(422),
            Self::RateLimited { .. } => Some(429),
            Self::ServiceUnavailable { status, .. } | Self::Http { status, .. } => Some(*status),
            Self::Moderated { status, .. } => *status,
            Self::Transport { .. } | Self::Decode { .. } | Self::InvalidEndpoint { .. } => None,
        }
    }

    /// 502/503 replies and timeout/reset-class transport failures.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ServiceUnavailable { .. } => true,
            Self::Transport { kind, .. } => {
                matches!(
                    kind,
                    TransportErrorKind::Timeout | TransportErrorKind::ConnectionReset
                )
            }
            _ => false,
        }
    }

    pub fn is_moderation(&self) -> bool {
        matches!(self, Self::Moderated { .. })
    }

    /// Replaces every occurrence of `secret` in the error's text with its
    /// redacted form. Servers and proxies sometimes echo request headers
    /// back in error bodies.
    pub fn redacted(self, secret: &str) -> Self {
        let scrub = |text: String| scrub_secret(&text, secret);
        match self {
            Self::AuthenticationFailed { detail } => Self::AuthenticationFailed {
                detail: scrub(detail),
            },
            Self::InvalidParameters { detail } => Self::InvalidParameters {
                detail: scrub(detail),
            },
            Self::RateLimited { detail } => Self::RateLimited {
                detail: scrub(detail),
            },
            Self::ServiceUnavailable { status, detail } => Self::ServiceUnavailable {
                status,
                detail: scrub(detail),
            },
            Self::Http { status, detail } => Self::Http {
                status,
                detail: scrub(detail),
            },
            Self::Moderated { status, detail } => Self::Moderated {
                status,
                detail: scrub(detail),
            },
            Self::Transport { kind, message } => Self::Transport {
                kind,
                message: scrub(message),
            },
            Self::Decode { message } => Self::Decode {
                message: scrub(message),
            },
            Self::InvalidEndpoint { endpoint } => Self::InvalidEndpoint {
                endpoint: scrub(endpoint),
            },
        }
    }

    pub fn user_hint(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed { .. } => {
                "Check your API key (--api-key, BFL_API_KEY or the config file)."
            }
            Self::InvalidParameters { .. } => {
                "The request itself was malformed; check the generation parameters."
            }
            Self::RateLimited { .. } => "Too many requests; slow down and try again shortly.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable; try again later."
            }
            Self::Moderated { .. } => "The request was rejected by the content policy.",
            Self::Transport { .. } => "Network problem while contacting the service.",
            Self::Http { .. } | Self::Decode { .. } | Self::InvalidEndpoint { .. } => {
                "The service returned an unexpected response."
            }
        }
    }
}

/// Terminal outcome of a poll session.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(
        "timed out waiting for task {task_id} after {:.1}s (limit {:.1}s)",
        .elapsed.as_secs_f64(),
        .timeout.as_secs_f64()
    )]
    Timeout {
        task_id: String,
        elapsed: Duration,
        timeout: Duration,
    },
    #[error("generation failed for task {task_id}: {reason}")]
    GenerationFailed { task_id: String, reason: String },
    #[error("content moderated for task {task_id}: {detail}")]
    ContentModerated { task_id: String, detail: String },
    #[error("gave up on task {task_id} after {retries} retries: {source}")]
    ExhaustedRetries {
        task_id: String,
        retries: u32,
        source: ApiError,
    },
    #[error("status request for task {task_id} failed: {source}")]
    Request { task_id: String, source: ApiError },
    #[error("polling cancelled for task {task_id}")]
    Cancelled { task_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFailureKind {
    Timeout,
    GenerationFailed,
    ContentModerated,
    ExhaustedRetries,
    Request,
    Cancelled,
}

impl PollFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::GenerationFailed => "generation_failed",
            Self::ContentModerated => "content_moderated",
            Self::ExhaustedRetries => "exhausted_retries",
            Self::Request => "request_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl PollError {
    pub fn kind(&self) -> PollFailureKind {
        match self {
            Self::Timeout { .. } => PollFailureKind::Timeout,
            Self::GenerationFailed { .. } => PollFailureKind::GenerationFailed,
            Self::ContentModerated { .. } => PollFailureKind::ContentModerated,
            Self::ExhaustedRetries { .. } => PollFailureKind::ExhaustedRetries,
            Self::Request { .. } => PollFailureKind::Request,
            Self::Cancelled { .. } => PollFailureKind::Cancelled,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::Timeout { task_id, .. }
            | Self::GenerationFailed { task_id, .. }
            | Self::ContentModerated { task_id, .. }
            | Self::ExhaustedRetries { task_id, .. }
            | Self::Request { task_id, .. }
            | Self::Cancelled { task_id } => task_id,
        }
    }

    pub fn user_hint(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => {
                "The task did not finish in time; wait longer or raise --timeout."
            }
            Self::GenerationFailed { .. } => {
                "The service could not produce this image; adjust the request and retry."
            }
            Self::ContentModerated { .. } => {
                "The content was rejected by the provider's moderation policy."
            }
            Self::ExhaustedRetries { .. } => {
                "The service is having transient trouble and retries were already used up; try again later."
            }
            Self::Request { source, .. } => source.user_hint(),
            Self::Cancelled { .. } => "Polling was cancelled before the task finished.",
        }
    }
}

/// Pulls a human-readable detail out of an error body: `detail` (string or
/// validation list), `message`, `error`, or the raw text.
pub(crate) fn extract_detail(body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
        if let Some(detail) = parsed.get("detail").and_then(describe_detail_value) {
            return truncate_text(&detail, MAX_DETAIL_CHARS);
        }
        for key in ["message", "error"] {
            if let Some(text) = parsed
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|text| !text.is_empty())
            {
                return truncate_text(text, MAX_DETAIL_CHARS);
            }
        }
    }
    truncate_text(trimmed, MAX_DETAIL_CHARS)
}

fn describe_detail_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Array(rows) => {
            let parts: Vec<String> = rows
                .iter()
                .filter_map(|row| {
                    let msg = row.get("msg").and_then(Value::as_str)?;
                    let loc = row
                        .get("loc")
                        .and_then(Value::as_array)
                        .map(|items| {
                            items
                                .iter()
                                .map(|item| match item {
                                    Value::String(text) => text.clone(),
                                    other => other.to_string(),
                                })
                                .collect::<Vec<String>>()
                                .join(".")
                        })
                        .filter(|loc| !loc.is_empty());
                    Some(match loc {
                        Some(loc) => format!("{loc}: {msg}"),
                        None => msg.to_string(),
                    })
                })
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("; "))
            }
        }
        _ => None,
    }
}

fn generic_status_message(status: u16) -> &'static str {
    match status {
        400 => "Bad request.",
        401 => "Authentication failed. Check your API key.",
        402 => "Insufficient credits.",
        403 => "Access denied.",
        404 => "Resource not found.",
        422 => "Invalid request parameters.",
        429 => "Rate limit exceeded. Please wait before retrying.",
        500 => "Internal server error.",
        502 | 503 => "Service temporarily unavailable.",
        504 => "Gateway timeout.",
        _ => "Request failed.",
    }
}

fn generic_transport_message(kind: TransportErrorKind) -> &'static str {
    match kind {
        TransportErrorKind::Timeout => "Request timed out.",
        TransportErrorKind::ConnectionReset => "Connection was interrupted.",
        TransportErrorKind::Connect => "Could not connect to the service.",
        TransportErrorKind::Redirect => "Too many redirects.",
        TransportErrorKind::Other => "Network error.",
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
