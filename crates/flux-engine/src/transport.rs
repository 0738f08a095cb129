use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::redirect::Policy;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_REDIRECT_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionReset,
    Connect,
    Redirect,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Timeouts and dropped connections are worth retrying; refused
    /// connections, redirect loops and the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Timeout | TransportErrorKind::ConnectionReset
        )
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        Self::new(classify_reqwest_error(err), error_chain_message(err))
    }
}

/// The raw HTTP seam under [`crate::FluxClient`].
pub trait HttpTransport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpReply, TransportError>;
}

/// Blocking reqwest transport with a bounded redirect count.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: HttpClient,
}

impl ReqwestTransport {
    pub fn new(redirect_limit: usize) -> Result<Self, TransportError> {
        let http = HttpClient::builder()
            .redirect(Policy::limited(redirect_limit))
            .build()
            .map_err(|err| TransportError::from_reqwest(&err))?;
        Ok(Self { http })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpReply, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&request.url),
            HttpMethod::Post => self.http.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }
        let response = builder
            .timeout(request.timeout)
            .send()
            .map_err(|err| TransportError::from_reqwest(&err))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|err| TransportError::from_reqwest(&err))?
            .to_vec();
        Ok(HttpReply { status, body })
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if let Some(kind) = io_error_kind_in_chain(err) {
        if kind == io::ErrorKind::TimedOut {
            return TransportErrorKind::Timeout;
        }
        if is_connection_reset_kind(kind) {
            return TransportErrorKind::ConnectionReset;
        }
    }
    if err.is_redirect() {
        return TransportErrorKind::Redirect;
    }
    if err.is_connect() {
        return TransportErrorKind::Connect;
    }
    TransportErrorKind::Other
}

fn io_error_kind_in_chain(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut cause = Some(err);
    while let Some(current) = cause {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        cause = current.source();
    }
    None
}

fn is_connection_reset_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

fn error_chain_message(err: &(dyn StdError + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut cause = Some(err);
    while let Some(current) = cause {
        let text = current.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        cause = current.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::{
        error_chain_message, io_error_kind_in_chain, is_connection_reset_kind, HttpReply,
        TransportError, TransportErrorKind,
    };

    #[test]
    fn only_timeouts_and_resets_are_transient() {
        for (kind, transient) in [
            (TransportErrorKind::Timeout, true),
            (TransportErrorKind::ConnectionReset, true),
            (TransportErrorKind::Connect, false),
            (TransportErrorKind::Redirect, false),
            (TransportErrorKind::Other, false),
        ] {
            assert_eq!(
                TransportError::new(kind, "x").is_transient(),
                transient,
                "{kind:?}"
            );
        }
    }

    #[derive(Debug)]
    struct Wrapper(io::Error);

    impl std::fmt::Display for Wrapper {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "connection error")
        }
    }

    impl std::error::Error for Wrapper {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn io_kind_is_found_through_wrapping_errors() {
        let wrapped = Wrapper(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
        assert_eq!(
            io_error_kind_in_chain(&wrapped),
            Some(io::ErrorKind::ConnectionReset)
        );
        assert_eq!(
            error_chain_message(&wrapped),
            "connection error: peer reset"
        );
        assert!(is_connection_reset_kind(io::ErrorKind::BrokenPipe));
        assert!(!is_connection_reset_kind(io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn reply_success_range() {
        let ok = HttpReply {
            status: 204,
            body: Vec::new(),
        };
        let redirect = HttpReply {
            status: 302,
            body: b"moved".to_vec(),
        };
        assert!(ok.is_success());
        assert!(!redirect.is_success());
        assert_eq!(redirect.text(), "moved");
    }
}
