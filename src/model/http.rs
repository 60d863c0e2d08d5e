//! Shared HTTP plumbing for the vision backends.
//!
//! Each backend owns one [`HttpTransport`]: a pooled `reqwest::Client` with
//! the per-request timeout baked in, plus the provider name used in every
//! error it produces. `post_json` either returns the decoded success body or
//! an [`HttpFailure`]; transport and decode problems are already mapped into
//! [`BackendError`], while non-2xx responses are handed back raw so each
//! backend can apply its own quirks before falling back to
//! [`HttpTransport::map_status`].

use crate::error::{BackendError, VisionError};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// A non-2xx response, with the parts the error mappers need.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFailure {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: ErrorBody,
}

/// Why [`HttpTransport::post_json`] did not return a success body.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpFailure {
    /// The server answered with a non-2xx status.
    Status(StatusFailure),
    /// Transport failure or undecodable success body, already classified.
    Backend(BackendError),
}

/// The useful fields of a JSON error body.
///
/// Understands the OpenAI / Anthropic shape
/// `{"error": {"message", "type", "code"}}` and the Ollama shape
/// `{"error": "<message>"}`. Anything else keeps the raw text as message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
    pub kind: Option<String>,
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn parse(raw: &str) -> Self {
        let fallback = || ErrorBody {
            message: truncate(raw.trim(), 500),
            ..Default::default()
        };
        let Ok(json) = serde_json::from_str::<serde_json::Value>(raw) else {
            return fallback();
        };
        match json.get("error") {
            Some(serde_json::Value::String(msg)) => ErrorBody {
                message: msg.clone(),
                ..Default::default()
            },
            Some(obj @ serde_json::Value::Object(_)) => {
                let field = |name: &str| obj.get(name).and_then(|v| v.as_str()).map(str::to_string);
                ErrorBody {
                    message: field("message").unwrap_or_else(|| truncate(raw.trim(), 500)),
                    kind: field("type"),
                    code: field("code"),
                }
            }
            _ => fallback(),
        }
    }

    /// True if `needle` appears in the type, the code, or the message.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        [self.kind.as_deref(), self.code.as_deref(), Some(self.message.as_str())]
            .into_iter()
            .flatten()
            .any(|s| s.to_ascii_lowercase().contains(&needle))
    }
}

/// Pooled client plus the context needed to classify its failures.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    provider: &'static str,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(provider: &'static str, timeout: Duration) -> Result<Self, VisionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("docvision/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VisionError::Configuration {
                model: provider.to_string(),
                reason: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            provider,
            timeout,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// POST `body` as JSON and decode a 2xx response into `T`.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<T, HttpFailure> {
        let mut request = self.client.post(url);
        for (key, value) in headers {
            request = request.header(*key, *value);
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| HttpFailure::Backend(self.map_transport(&e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            debug!("{}: HTTP {} from {}: {}", self.provider, status, url, truncate(&text, 200));
            return Err(HttpFailure::Status(StatusFailure {
                status: status.as_u16(),
                retry_after,
                body: ErrorBody::parse(&text),
            }));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| HttpFailure::Backend(self.map_transport(&e)))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            HttpFailure::Backend(BackendError::MalformedResponse {
                provider: self.provider.to_string(),
                detail: format!("cannot decode response body: {e}"),
            })
        })
    }

    /// Map a reqwest transport error.
    pub fn map_transport(&self, e: &reqwest::Error) -> BackendError {
        let provider = self.provider.to_string();
        if e.is_timeout() {
            BackendError::Timeout {
                provider,
                secs: self.timeout.as_secs(),
            }
        } else if e.is_decode() {
            BackendError::MalformedResponse {
                provider,
                detail: e.to_string(),
            }
        } else {
            BackendError::Network {
                provider,
                message: e.to_string(),
            }
        }
    }

    /// Status-code mapping shared by every backend.
    ///
    /// | Status | Error |
    /// |--------|-------|
    /// | 429 (quota / billing body) | `QuotaExhausted` |
    /// | 429 | `RateLimited` |
    /// | 401, 403 | `Authentication` |
    /// | 408 | `Timeout` |
    /// | 529, or body type `overloaded_error` | `Overloaded` |
    /// | other 5xx | `ServerError` |
    /// | other 4xx (400, 404, 413, 422, …) | `InvalidRequest` |
    pub fn map_status(&self, failure: StatusFailure) -> BackendError {
        let provider = self.provider.to_string();
        let StatusFailure {
            status,
            retry_after,
            body,
        } = failure;
        let message = if body.message.is_empty() {
            format!("HTTP {status}")
        } else {
            body.message.clone()
        };

        if status == 529 || body.mentions("overloaded_error") {
            return BackendError::Overloaded { provider, message };
        }
        match status {
            429 if body.mentions("insufficient_quota") || body.mentions("billing") => {
                BackendError::QuotaExhausted { provider, message }
            }
            429 => BackendError::RateLimited {
                provider,
                message,
                retry_after,
            },
            401 | 403 => BackendError::Authentication { provider, message },
            408 => BackendError::Timeout {
                provider,
                secs: self.timeout.as_secs(),
            },
            500..=599 => BackendError::ServerError {
                provider,
                status,
                message,
            },
            _ => BackendError::InvalidRequest {
                provider,
                status,
                message,
            },
        }
    }
}

/// Server-suggested wait, from `retry-after-ms` or `retry-after` (seconds).
///
/// HTTP-date values are ignored; the strategy delay applies instead.
/// Values too large for a `Duration` saturate, and the retry clamp
/// brings them back down to `max_delay`.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

    if let Some(ms) = header("retry-after-ms").and_then(|v| v.parse::<f64>().ok()) {
        if ms.is_finite() && ms >= 0.0 {
            return Some(saturating_secs(ms / 1000.0));
        }
    }
    header("retry-after")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(saturating_secs)
}

fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn transport() -> HttpTransport {
        HttpTransport::new("openai", Duration::from_secs(30)).unwrap()
    }

    fn failure(status: u16, raw: &str) -> StatusFailure {
        StatusFailure {
            status,
            retry_after: None,
            body: ErrorBody::parse(raw),
        }
    }

    #[test]
    fn parses_openai_error_body() {
        let body = ErrorBody::parse(
            r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#,
        );
        assert_eq!(body.message, "You exceeded your current quota");
        assert_eq!(body.kind.as_deref(), Some("insufficient_quota"));
        assert!(body.mentions("INSUFFICIENT_QUOTA"));
    }

    #[test]
    fn parses_ollama_and_plain_bodies() {
        let body = ErrorBody::parse(r#"{"error":"model 'llava' not found"}"#);
        assert_eq!(body.message, "model 'llava' not found");
        assert_eq!(body.kind, None);

        let body = ErrorBody::parse("<html>Bad Gateway</html>");
        assert_eq!(body.message, "<html>Bad Gateway</html>");
    }

    #[test]
    fn status_mapping_table() {
        let t = transport();
        assert!(matches!(
            t.map_status(failure(429, r#"{"error":{"message":"slow down","type":"rate_limit_error"}}"#)),
            BackendError::RateLimited { .. }
        ));
        assert!(matches!(
            t.map_status(failure(429, r#"{"error":{"message":"quota","code":"insufficient_quota"}}"#)),
            BackendError::QuotaExhausted { .. }
        ));
        assert!(matches!(t.map_status(failure(401, "")), BackendError::Authentication { .. }));
        assert!(matches!(t.map_status(failure(403, "")), BackendError::Authentication { .. }));
        assert!(matches!(t.map_status(failure(408, "")), BackendError::Timeout { secs: 30, .. }));
        for status in [400u16, 404, 413, 422] {
            assert!(matches!(
                t.map_status(failure(status, "")),
                BackendError::InvalidRequest { .. }
            ));
        }
        assert!(matches!(t.map_status(failure(529, "")), BackendError::Overloaded { .. }));
        assert!(matches!(
            t.map_status(failure(500, r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)),
            BackendError::Overloaded { .. }
        ));
        assert!(matches!(
            t.map_status(failure(502, "")),
            BackendError::ServerError { status: 502, .. }
        ));
    }

    #[test]
    fn rate_limit_keeps_retry_after() {
        let t = transport();
        let err = t.map_status(StatusFailure {
            status: 429,
            retry_after: Some(Duration::from_secs(3)),
            body: ErrorBody::default(),
        });
        match err {
            BackendError::RateLimited {
                retry_after,
                message,
                ..
            } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
                assert_eq!(message, "HTTP 429");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn retry_after_header_variants() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(1500)));

        let mut dated = HeaderMap::new();
        dated.insert(
            "retry-after",
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&dated), None);

        let mut huge = HeaderMap::new();
        huge.insert("retry-after", HeaderValue::from_static("1e20"));
        assert_eq!(parse_retry_after(&huge), Some(Duration::MAX));

        let mut huge_ms = HeaderMap::new();
        huge_ms.insert("retry-after-ms", HeaderValue::from_static("1e300"));
        assert_eq!(parse_retry_after(&huge_ms), Some(Duration::MAX));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
