//! HTTP client for the meter backend (identification and alerts endpoints).
//!
//! - Blocking client using `ureq` (no async), one agent with a global timeout.
//! - Non-2xx responses are returned as `MeterClientError::Http` instead of
//!   ureq errors so the body can be reported.
//! - Transport errors and 5xx responses are retried with a linear backoff.

use http::StatusCode;
use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::thread;
use std::time::Duration;

use crate::models::meter::{AlertsResponse, ClassifierReply, IdentifyRequest};

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum MeterClientError {
    Transport(String),
    Http { status: u16, message: String },
    Json { path: String, source: serde_json::Error },
}

impl MeterClientError {
    pub fn is_transient(&self) -> bool {
        match self {
            MeterClientError::Transport(_) => true,
            MeterClientError::Http { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error())
                .unwrap_or(false),
            MeterClientError::Json { .. } => false,
        }
    }
}

impl core::fmt::Display for MeterClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MeterClientError::Transport(s) => write!(f, "transport error: {}", s),
            MeterClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            MeterClientError::Json { path, source } => write!(f, "json error at {}: {}", path, source),
        }
    }
}

impl std::error::Error for MeterClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MeterClientError::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// The external appliance classifier.
pub trait Classifier {
    fn identify(&self, power_readings: &[f64]) -> Result<ClassifierReply, MeterClientError>;
}

pub struct MeterClient {
    agent: ureq::Agent,
    base_url: String,
    max_retries: u32,
}

impl MeterClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, max_retries: u32) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        MeterClient {
            agent: config.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn read_body(resp: Result<http::Response<ureq::Body>, ureq::Error>) -> Result<String, MeterClientError> {
        let resp = resp.map_err(|e| MeterClientError::Transport(e.to_string()))?;
        let status = resp.status();
        let mut body = resp.into_body();
        let text = body
            .read_to_string()
            .map_err(|e| MeterClientError::Transport(e.to_string()))?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(MeterClientError::Http {
                status: status.as_u16(),
                message: if text.is_empty() { String::from("<no body>") } else { text },
            })
        }
    }

    fn with_retries<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, MeterClientError>,
    ) -> Result<T, MeterClientError> {
        let mut attempt: u32 = 0;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, self.max_retries + 1, e);
                    thread::sleep(RETRY_BACKOFF * attempt);
                }
                other => return other,
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, MeterClientError> {
        let url = self.url(path);
        let body = self.with_retries(&format!("GET {}", path), || {
            Self::read_body(self.agent.get(&url).header("Accept", "application/json").call())
        })?;
        parse_json(&body)
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, payload: &B) -> Result<T, MeterClientError> {
        let url = self.url(path);
        let body = self.with_retries(&format!("POST {}", path), || {
            Self::read_body(
                self.agent
                    .post(&url)
                    .header("Accept", "application/json")
                    .send_json(payload),
            )
        })?;
        parse_json(&body)
    }

    pub fn get_alerts(&self) -> Result<AlertsResponse, MeterClientError> {
        self.get_json("/alerts")
    }
}

impl Classifier for MeterClient {
    fn identify(&self, power_readings: &[f64]) -> Result<ClassifierReply, MeterClientError> {
        let body: serde_json::Value = self.post_json("/identify/device", &IdentifyRequest { power_readings })?;
        Ok(ClassifierReply::from_body(body))
    }
}

/// Deserialize with the failing field path in the error.
pub fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, MeterClientError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|e| MeterClientError::Json {
        path: e.path().to_string(),
        source: e.into_inner(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_carry_the_field_path() {
        let body = r#"{"alerts": {"a1": {"message": "x", "severity": "low", "is_read": "nope"}}}"#;
        let err = parse_json::<AlertsResponse>(body).unwrap_err();
        match err {
            MeterClientError::Json { path, .. } => assert_eq!(path, "alerts.a1.is_read"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(MeterClientError::Transport("reset".into()).is_transient());
        assert!(
            MeterClientError::Http {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !MeterClientError::Http {
                status: 422,
                message: String::new()
            }
            .is_transient()
        );
    }

    fn http_error(status: u16) -> MeterClientError {
        MeterClientError::Http {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn server_errors_are_retried_up_to_the_limit() {
        let client = MeterClient::new("http://localhost:8000", Duration::from_secs(1), 1);

        let mut calls = 0;
        let result: Result<(), _> = client.with_retries("POST /identify/device", || {
            calls += 1;
            Err(http_error(503))
        });
        assert!(matches!(result, Err(MeterClientError::Http { status: 503, .. })));
        assert_eq!(calls, 2);

        let mut calls = 0;
        let result = client.with_retries("GET /alerts", || {
            calls += 1;
            if calls == 1 { Err(MeterClientError::Transport("reset".into())) } else { Ok(calls) }
        });
        assert_eq!(result.ok(), Some(2));
    }

    #[test]
    fn client_and_decode_errors_fail_immediately() {
        let client = MeterClient::new("http://localhost:8000", Duration::from_secs(1), 1);

        let mut calls = 0;
        let result: Result<(), _> = client.with_retries("POST /identify/device", || {
            calls += 1;
            Err(http_error(422))
        });
        assert!(matches!(result, Err(MeterClientError::Http { status: 422, .. })));
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result: Result<(), _> = client.with_retries("GET /alerts", || {
            calls += 1;
            parse_json::<AlertsResponse>("{\"alerts\": 7}").map(|_| ())
        });
        assert!(matches!(result, Err(MeterClientError::Json { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn urls_join_without_double_slashes() {
        let client = MeterClient::new("http://localhost:8000/", Duration::from_secs(1), 0);
        assert_eq!(client.url("/alerts"), "http://localhost:8000/alerts");
        assert_eq!(client.url("identify/device"), "http://localhost:8000/identify/device");
    }
}
