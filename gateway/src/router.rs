use std::collections::HashMap;
use std::time::{Duration, Instant};

use http::{Method, StatusCode};
use serde_json::{json, Value};
use strum::{Display, EnumIter, EnumString};
use tracing::{debug, warn};

use gatehouse_common::models::error::ErrorCode;

/// Total deadline for any one downstream call.
pub const DOWNSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the lightweight `/health` probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The microservices the gateway fans out to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Downstream {
    Auth,
    Sso,
    User,
    Permission,
}

/// A downstream response after normalization: the status to relay and a
/// JSON body that is either the verbatim success payload or an error shape
/// of exactly `{error_code, message}`.
#[derive(Clone, Debug, PartialEq)]
pub struct Forwarded {
    pub status: StatusCode,
    pub body: Value,
}

impl Forwarded {
    fn synthesized(status: StatusCode, code: ErrorCode, message: &str) -> Self {
        Self {
            status,
            body: json!({
                "error_code": code.to_string(),
                "message": message,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.as_u16() < 400
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ProbeReport {
    pub healthy: bool,
    pub message: String,
    pub response_time_ms: u64,
}

/// Single-process HTTP fan-out to the downstream services with a fixed
/// deadline and uniform failure classification.
#[derive(Clone)]
pub struct ServiceRouter {
    client: reqwest::Client,
    base_urls: HashMap<Downstream, String>,
}

impl ServiceRouter {
    pub fn new(base_urls: HashMap<Downstream, String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DOWNSTREAM_TIMEOUT)
            .build()
            .expect("the downstream http client should build");

        Self { client, base_urls }
    }

    pub fn services(&self) -> impl Iterator<Item = Downstream> + '_ {
        self.base_urls.keys().copied()
    }

    /// Forward one request, normalizing transport failures and
    /// non-conformant responses so the caller only ever sees a relayable
    /// status and body.
    pub async fn forward(
        &self,
        service: Downstream,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Forwarded {
        let Some(base_url) = self.base_urls.get(&service) else {
            warn!(%service, "no base url configured for downstream service");
            return Forwarded::synthesized(
                StatusCode::BAD_GATEWAY,
                ErrorCode::UpstreamError,
                "unknown downstream service",
            );
        };

        let mut request = self.client.request(method, format!("{base_url}{path}"));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) if error.is_timeout() => {
                warn!(%service, %path, "downstream call timed out");
                return Forwarded::synthesized(
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorCode::ServiceUnavailable,
                    "downstream service timed out, retry later",
                );
            }
            Err(error) if error.is_connect() => {
                warn!(%service, %path, "downstream connection failed");
                return Forwarded::synthesized(
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorCode::ServiceUnavailable,
                    "downstream service is unreachable, retry later",
                );
            }
            Err(error) => {
                warn!(
                    error = &error as &dyn std::error::Error,
                    %service,
                    %path,
                    "downstream request failed"
                );
                return Forwarded::synthesized(
                    StatusCode::BAD_GATEWAY,
                    ErrorCode::UpstreamError,
                    "downstream request failed",
                );
            }
        };

        Self::normalize(response).await
    }

    /// Turn a downstream HTTP response into a relayable [`Forwarded`].
    ///
    /// 5xx detail text is replaced with a generic message no matter what
    /// shape it arrived in; a downstream stack trace must never reach a
    /// caller.
    async fn normalize(response: reqwest::Response) -> Forwarded {
        let status = response.status();

        let text = match response.text().await {
            Ok(text) => text,
            Err(error) => {
                warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to read downstream response body"
                );
                return Forwarded::synthesized(
                    StatusCode::BAD_GATEWAY,
                    ErrorCode::UpstreamError,
                    "downstream response could not be read",
                );
            }
        };

        let body: Value = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(_) if status.as_u16() >= 400 => {
                debug!(status = status.as_u16(), "downstream returned a non-json error");
                return Forwarded::synthesized(
                    StatusCode::BAD_GATEWAY,
                    ErrorCode::UpstreamError,
                    "downstream returned an unexpected response shape",
                );
            }
            // Successful but not JSON; wrap the raw text.
            Err(_) => return Forwarded {
                status,
                body: json!({ "data": text }),
            },
        };

        if status.as_u16() < 400 {
            return Forwarded { status, body };
        }

        let laundered = status.as_u16() >= 500;

        // Framework-style `{detail: …}` errors.
        if let Some(detail) = body.get("detail") {
            let message = if laundered {
                "downstream service error".to_string()
            } else {
                detail
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| detail.to_string())
            };
            let error_code = body
                .get("error_code")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| ErrorCode::default_for(status).to_string());

            return Forwarded {
                status,
                body: json!({ "error_code": error_code, "message": message }),
            };
        }

        // Already in the unified shape.
        if let (Some(error_code), Some(message)) = (
            body.get("error_code").and_then(Value::as_str),
            body.get("message").and_then(Value::as_str),
        ) {
            let message = if laundered {
                "downstream service error"
            } else {
                message
            };

            return Forwarded {
                status,
                body: json!({ "error_code": error_code, "message": message }),
            };
        }

        Forwarded::synthesized(
            StatusCode::BAD_GATEWAY,
            ErrorCode::UpstreamError,
            "downstream returned an unexpected error shape",
        )
    }

    /// Probe one downstream `/health` endpoint.
    pub async fn probe(&self, service: Downstream) -> ProbeReport {
        let started = Instant::now();

        let Some(base_url) = self.base_urls.get(&service) else {
            return ProbeReport {
                healthy: false,
                message: format!("{service} service has no configured base url"),
                response_time_ms: 0,
            };
        };

        let result = self
            .client
            .get(format!("{base_url}/health"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.status().as_u16() < 400 => ProbeReport {
                healthy: true,
                message: format!("{service} service is running"),
                response_time_ms,
            },
            Ok(response) => ProbeReport {
                healthy: false,
                message: format!(
                    "{service} service returned status {}",
                    response.status().as_u16()
                ),
                response_time_ms,
            },
            Err(_) => ProbeReport {
                healthy: false,
                message: format!("{service} service is unreachable"),
                response_time_ms,
            },
        }
    }
}
