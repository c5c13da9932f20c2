use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::Response;
use chrono::{DateTime, Utc};
use gatehouse_common::backends::headers::{X_APP_ID, X_REQUEST_ID};
use http::header::USER_AGENT;
use http::Request;
use serde::Serialize;
use tokio::sync::mpsc;
use tower::{Layer, Service};
use tracing::{info, warn};

use crate::dal::Dal;

/// Reported when a request carries no `X-App-Id` header.
const ANONYMOUS: &str = "anonymous";

/// One immutable row per audited event.
#[derive(Clone, Debug, Serialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub app_id: String,
    pub action: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub elapsed_ms: u64,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Row attributing one inbound API request.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        request_id: String,
        app_id: String,
        method: String,
        path: String,
        status: u16,
        elapsed_ms: u64,
        client_ip: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            request_id,
            app_id,
            action: "gateway_api_request".to_string(),
            method,
            path,
            status,
            elapsed_ms,
            client_ip,
            user_agent,
            details: None,
            recorded_at: Utc::now(),
        }
    }

    /// Row flagging the state an auto-provision run left behind.
    pub fn provision(app_id: String, details: serde_json::Value) -> Self {
        Self {
            request_id: String::new(),
            app_id,
            action: "auto_provision".to_string(),
            method: String::new(),
            path: String::new(),
            status: 0,
            elapsed_ms: 0,
            client_ip: None,
            user_agent: None,
            details: Some(details),
            recorded_at: Utc::now(),
        }
    }
}

/// Best-effort asynchronous audit writer.
///
/// Records go through a bounded queue into a dedicated task; when the queue
/// is full or the write fails the record is dropped with a warning, never
/// failing the request that produced it.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditSink {
    pub fn start<D: Dal>(dal: Arc<D>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(capacity);

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(error) = dal.insert_audit_record(&record).await {
                    warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to write audit record"
                    );
                }
            }
        });

        Self { tx }
    }

    pub fn record(&self, record: AuditRecord) {
        if self.tx.try_send(record).is_err() {
            warn!("audit queue is full, dropping a record");
        }
    }
}

/// Attributes every inbound request to one audit record and emits the
/// request log line.
#[derive(Clone)]
pub struct AuditLayer {
    sink: AuditSink,
}

impl AuditLayer {
    pub fn new(sink: AuditSink) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for AuditLayer {
    type Service = Audit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Audit {
            inner,
            sink: self.sink.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Audit<S> {
    inner: S,
    sink: AuditSink,
}

impl<S> Service<Request<Body>> for Audit<S>
where
    S: Service<Request<Body>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let started = Instant::now();

        let app_id = request
            .headers()
            .get(&X_APP_ID)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(ANONYMOUS)
            .to_string();
        let user_agent = request
            .headers()
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let client_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string());
        let method = request.method().to_string();
        let path = request.uri().path().to_string();

        let sink = self.sink.clone();
        let future = self.inner.call(request);

        Box::pin(async move {
            let response = future.await?;

            let elapsed_ms = started.elapsed().as_millis() as u64;
            let status = response.status().as_u16();
            let request_id = response
                .headers()
                .get(&X_REQUEST_ID)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();

            info!(
                %request_id,
                %app_id,
                %method,
                %path,
                status,
                elapsed_ms,
                "gateway request"
            );

            if path.starts_with("/api/") {
                sink.record(AuditRecord::request(
                    request_id, app_id, method, path, status, elapsed_ms, client_ip, user_agent,
                ));
            }

            Ok(response)
        })
    }
}
