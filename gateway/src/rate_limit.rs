use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use uuid::Uuid;

use gatehouse_common::backends::cache::{CacheBackend, CacheError};
use gatehouse_common::models::application::AppId;

use crate::cache::rate_limit_key;

/// Length of the sliding admission window.
pub const WINDOW: Duration = Duration::from_secs(60);

pub static X_RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub static X_RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// The admission decision for one request, with everything needed to emit
/// the quota headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix timestamp (seconds) bounding the end of the current window.
    pub reset: i64,
    /// Seconds until a slot frees up; only set on deny.
    pub retry_after: Option<u32>,
}

impl RateLimitResult {
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            X_RATE_LIMIT_LIMIT.clone(),
            HeaderValue::from_str(&self.limit.to_string()).expect("an integer is a valid header"),
        );
        headers.insert(
            X_RATE_LIMIT_REMAINING.clone(),
            HeaderValue::from_str(&self.remaining.to_string())
                .expect("an integer is a valid header"),
        );
        headers.insert(
            X_RATE_LIMIT_RESET.clone(),
            HeaderValue::from_str(&self.reset.to_string()).expect("an integer is a valid header"),
        );
        if let Some(retry_after) = self.retry_after {
            headers.insert(
                RETRY_AFTER,
                HeaderValue::from_str(&retry_after.to_string())
                    .expect("an integer is a valid header"),
            );
        }

        headers
    }
}

/// Sliding-window admission keyed on application identity.
///
/// Each admission is a unique member in a score-ordered window; the prune
/// and count run as one atomic step and so does the insert, so concurrent
/// workers can over-admit by at most their own count.
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn CacheBackend>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub async fn check(&self, app_id: &AppId, limit: u32) -> Result<RateLimitResult, CacheError> {
        let key = rate_limit_key(app_id);
        let window_ms = WINDOW.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();
        let cutoff_ms = now_ms - window_ms;
        let reset = (now_ms + 999) / 1000 + WINDOW.as_secs() as i64;

        let count = self.backend.window_slide(&key, cutoff_ms).await?;

        if count >= limit as u64 {
            let retry_after = match self.backend.window_earliest(&key).await? {
                Some(earliest_ms) => {
                    let millis_left = earliest_ms + window_ms - now_ms;
                    (millis_left.max(1) + 999) / 1000
                }
                // The window emptied between the two reads; the safe answer
                // is a full window.
                None => WINDOW.as_secs() as i64,
            };

            return Ok(RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                reset,
                retry_after: Some(retry_after.max(1) as u32),
            });
        }

        let member = Uuid::new_v4().to_string();
        self.backend
            .window_add(&key, &member, now_ms, WINDOW + Duration::from_secs(1))
            .await?;

        Ok(RateLimitResult {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(count as u32 + 1),
            reset,
            retry_after: None,
        })
    }
}
