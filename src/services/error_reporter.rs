//! Asynchronous error reporting
//!
//! Reports are rate limited with a sliding window (default 10 reports per 60
//! seconds) and a fingerprint is sent at most once per window. Silent errors, including 429
//! responses, never reach the sink.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::{
    config::ErrorReportingConfig,
    error::{IapError, Result},
    models::api::ErrorLog,
    services::api_service::ApiClient,
};

#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn report(&self, entry: ErrorLog) -> Result<()>;
}

/// Logs reports locally
pub struct TracingErrorSink;

#[async_trait]
impl ErrorSink for TracingErrorSink {
    async fn report(&self, entry: ErrorLog) -> Result<()> {
        error!(
            code = %entry.code,
            fingerprint = %entry.fingerprint,
            user_id = ?entry.user_id,
            "{}",
            entry.message
        );
        Ok(())
    }
}

/// Posts reports to the backend log endpoint
pub struct ApiErrorSink {
    api: Arc<ApiClient>,
}

impl ApiErrorSink {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ErrorSink for ApiErrorSink {
    async fn report(&self, entry: ErrorLog) -> Result<()> {
        self.api.post_log(&entry).await
    }
}

/// Reports sent within the current window, oldest first
#[derive(Default)]
struct ReporterState {
    sent: VecDeque<(Instant, String)>,
}

pub struct ErrorReporter {
    sink: Arc<dyn ErrorSink>,
    config: ErrorReportingConfig,
    state: Mutex<ReporterState>,
}

impl ErrorReporter {
    pub fn new(sink: Arc<dyn ErrorSink>, config: &ErrorReportingConfig) -> Self {
        Self {
            sink,
            config: config.clone(),
            state: Mutex::new(ReporterState::default()),
        }
    }

    /// Dispatches the report in the background; returns whether it was sent
    pub fn report(&self, err: &IapError, user_id: Option<&str>) -> bool {
        if !self.should_report(err, Instant::now()) {
            return false;
        }

        let entry = ErrorLog {
            code: err.code().to_string(),
            subcode: err.subcode().map(str::to_string),
            message: err.to_string(),
            fingerprint: err.fingerprint(),
            user_id: user_id.map(str::to_string),
        };
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.report(entry).await {
                debug!("Error report failed: {}", e);
            }
        });
        true
    }

    fn should_report(&self, err: &IapError, now: Instant) -> bool {
        if !self.config.enabled || err.is_silent() {
            return false;
        }

        let window = Duration::from_secs(self.config.window_secs);
        let fingerprint = err.fingerprint();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some((oldest, _)) = state.sent.front() {
            if now.duration_since(*oldest) >= window {
                state.sent.pop_front();
            } else {
                break;
            }
        }

        if state.sent.iter().any(|(_, sent)| *sent == fingerprint) {
            return false;
        }
        if state.sent.len() >= self.config.max_reports {
            debug!("Error report dropped by rate limit: {}", fingerprint);
            return false;
        }

        state.sent.push_back((now, fingerprint));
        true
    }
}
