//! # Application State Management
//!
//! Shared state handed to every HTTP handler and bridge session.
//!
//! ## Layout:
//! - **config**: `Arc<AppConfig>`, loaded once at startup and never written again.
//!   Every bridge session reads its upstream settings from here.
//! - **metrics**: `Arc<RwLock<AppMetrics>>`, updated by the middleware on every
//!   request and by the WebSocket endpoint as sessions start and end.
//! - **start_time**: for uptime reporting.
//!
//! Bridge sessions are admitted through [`AppState::try_acquire_session`],
//! which enforces `performance.max_concurrent_sessions`. The returned
//! [`SessionPermit`] gives the slot back when dropped, so a session that ends
//! any way at all (including a panic in its task) is counted out.

use crate::bridge::BridgeReport;
use crate::config::AppConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    /// Immutable after startup
    pub config: Arc<AppConfig>,

    pub metrics: Arc<RwLock<AppMetrics>>,

    pub start_time: Instant,
}

/// Counters collected across all HTTP requests and bridge sessions.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of failed HTTP requests since server start
    pub error_count: u64,

    /// Bridge sessions currently open
    pub active_sessions: u32,

    /// Bridge sessions admitted since server start
    pub sessions_total: u64,

    /// Browser audio chunks appended upstream
    pub audio_chunks_forwarded: u64,

    /// Response cycles that reached `done`
    pub responses_completed: u64,

    /// Sessions ended by the realtime service (connect failure, transport
    /// error, closed stream, stall)
    pub upstream_failures: u64,

    /// Key: endpoint name (e.g. "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// A claimed bridge session slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct SessionPermit {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    // Counters stay usable even if a writer panicked mid-update
    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record duration and outcome for one request to `endpoint`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Claim a bridge session slot, or `None` when the cap is reached.
    ///
    /// Check and increment happen under one write lock.
    pub fn try_acquire_session(&self) -> Option<SessionPermit> {
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions as usize >= self.config.performance.max_concurrent_sessions {
            return None;
        }

        metrics.active_sessions += 1;
        metrics.sessions_total += 1;

        Some(SessionPermit {
            metrics: self.metrics.clone(),
        })
    }

    /// Fold a finished session's outcome into the counters.
    pub fn record_session_report(&self, report: &BridgeReport) {
        let mut metrics = self.metrics_mut();
        metrics.audio_chunks_forwarded += report.audio_chunks_forwarded;
        metrics.responses_completed += report.responses_completed;
        if report.exit.is_upstream_failure() {
            metrics.upstream_failures += 1;
        }
    }

    /// The upstream connection could not be opened at all.
    pub fn record_upstream_failure(&self) {
        self.metrics_mut().upstream_failures += 1;
    }

    /// Snapshot taken under a read lock so the response is consistent.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
