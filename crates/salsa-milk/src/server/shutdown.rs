//! Shutdown triggers: process signals and the request budget

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::ServingConfig;

/// Counts served requests and fires once the limit is reached, so the
/// supervisor can start a fresh process.
#[derive(Debug)]
pub struct RequestBudget {
    limit: u64,
    remaining: AtomicU64,
    exhausted: Notify,
}

impl RequestBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            remaining: AtomicU64::new(limit),
            exhausted: Notify::new(),
        }
    }

    /// `max_requests` plus a random share of the jitter; `None` when unlimited
    pub fn from_config(serving: &ServingConfig) -> Option<Arc<Self>> {
        let max = serving.max_requests?;
        let jitter = if serving.max_requests_jitter > 0 {
            rand::thread_rng().gen_range(0..=serving.max_requests_jitter)
        } else {
            0
        };
        Some(Arc::new(Self::new(max.saturating_add(jitter))))
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Count one request. True exactly once, for the request that used up
    /// the budget.
    pub fn record(&self) -> bool {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.exhausted.notify_one();
            return true;
        }
        false
    }

    /// Resolves once the budget is used up
    pub async fn exhausted(&self) {
        self.exhausted.notified().await;
    }
}

/// Middleware counting every completed request against the budget
pub async fn count_request(
    State(budget): State<Arc<RequestBudget>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if budget.record() {
        tracing::info!(
            "Served {} requests, shutting down for restart",
            budget.limit()
        );
    }
    response
}

/// Resolves on Ctrl+C, SIGTERM or an exhausted request budget
pub async fn shutdown_signal(budget: Option<Arc<RequestBudget>>) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C signal, shutting down gracefully"),
            Err(e) => {
                tracing::warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                tracing::info!("Received terminate signal, shutting down gracefully");
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let recycle = async {
        match budget {
            Some(budget) => budget.exhausted().await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = recycle => {},
    }
}
