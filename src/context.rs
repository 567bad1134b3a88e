//! Shared runtime context handed to every component constructor.

use std::{future::Future, sync::Arc, time::Duration};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;

/// Why a scoped call did not complete.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("canceled")]
    Canceled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Settings plus the process-wide shutdown signal.
///
/// Cloning is cheap; every clone observes the same shutdown token.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run `fut` bounded by `limit` and the shutdown signal.
    pub async fn scoped<F: Future>(&self, limit: Duration, fut: F) -> Result<F::Output, ScopeError> {
        scoped(&self.shutdown, limit, fut).await
    }
}

/// Run `fut` until it finishes, `limit` elapses or `token` is cancelled.
pub async fn scoped<F: Future>(token: &CancellationToken, limit: Duration, fut: F) -> Result<F::Output, ScopeError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ScopeError::Canceled),
        res = tokio::time::timeout(limit, fut) => res.map_err(|_| ScopeError::DeadlineExceeded),
    }
}
