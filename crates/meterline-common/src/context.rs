//! Request context
//!
//! Every store operation runs on behalf of one tenant/environment pair and may be
//! bounded by a deadline or cancelled by the caller. Dropping the in-flight future
//! is what aborts the underlying query.

use crate::error::{MeteringError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Tenant scope plus deadline and cancellation for one logical request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Tenant identifier
    pub tenant_id: String,
    /// Environment identifier
    pub environment_id: String,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            environment_id: environment_id.into(),
            deadline: None,
            cancel: None,
        }
    }

    /// Bound every operation run under this context by `timeout` from now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Abort operations under this context once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Validate that the tenant scope is present
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.is_empty() {
            return Err(MeteringError::Validation("tenant_id is required".into()));
        }
        if self.environment_id.is_empty() {
            return Err(MeteringError::Validation(
                "environment_id is required".into(),
            ));
        }
        Ok(())
    }

    /// Fail fast when the context is already cancelled or past its deadline
    pub fn ensure_active(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(MeteringError::Cancelled(operation.to_string()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MeteringError::Timeout(format!(
                    "{} exceeded its deadline",
                    operation
                )));
            }
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the deadline passes or the context is
    /// cancelled first, in which case `fut` is dropped.
    pub async fn run<F, T>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_active(operation)?;

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        let cancel = self.cancel.clone();
        let cancelled = async move {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = fut => result,
            _ = expired => Err(MeteringError::Timeout(format!("{} exceeded its deadline", operation))),
            _ = cancelled => Err(MeteringError::Cancelled(operation.to_string())),
        }
    }
}
