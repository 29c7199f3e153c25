//! Status reporting towards the control plane.
//!
//! [`ReportSink`] is the transport seam; [`Reporter`] binds a sink to one
//! application and bounds every request with a deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::models::{SetDeviceServiceStateRequest, SetDeviceServiceStatusRequest};

/// Errors produced while delivering a report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    /// The transport refused or failed the request.
    #[error("report transport failed: {0}")]
    Transport(String),
    /// The request did not complete before its deadline.
    #[error("report timed out")]
    Timeout,
}

/// Destination for application and service status reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// The application now runs `release_id`.
    async fn application_status(
        &self,
        application_id: &str,
        release_id: &str,
    ) -> Result<(), ReportError>;

    /// A service now runs the given release.
    async fn service_status(
        &self,
        application_id: &str,
        service: &str,
        request: &SetDeviceServiceStatusRequest,
    ) -> Result<(), ReportError>;

    /// A service changed lifecycle state.
    async fn service_state(
        &self,
        application_id: &str,
        service: &str,
        request: &SetDeviceServiceStateRequest,
    ) -> Result<(), ReportError>;
}

/// A [`ReportSink`] bound to one application ID, with a per-request deadline.
#[derive(Clone)]
pub struct Reporter {
    application_id: String,
    sink: Arc<dyn ReportSink>,
    timeout: Duration,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("application_id", &self.application_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    /// Bind `sink` to `application_id`.
    pub fn new(application_id: impl Into<String>, sink: Arc<dyn ReportSink>, timeout: Duration) -> Self {
        Self {
            application_id: application_id.into(),
            sink,
            timeout,
        }
    }

    /// Application this reporter speaks for.
    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Report the release the application now runs.
    ///
    /// # Errors
    ///
    /// Returns the sink's error, or [`ReportError::Timeout`] past the deadline.
    pub async fn application_status(&self, release_id: &str) -> Result<(), ReportError> {
        self.bounded(self.sink.application_status(&self.application_id, release_id))
            .await
    }

    /// Report the release a service now runs.
    ///
    /// # Errors
    ///
    /// Returns the sink's error, or [`ReportError::Timeout`] past the deadline.
    pub async fn service_status(
        &self,
        service: &str,
        request: &SetDeviceServiceStatusRequest,
    ) -> Result<(), ReportError> {
        self.bounded(self.sink.service_status(&self.application_id, service, request))
            .await
    }

    /// Report a service lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns the sink's error, or [`ReportError::Timeout`] past the deadline.
    pub async fn service_state(
        &self,
        service: &str,
        request: &SetDeviceServiceStateRequest,
    ) -> Result<(), ReportError> {
        self.bounded(self.sink.service_state(&self.application_id, service, request))
            .await
    }

    async fn bounded(
        &self,
        request: impl std::future::Future<Output = Result<(), ReportError>>,
    ) -> Result<(), ReportError> {
        tokio::time::timeout(self.timeout, request)
            .await
            .unwrap_or(Err(ReportError::Timeout))
    }
}

/// Sink that records reports as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn application_status(
        &self,
        application_id: &str,
        release_id: &str,
    ) -> Result<(), ReportError> {
        info!(application_id, release_id, "application status");
        Ok(())
    }

    async fn service_status(
        &self,
        application_id: &str,
        service: &str,
        request: &SetDeviceServiceStatusRequest,
    ) -> Result<(), ReportError> {
        info!(
            application_id,
            service,
            release_id = %request.current_release_id,
            "service status"
        );
        Ok(())
    }

    async fn service_state(
        &self,
        application_id: &str,
        service: &str,
        request: &SetDeviceServiceStateRequest,
    ) -> Result<(), ReportError> {
        info!(
            application_id,
            service,
            state = ?request.state,
            error_message = %request.error_message,
            "service state"
        );
        Ok(())
    }
}
