//! Design Automation work items: submission, status, cancellation and
//! reports, plus the [`RemoteExecutor`] the monitor drives.

use crate::client::ApsClient;
use crate::config::ReportConfig;
use crate::descriptor::JobDescriptor;
use crate::error::ApiError;
use crate::monitor::{ExecutorError, JobHandle, JobStatus, RemoteExecutor, StatusReport};
use reqwest::{Method, Url};
use serde::Deserialize;

/// Work item as returned by `POST /workitems` and `GET /workitems/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemStatus {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub report_url: Option<String>,
}

impl WorkItemStatus {
    /// Unknown status strings are treated as still running.
    pub fn job_status(&self) -> JobStatus {
        JobStatus::from_remote(&self.status).unwrap_or_else(|| {
            tracing::warn!(work_item = %self.id, status = %self.status, "unrecognised work item status");
            JobStatus::InProgress
        })
    }
}

/// `POST {da}/workitems`
pub async fn submit_work_item(
    client: &ApsClient,
    descriptor: &JobDescriptor,
) -> Result<WorkItemStatus, ApiError> {
    let token = client.auth().bearer().await?;
    let mut req = client
        .authorized(Method::POST, client.endpoints().da(&["workitems"]))
        .await?
        .json(&descriptor.work_item_payload(&token));
    if let Some(signature) = descriptor.signature() {
        req = req.header("x-ads-workitem-signature", signature);
    }

    let status: WorkItemStatus = client.send_json(req).await?;
    if status.id.trim().is_empty() {
        return Err(ApiError::Invalid("no work item id returned".to_string()));
    }
    Ok(status)
}

/// `GET {da}/workitems/{id}`
pub async fn work_item_status(client: &ApsClient, id: &str) -> Result<WorkItemStatus, ApiError> {
    let req = client
        .authorized(Method::GET, client.endpoints().da(&["workitems", id]))
        .await?;
    client.send_json(req).await
}

/// `DELETE {da}/workitems/{id}`. Only ever called on explicit request.
pub async fn cancel_work_item(client: &ApsClient, id: &str) -> Result<(), ApiError> {
    let req = client
        .authorized(Method::DELETE, client.endpoints().da(&["workitems", id]))
        .await?;
    client.send(req).await?;
    tracing::info!(work_item = id, "work item cancellation requested");
    Ok(())
}

/// Download a work item report and keep its last `max_bytes` bytes.
pub async fn fetch_report_excerpt(
    client: &ApsClient,
    report_url: &str,
    max_bytes: usize,
) -> Result<String, ApiError> {
    let url = Url::parse(report_url)
        .map_err(|e| ApiError::Invalid(format!("invalid report url: {e}")))?;
    let response = client.send(client.unauthorized(Method::GET, url)).await?;
    let redacted = crate::client::redact(response.url());
    let text = response.text().await.map_err(|e| ApiError::Transport {
        url: redacted,
        source: e,
    })?;
    Ok(tail(&text, max_bytes).to_string())
}

/// Last `max_bytes` bytes of `text`, widened to a char boundary.
fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

impl From<ApiError> for ExecutorError {
    fn from(e: ApiError) -> Self {
        // Only a definite answer from the service counts as a rejection.
        if e.status().is_some() && !e.is_transient() {
            ExecutorError::Rejected(e.to_string())
        } else {
            ExecutorError::Transport(e.to_string())
        }
    }
}

/// [`RemoteExecutor`] backed by the Design Automation REST API.
#[derive(Debug, Clone)]
pub struct DesignAutomationExecutor {
    client: ApsClient,
    report: ReportConfig,
}

impl DesignAutomationExecutor {
    pub fn new(client: ApsClient, report: ReportConfig) -> Self {
        Self { client, report }
    }

    pub fn client(&self) -> &ApsClient {
        &self.client
    }

    async fn diagnostics(&self, handle: &JobHandle, report_url: Option<&str>) -> Option<String> {
        let url = report_url.filter(|_| self.report.fetch)?;
        match fetch_report_excerpt(&self.client, url, self.report.max_bytes).await {
            Ok(excerpt) => Some(excerpt),
            Err(e) => {
                tracing::warn!(work_item = %handle, error = %e, "failed to fetch work item report");
                None
            }
        }
    }
}

impl RemoteExecutor for DesignAutomationExecutor {
    async fn submit(
        &self,
        descriptor: &JobDescriptor,
    ) -> Result<(JobHandle, JobStatus), ExecutorError> {
        let submitted = submit_work_item(&self.client, descriptor).await?;
        let status = submitted.job_status();
        Ok((JobHandle::new(submitted.id), status))
    }

    async fn query(&self, handle: &JobHandle) -> Result<StatusReport, ExecutorError> {
        let current = work_item_status(&self.client, handle.as_str()).await?;
        let status = current.job_status();
        let diagnostics = if status.is_terminal() {
            self.diagnostics(handle, current.report_url.as_deref()).await
        } else {
            None
        };

        Ok(StatusReport {
            status,
            remote_status: current.status,
            progress: current.progress,
            report_url: current.report_url,
            diagnostics,
        })
    }
}
