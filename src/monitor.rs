//! Submit-and-await for remote work items.
//!
//! [`RemoteJobMonitor::execute`] submits a [`JobDescriptor`] exactly once,
//! then polls its status at a fixed interval until the remote executor
//! reports a terminal status, the time budget runs out, or status queries
//! keep failing. The remote job is never cancelled implicitly: on timeout or
//! caller abort the handle is returned so the caller can inspect or cancel
//! it out of band.

use crate::descriptor::JobDescriptor;
use crate::retry::{RetryDecision, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Opaque identifier of a submitted work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Map a Design Automation status string. Every `failed*` variant
    /// (`failedDownload`, `failedInstructions`, `failedUpload`, ...) is Failed.
    pub fn from_remote(status: &str) -> Option<JobStatus> {
        match status {
            "pending" => Some(JobStatus::Pending),
            "inprogress" => Some(JobStatus::InProgress),
            "success" => Some(JobStatus::Succeeded),
            "cancelled" => Some(JobStatus::Cancelled),
            s if s.starts_with("failed") => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One status observation from the remote executor.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: JobStatus,
    /// Status exactly as the service spelled it (e.g. `failedInstructions`).
    pub remote_status: String,
    pub progress: Option<String>,
    pub report_url: Option<String>,
    /// Log excerpt, when the executor has one.
    pub diagnostics: Option<String>,
}

impl StatusReport {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            remote_status: status.to_string(),
            progress: None,
            report_url: None,
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }
}

/// Terminal snapshot of a finished work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub remote_status: String,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub polls: u32,
    pub diagnostics: Option<String>,
    pub report_url: Option<String>,
    pub finished_at: DateTime<Utc>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// Failure reported by a [`RemoteExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The service refused the request (bad parameters, unknown activity).
    Rejected(String),
    /// The request could not be completed (network, 5xx, credentials).
    Transport(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::Rejected(detail) => write!(f, "rejected: {detail}"),
            ExecutorError::Transport(detail) => write!(f, "transport failure: {detail}"),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// The remote side of a work item: submission and status lookup.
pub trait RemoteExecutor: Send + Sync {
    /// Submit a work item. Returns its handle and initial status.
    fn submit(
        &self,
        descriptor: &JobDescriptor,
    ) -> impl Future<Output = Result<(JobHandle, JobStatus), ExecutorError>> + Send;

    /// Query the current status of a submitted work item.
    fn query(
        &self,
        handle: &JobHandle,
    ) -> impl Future<Output = Result<StatusReport, ExecutorError>> + Send;
}

/// Invalid poll policy values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    ZeroMaxWait,
    ZeroInterval,
    IntervalExceedsMaxWait { interval: Duration, max_wait: Duration },
    ZeroAttempts,
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::ZeroMaxWait => write!(f, "max wait must be positive"),
            PolicyError::ZeroInterval => write!(f, "poll interval must be positive"),
            PolicyError::IntervalExceedsMaxWait { interval, max_wait } => write!(
                f,
                "poll interval {}s exceeds max wait {}s",
                interval.as_secs_f64(),
                max_wait.as_secs_f64()
            ),
            PolicyError::ZeroAttempts => write!(f, "max query attempts must be at least 1"),
        }
    }
}

impl std::error::Error for PolicyError {}

/// Time budget and cadence for one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    max_wait: Duration,
    interval: Duration,
    max_query_attempts: u32,
}

impl PollPolicy {
    pub fn new(
        max_wait: Duration,
        interval: Duration,
        max_query_attempts: u32,
    ) -> Result<Self, PolicyError> {
        if max_wait.is_zero() {
            return Err(PolicyError::ZeroMaxWait);
        }
        if interval.is_zero() {
            return Err(PolicyError::ZeroInterval);
        }
        if interval > max_wait {
            return Err(PolicyError::IntervalExceedsMaxWait { interval, max_wait });
        }
        if max_query_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        Ok(Self {
            max_wait,
            interval,
            max_query_attempts,
        })
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_query_attempts(&self) -> u32 {
        self.max_query_attempts
    }
}

/// Why `execute` did not produce a [`JobResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorError {
    /// The executor refused or could not accept the submission. No status
    /// query was issued.
    Submission { detail: String },
    /// No terminal status within the budget. The work item keeps running.
    Timeout {
        handle: JobHandle,
        elapsed: Duration,
        last_status: JobStatus,
    },
    /// Consecutive status queries failed until the attempt limit.
    Transport {
        handle: JobHandle,
        attempts: u32,
        detail: String,
    },
    /// The caller stopped waiting. The work item keeps running.
    Aborted {
        handle: JobHandle,
        elapsed: Duration,
        last_status: JobStatus,
    },
}

impl MonitorError {
    /// Handle of the work item left running remotely, if one was submitted.
    pub fn handle(&self) -> Option<&JobHandle> {
        match self {
            MonitorError::Submission { .. } => None,
            MonitorError::Timeout { handle, .. }
            | MonitorError::Transport { handle, .. }
            | MonitorError::Aborted { handle, .. } => Some(handle),
        }
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Submission { detail } => {
                write!(f, "work item submission failed: {detail}")
            }
            MonitorError::Timeout {
                handle,
                elapsed,
                last_status,
            } => write!(
                f,
                "work item {handle} still {last_status} after {}s",
                elapsed.as_secs()
            ),
            MonitorError::Transport {
                handle,
                attempts,
                detail,
            } => write!(
                f,
                "status query for work item {handle} failed {attempts} times in a row: {detail}"
            ),
            MonitorError::Aborted {
                handle,
                elapsed,
                last_status,
            } => write!(
                f,
                "stopped waiting for work item {handle} ({last_status}) after {}s",
                elapsed.as_secs()
            ),
        }
    }
}

impl std::error::Error for MonitorError {}

enum Wake<T> {
    Ready(T),
    Aborted,
}

/// Submits work items and waits for them under a [`PollPolicy`].
///
/// Holds no per-job state, so one monitor can drive many concurrent
/// `execute` calls.
pub struct RemoteJobMonitor<E> {
    executor: E,
}

impl<E: RemoteExecutor> RemoteJobMonitor<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Submit `descriptor` and wait for a terminal status.
    pub async fn execute(
        &self,
        descriptor: &JobDescriptor,
        policy: &PollPolicy,
    ) -> Result<JobResult, MonitorError> {
        self.execute_until(descriptor, policy, std::future::pending())
            .await
    }

    /// Like [`execute`](Self::execute), but stops waiting as soon as `abort`
    /// completes, whether sleeping or mid-query.
    pub async fn execute_until<A>(
        &self,
        descriptor: &JobDescriptor,
        policy: &PollPolicy,
        abort: A,
    ) -> Result<JobResult, MonitorError>
    where
        A: Future<Output = ()>,
    {
        tokio::pin!(abort);

        let (handle, initial) = self
            .executor
            .submit(descriptor)
            .await
            .map_err(|e| MonitorError::Submission {
                detail: e.to_string(),
            })?;
        let start = Instant::now();
        info!(
            work_item = %handle,
            activity = descriptor.activity_id(),
            status = %initial,
            "work item submitted"
        );

        let mut last_status = if initial.is_terminal() {
            // A terminal status from submission is not an observation; the
            // loop still polls for it.
            JobStatus::Pending
        } else {
            initial
        };
        let mut retry = RetryPolicy::new(policy.max_query_attempts);
        let mut polls = 0u32;
        let deadline = start + policy.max_wait;

        loop {
            let elapsed = start.elapsed();
            if elapsed >= policy.max_wait {
                return Err(timed_out(handle, start, last_status));
            }

            // Clamp the last nap so no query lands after the budget.
            let nap = policy.interval.min(policy.max_wait - elapsed);
            if let Wake::Aborted = race(tokio::time::sleep(nap), abort.as_mut()).await {
                return Err(aborted(handle, start, last_status));
            }

            polls += 1;
            // An in-flight query is cut off at the deadline too.
            let query = tokio::time::timeout_at(deadline, self.executor.query(&handle));
            let outcome = match race(query, abort.as_mut()).await {
                Wake::Ready(Ok(outcome)) => outcome,
                Wake::Ready(Err(_)) => return Err(timed_out(handle, start, last_status)),
                Wake::Aborted => return Err(aborted(handle, start, last_status)),
            };

            match outcome {
                Ok(report) => {
                    retry.reset();
                    let elapsed = start.elapsed();
                    info!(
                        work_item = %handle,
                        elapsed_secs = elapsed.as_secs(),
                        status = %report.remote_status,
                        progress = report.progress.as_deref().unwrap_or(""),
                        "work item status"
                    );

                    if report.status.is_terminal() {
                        if let Some(url) = &report.report_url {
                            info!(
                                work_item = %handle,
                                report_url = %redact_report_url(url),
                                "work item report available"
                            );
                        }
                        return Ok(JobResult {
                            status: report.status,
                            remote_status: report.remote_status,
                            elapsed,
                            polls,
                            diagnostics: report.diagnostics,
                            report_url: report.report_url,
                            finished_at: Utc::now(),
                        });
                    }
                    last_status = report.status;
                }
                Err(e) => {
                    let detail = e.to_string();
                    match retry.record_failure(&detail) {
                        RetryDecision::Retry { attempt } => {
                            debug!(work_item = %handle, attempt, "will retry status query");
                        }
                        RetryDecision::Exhausted => {
                            return Err(MonitorError::Transport {
                                handle,
                                attempts: retry.consecutive_failures(),
                                detail,
                            });
                        }
                    }
                }
            }
        }
    }
}

fn timed_out(handle: JobHandle, start: Instant, last_status: JobStatus) -> MonitorError {
    let elapsed = start.elapsed();
    info!(work_item = %handle, elapsed_secs = elapsed.as_secs(), "work item wait timed out");
    MonitorError::Timeout {
        handle,
        elapsed,
        last_status,
    }
}

/// Report URLs are signed; only scheme, host and path are logged.
fn redact_report_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => crate::client::redact(&parsed),
        Err(_) => "<unparseable>".to_string(),
    }
}

fn aborted(handle: JobHandle, start: Instant, last_status: JobStatus) -> MonitorError {
    let elapsed = start.elapsed();
    info!(work_item = %handle, elapsed_secs = elapsed.as_secs(), "stopped waiting for work item");
    MonitorError::Aborted {
        handle,
        elapsed,
        last_status,
    }
}

/// Drive `work` unless `abort` completes first.
async fn race<T, W, A>(work: W, abort: std::pin::Pin<&mut A>) -> Wake<T>
where
    W: Future<Output = T>,
    A: Future<Output = ()>,
{
    tokio::select! {
        biased;
        _ = abort => Wake::Aborted,
        value = work => Wake::Ready(value),
    }
}
