//! End-to-end work item run: upload inputs, execute, download outputs.

use crate::descriptor::{JobDescriptor, ObjectLocation};
use crate::error::ApiError;
use crate::monitor::{JobResult, MonitorError, PollPolicy, RemoteExecutor, RemoteJobMonitor};
use std::future::Future;
use std::path::{Path, PathBuf};

/// Moves bytes between local files and the storage locations named in a
/// descriptor.
pub trait ObjectTransfer: Send + Sync {
    /// Upload `source` to `object`. Returns the bytes sent.
    fn upload(
        &self,
        object: &ObjectLocation,
        source: &Path,
    ) -> impl Future<Output = Result<u64, ApiError>> + Send;

    /// Download `object` into `dest`. Returns the bytes written.
    fn download(
        &self,
        object: &ObjectLocation,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, ApiError>> + Send;
}

/// Errors from [`WorkItemRunner::run`].
#[derive(Debug)]
pub enum RunError {
    /// Uploading an inbound file failed; nothing was submitted.
    Upload { parameter: String, source: ApiError },
    Monitor(MonitorError),
    /// The work item succeeded but an output could not be downloaded.
    Download {
        parameter: String,
        result: Box<JobResult>,
        source: ApiError,
    },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Upload { parameter, source } => {
                write!(f, "failed to upload input '{parameter}': {source}")
            }
            RunError::Monitor(e) => write!(f, "{e}"),
            RunError::Download {
                parameter, source, ..
            } => write!(
                f,
                "work item succeeded but output '{parameter}' could not be downloaded: {source}"
            ),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Upload { source, .. } => Some(source),
            RunError::Monitor(e) => Some(e),
            RunError::Download { source, .. } => Some(source),
        }
    }
}

impl From<MonitorError> for RunError {
    fn from(e: MonitorError) -> Self {
        RunError::Monitor(e)
    }
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub result: JobResult,
    /// Local files written from outbound parameters (empty unless Succeeded).
    pub downloaded: Vec<PathBuf>,
}

/// Ties a [`RemoteJobMonitor`] to an [`ObjectTransfer`].
pub struct WorkItemRunner<E, T> {
    monitor: RemoteJobMonitor<E>,
    transfer: T,
}

impl<E: RemoteExecutor, T: ObjectTransfer> WorkItemRunner<E, T> {
    pub fn new(monitor: RemoteJobMonitor<E>, transfer: T) -> Self {
        Self { monitor, transfer }
    }

    pub fn monitor(&self) -> &RemoteJobMonitor<E> {
        &self.monitor
    }

    pub async fn run(
        &self,
        descriptor: &JobDescriptor,
        policy: &PollPolicy,
    ) -> Result<RunOutcome, RunError> {
        self.run_until(descriptor, policy, std::future::pending())
            .await
    }

    /// Run, giving up the wait when `abort` completes.
    pub async fn run_until<A>(
        &self,
        descriptor: &JobDescriptor,
        policy: &PollPolicy,
        abort: A,
    ) -> Result<RunOutcome, RunError>
    where
        A: Future<Output = ()>,
    {
        for (param, object, source) in descriptor.uploads() {
            self.transfer
                .upload(object, source)
                .await
                .map_err(|e| RunError::Upload {
                    parameter: param.name.clone(),
                    source: e,
                })?;
        }

        let result = self.monitor.execute_until(descriptor, policy, abort).await?;
        if !result.succeeded() {
            tracing::warn!(
                status = %result.remote_status,
                "work item did not succeed, skipping output downloads"
            );
            return Ok(RunOutcome {
                result,
                downloaded: Vec::new(),
            });
        }

        let mut downloaded = Vec::new();
        for (param, object, dest) in descriptor.downloads() {
            if let Err(e) = self.transfer.download(object, dest).await {
                return Err(RunError::Download {
                    parameter: param.name.clone(),
                    result: Box::new(result),
                    source: e,
                });
            }
            downloaded.push(dest.to_path_buf());
        }

        Ok(RunOutcome { result, downloaded })
    }
}
