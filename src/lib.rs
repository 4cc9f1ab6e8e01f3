//! Client SDK for Autodesk Platform Services Design Automation.
//!
//! Deploy app bundles and activities, move files through OSS, submit work
//! items and wait for them under a bounded time budget with
//! [`RemoteJobMonitor`].

pub mod acc;
pub mod account;
pub mod activity;
pub mod appbundle;
pub mod auth;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod monitor;
pub mod oss;
pub mod retry;
pub mod runner;
pub mod signals;
pub mod workitem;

pub use auth::{AuthContext, BearerToken};
pub use client::ApsClient;
pub use config::{load_config, AutomationConfig};
pub use descriptor::{JobDescriptor, Location, ParameterSpec};
pub use error::ApiError;
pub use monitor::{
    JobResult, JobStatus, MonitorError, PollPolicy, RemoteExecutor, RemoteJobMonitor,
};
pub use runner::{ObjectTransfer, RunError, RunOutcome, WorkItemRunner};
pub use workitem::DesignAutomationExecutor;
