//! HTTP transport - the layer that actually moves bytes
//!
//! The manager talks to the transport through the [`Transport`] trait:
//! - a session bound to a stable identifier, whose tasks outlive the process
//! - enumeration of the tasks known to that session
//! - downloads by URL or from resume data, with progress and cancellation
//! - release of the partial file behind a dropped resume token

mod http;
mod persistence;
pub mod resume_data;

pub use http::*;
pub use persistence::*;
pub use resume_data::ResumeData;

use crate::error::BgdlError;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Receives the completed fraction (0.0 to 1.0) of a running task
pub type ProgressCallback = Box<dyn Fn(f64) + Send + Sync>;

/// Where a download starts from
#[derive(Debug, Clone)]
pub enum DownloadSource {
    Url(Url),
    ResumeData(Vec<u8>),
}

/// A download the transport should perform
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub source: DownloadSource,
    /// Final location of the file; replaced if it exists
    pub destination: PathBuf,
}

/// Why a task ended without a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// Explicitly cancelled, either in this process or because the
    /// process that owned the task went away
    Cancelled,
    /// Connection failed or dropped mid-body
    Network,
    /// Server answered with an error status
    Server(u16),
    /// The resume data could not be used
    InvalidResumeData,
    /// Local file handling failed
    Io,
}

/// Terminal error of a task, with resume data when the task can continue
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    pub resume_data: Option<Vec<u8>>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            resume_data: None,
        }
    }

    pub fn cancelled(resume_data: Option<Vec<u8>>) -> Self {
        Self {
            kind: TaskErrorKind::Cancelled,
            message: "cancelled".to_string(),
            resume_data,
        }
    }

    pub fn with_resume_data(mut self, resume_data: Option<Vec<u8>>) -> Self {
        self.resume_data = resume_data;
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == TaskErrorKind::Cancelled
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::new(TaskErrorKind::Io, e.to_string())
    }
}

impl From<BgdlError> for TaskError {
    fn from(e: BgdlError) -> Self {
        match e {
            BgdlError::InvalidResumeData(_) | BgdlError::Plist(_) => {
                TaskError::new(TaskErrorKind::InvalidResumeData, e.to_string())
            }
            BgdlError::Network(_) => TaskError::new(TaskErrorKind::Network, e.to_string()),
            other => TaskError::new(TaskErrorKind::Io, other.to_string()),
        }
    }
}

/// A task known to the session
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_id: String,
    /// URL of the request the task was created with
    pub original_url: Option<Url>,
    /// Terminal error, `None` while the task is still running
    pub error: Option<TaskError>,
}

/// Background-capable HTTP transport
pub trait Transport: Send + Sync + 'static {
    /// Identifier the session is bound to
    fn session_id(&self) -> &str;

    /// Tasks known to the session, including ones left by an earlier
    /// process bound to the same identifier. Terminal tasks are reported
    /// once.
    fn all_tasks(&self) -> impl Future<Output = Result<Vec<TaskSnapshot>, BgdlError>> + Send;

    /// Run a download to completion, returning the final file path.
    ///
    /// `progress` is called as bytes arrive. Cancelling `cancel` ends the
    /// task with a [`TaskErrorKind::Cancelled`] error carrying resume data.
    fn download(
        &self,
        request: DownloadRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<PathBuf, TaskError>> + Send;

    /// Release what the session keeps on disk for `resume_data`, once the
    /// token is dropped or superseded
    fn discard(&self, resume_data: &[u8]) -> impl Future<Output = ()> + Send;
}
