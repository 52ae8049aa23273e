//! Shared types for bgdl
//!
//! This crate contains the data structures shared between the core
//! download engine and its consumers (the CLI, or any UI layer).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Transfer Types
// ============================================================================

/// Caller-assigned identifier of one logical download.
///
/// Stable across pause, resume and relaunch cycles. It is the join key
/// between the in-memory registry and the resume tokens on disk.
pub type TransferId = u64;

/// Summary of a resume token persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub id: TransferId,
    /// Download URL recorded in the token, if it could be read
    pub url: Option<String>,
    /// Bytes already on disk for this transfer
    pub bytes_received: Option<u64>,
    /// Size of the token file itself
    pub size_on_disk: u64,
}

// ============================================================================
// Event Types
// ============================================================================

/// Class of failure reported through [`TransferEvent::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferErrorKind {
    /// The transfer ended with no way to continue it
    Transfer,
    /// A resume token could not be written or removed
    Storage,
}

/// Events emitted by the download manager.
///
/// For a single transfer the order is always zero or more `Progress`
/// events followed by exactly one of `Completed`, `Paused` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferEvent {
    Progress {
        id: TransferId,
        /// 0.0 to 1.0
        fraction: f64,
    },
    Completed {
        id: TransferId,
    },
    Paused {
        id: TransferId,
    },
    Error {
        id: Option<TransferId>,
        kind: TransferErrorKind,
        message: String,
    },
    PreviousDownloadDetected {
        id: TransferId,
    },
}

impl TransferEvent {
    /// Transfer this event belongs to, if any
    pub fn id(&self) -> Option<TransferId> {
        match self {
            TransferEvent::Progress { id, .. }
            | TransferEvent::Completed { id }
            | TransferEvent::Paused { id }
            | TransferEvent::PreviousDownloadDetected { id } => Some(*id),
            TransferEvent::Error { id, .. } => *id,
        }
    }

    /// Whether this event ends the transfer it belongs to
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed { .. }
                | TransferEvent::Paused { .. }
                | TransferEvent::Error { .. }
        )
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Lowest platform version whose resume tokens need correcting
pub const CORRECTION_MIN_PLATFORM_VERSION: f32 = 10.0;

/// Default identifier of the background transfer session
pub const DEFAULT_SESSION_ID: &str = "bgdl.background-session";

/// Download manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Identity of the background session. Tasks started under one
    /// identifier are recovered by the next process using the same one.
    #[serde(default = "default_session_id")]
    pub session_id: String,
    /// Where completed files land
    pub destination_dir: PathBuf,
    /// Where resume tokens are kept, one file per transfer
    pub token_dir: PathBuf,
    /// Root of the session directories (partial files and task journal)
    pub session_dir: PathBuf,
    /// Version of the archive format the running platform produces.
    /// Tokens are only corrected at or above [`CORRECTION_MIN_PLATFORM_VERSION`].
    #[serde(default = "default_platform_version")]
    pub platform_version: f32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_session_id() -> String {
    DEFAULT_SESSION_ID.to_string()
}

fn default_platform_version() -> f32 {
    CORRECTION_MIN_PLATFORM_VERSION
}

fn default_user_agent() -> String {
    format!("bgdl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    1000
}

impl ManagerConfig {
    /// Configuration with every directory placed under `root`
    pub fn with_root(root: &Path) -> Self {
        Self {
            session_id: default_session_id(),
            destination_dir: root.join("downloads"),
            token_dir: root.join("resume"),
            session_dir: root.join("sessions"),
            platform_version: default_platform_version(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
            event_capacity: default_event_capacity(),
        }
    }

    /// Use a different session identity
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let cache = dirs::cache_dir()
            .map(|p| p.join("bgdl"))
            .unwrap_or_else(|| PathBuf::from(".bgdl/cache"));
        let data = dirs::data_dir()
            .map(|p| p.join("bgdl"))
            .unwrap_or_else(|| PathBuf::from(".bgdl/data"));

        Self {
            session_id: default_session_id(),
            destination_dir: dirs::download_dir()
                .map(|p| p.join("bgdl"))
                .unwrap_or_else(|| PathBuf::from(".")),
            token_dir: cache.join("resume"),
            session_dir: data.join("sessions"),
            platform_version: default_platform_version(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
            event_capacity: default_event_capacity(),
        }
    }
}
