//! bgdl Core - Resumable Background Download Engine
//!
//! This crate provides the download manager used by bgdl consumers.
//! It handles pause/resume through persisted resume tokens, repairs tokens
//! written by other platform versions, and picks up transfers left behind
//! by an earlier process.

pub mod archive;
mod config;
pub mod corrector;
mod engine;
mod error;
mod storage;
pub mod transport;

pub use config::*;
pub use corrector::{Correction, ResumeTokenCorrector};
pub use engine::*;
pub use error::*;
pub use storage::*;
pub use transport::{HttpTransport, Transport};

pub use bgdl_types::{ManagerConfig, StoredToken, TransferErrorKind, TransferEvent, TransferId};
