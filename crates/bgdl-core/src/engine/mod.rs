//! Download Engine - transfer bookkeeping and the manager facade
//!
//! - Registry of active transfers with per-handle cancellation
//! - Recovery of transfers interrupted by the end of a process
//! - The manager tying registry, token store, corrector and transport together

mod manager;
pub mod recovery;
mod registry;

pub use manager::*;
pub use registry::*;
