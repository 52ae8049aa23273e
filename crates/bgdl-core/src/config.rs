//! Configuration file handling
//!
//! The configuration lives next to the data it describes as
//! `<data_dir>/config.json`. A missing file means the default layout under
//! `data_dir`.

use crate::error::BgdlError;
use bgdl_types::ManagerConfig;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const CONFIG_FILE: &str = "config.json";

/// Path of the configuration file under `data_dir`
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Load the configuration for `data_dir`
pub async fn load_config(data_dir: &Path) -> Result<ManagerConfig, BgdlError> {
    let path = config_path(data_dir);
    match fs::read_to_string(&path).await {
        Ok(json) => serde_json::from_str(&json)
            .map_err(|e| BgdlError::Serialization(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No config at {}, using defaults", path.display());
            Ok(ManagerConfig::with_root(data_dir))
        }
        Err(e) => Err(e.into()),
    }
}

/// Write `config` to `data_dir`, returning the file path
pub async fn save_config(data_dir: &Path, config: &ManagerConfig) -> Result<PathBuf, BgdlError> {
    let path = config_path(data_dir);
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| BgdlError::Serialization(e.to_string()))?;

    fs::create_dir_all(data_dir).await?;
    fs::write(&path, json).await?;
    Ok(path)
}
