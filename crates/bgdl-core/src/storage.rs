//! Storage layer for resume tokens (one property list file per transfer)

use crate::error::BgdlError;
use bgdl_types::TransferId;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const TOKEN_EXTENSION: &str = "plist";

/// Resume token storage
#[derive(Clone, Debug)]
pub struct ResumeTokenStore {
    /// Token directory
    dir: PathBuf,
}

impl ResumeTokenStore {
    /// Open the store, creating its directory
    pub async fn new(dir: PathBuf) -> Result<Self, BgdlError> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the token of `id`
    pub fn path_for(&self, id: TransferId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, TOKEN_EXTENSION))
    }

    /// Save a token, replacing any previous one.
    ///
    /// The blob is written to a temporary file first and renamed into
    /// place, so a failed write never leaves a truncated token behind.
    pub async fn save(&self, id: TransferId, blob: &[u8]) -> Result<(), BgdlError> {
        let path = self.path_for(id);
        let tmp = self.dir.join(format!("{}.{}.tmp", id, TOKEN_EXTENSION));

        if let Err(e) = fs::write(&tmp, blob).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Load the token of `id`, `None` if there is none
    pub async fn load(&self, id: TransferId) -> Result<Option<Vec<u8>>, BgdlError> {
        match fs::read(self.path_for(id)).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a token exists for `id`
    pub async fn exists(&self, id: TransferId) -> bool {
        fs::try_exists(self.path_for(id)).await.unwrap_or(false)
    }

    /// Delete the token of `id`; a missing token is not an error
    pub async fn delete(&self, id: TransferId) -> Result<(), BgdlError> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All transfer ids that have a token, sorted
    pub async fn list(&self) -> Result<Vec<TransferId>, BgdlError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == TOKEN_EXTENSION).unwrap_or(false) {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<TransferId>().ok())
                {
                    ids.push(id);
                }
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, ResumeTokenStore) {
        let temp = TempDir::new().unwrap();
        let store = ResumeTokenStore::new(temp.path().join("resume")).await.unwrap();
        (temp, store)
    }

    #[tokio::test]
    async fn test_save_load_replace() {
        let (_temp, store) = store().await;

        assert_eq!(store.load(4).await.unwrap(), None);
        store.save(4, b"first").await.unwrap();
        store.save(4, b"second").await.unwrap();

        assert_eq!(store.load(4).await.unwrap().as_deref(), Some(b"second".as_slice()));
        assert!(store.exists(4).await);
        assert!(store.path_for(4).ends_with("4.plist"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let (_temp, store) = store().await;

        store.delete(12).await.unwrap();
        store.save(12, b"x").await.unwrap();
        store.delete(12).await.unwrap();
        assert!(!store.exists(12).await);
    }

    #[tokio::test]
    async fn test_list_ignores_leftovers() {
        let (_temp, store) = store().await;

        store.save(7, b"a").await.unwrap();
        store.save(2, b"b").await.unwrap();
        fs::write(store.dir().join("9.plist.tmp"), b"partial").await.unwrap();
        fs::write(store.dir().join("notes.txt"), b"?").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec![2, 7]);
        assert_eq!(store.load(9).await.unwrap(), None);
    }
}
