//! Local filesystem durable store.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::DurableStore;
use skysync_common::{Error, Result};

/// Characters escaped when turning a key into a file name.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Extension used for value files.
const VALUE_EXTENSION: &str = "json";

/// Extension used for keys stored under a hashed name.
const HASHED_EXTENSION: &str = "long";

/// Longest encoded key kept as a file name. Filesystems cap names at 255 bytes.
const MAX_ENCODED_KEY_LEN: usize = 200;

/// Contents of a hashed file: the name no longer carries the key.
#[derive(Serialize, Deserialize)]
struct HashedRecord {
    key: String,
    value: String,
}

/// Where a key lives on disk.
enum KeyFile {
    Plain(PathBuf),
    Hashed(PathBuf),
}

impl KeyFile {
    fn path(&self) -> &Path {
        match self {
            KeyFile::Plain(path) | KeyFile::Hashed(path) => path,
        }
    }
}

/// Local filesystem store.
///
/// Stores each key as one file under a root directory. Writes go to a
/// temporary file first and are renamed into place.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Platform data directory used when no root is configured.
    pub fn default_root() -> Result<PathBuf> {
        dirs::data_local_dir()
            .map(|dir| dir.join("skysync"))
            .ok_or_else(|| Error::NotFound("No local data directory on this platform".to_string()))
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_file(&self, key: &str) -> Result<KeyFile> {
        if key.is_empty() {
            return Err(Error::InvalidInput("Store key must not be empty".to_string()));
        }

        let encoded = utf8_percent_encode(key, KEY_ENCODE_SET).to_string();
        if encoded.len() <= MAX_ENCODED_KEY_LEN {
            return Ok(KeyFile::Plain(
                self.root.join(format!("{}.{}", encoded, VALUE_EXTENSION)),
            ));
        }

        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
        Ok(KeyFile::Hashed(
            self.root.join(format!("{}.{}", id, HASHED_EXTENSION)),
        ))
    }

    async fn read_hashed_key(path: &Path) -> Option<String> {
        let raw = fs::read_to_string(path).await.ok()?;
        serde_json::from_str::<HashedRecord>(&raw)
            .ok()
            .map(|record| record.key)
    }

    fn path_to_key(path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        percent_decode_str(stem)
            .decode_utf8()
            .ok()
            .map(|key| key.into_owned())
    }
}

#[async_trait]
impl DurableStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let file = self.key_file(key)?;
        let raw = match fs::read_to_string(file.path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };

        match file {
            KeyFile::Plain(_) => Ok(Some(raw)),
            KeyFile::Hashed(_) => {
                let record: HashedRecord = serde_json::from_str(&raw)?;
                Ok((record.key == key).then_some(record.value))
            }
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let file = self.key_file(key)?;
        let len = value.len();
        let contents = match &file {
            KeyFile::Plain(_) => value,
            KeyFile::Hashed(_) => serde_json::to_string(&HashedRecord {
                key: key.to_string(),
                value,
            })?,
        };
        let tmp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        fs::write(&tmp, contents.as_bytes()).await?;
        if let Err(e) = fs::rename(&tmp, file.path()).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Io(e));
        }

        debug!("Wrote {} ({} bytes)", key, len);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_file(key)?.path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let key = match path.extension().and_then(|e| e.to_str()) {
                Some(VALUE_EXTENSION) => Self::path_to_key(&path),
                Some(HASHED_EXTENSION) => Self::read_hashed_key(&path).await,
                _ => continue,
            };
            match key {
                Some(key) => keys.push(key),
                None => warn!("Skipping undecodable store file {}", path.display()),
            }
        }

        keys.sort();
        Ok(keys)
    }
}
