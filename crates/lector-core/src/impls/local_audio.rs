//! LocalAudioStore - ローカルディレクトリ上の AudioStore
//!
//! blob は `<root>/audio-<ULID>.<ext>` というファイルになります。
//! 書き込みは `.<key>.part` に書いて fsync してから rename します。
//! 途中で落ちても正しい名前のファイルは常に完全です。

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::{AudioRef, QueueError};
use crate::ports::{AudioStore, IdGenerator};

pub struct LocalAudioStore {
    root: PathBuf,
    ids: Arc<dyn IdGenerator>,
}

impl LocalAudioStore {
    /// Create the root directory if needed.
    pub async fn open(root: impl Into<PathBuf>, ids: Arc<dyn IdGenerator>) -> Result<Self, QueueError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root, ids })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, audio: &AudioRef) -> Result<PathBuf, QueueError> {
        let key = audio.as_str();
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            return Err(QueueError::InvalidArgument(format!("invalid audio key '{key}'")));
        }
        Ok(self.root.join(key))
    }
}

fn normalize_extension(extension: &str) -> Result<String, QueueError> {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(QueueError::InvalidArgument(format!(
            "invalid audio extension '{extension}'"
        )));
    }
    Ok(ext)
}

async fn write_synced(partial: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(partial).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(partial, path).await
}

/// Persist the rename itself.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl AudioStore for LocalAudioStore {
    async fn put(&self, bytes: &[u8], extension: &str) -> Result<AudioRef, QueueError> {
        let ext = normalize_extension(extension)?;
        let audio = AudioRef::new(format!("{}.{ext}", self.ids.generate_audio_id()));
        let path = self.path_of(&audio)?;
        let partial = self.root.join(format!(".{audio}.part"));
        if let Err(e) = write_synced(&partial, &path, bytes).await {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await
                && cleanup.kind() != IoErrorKind::NotFound
            {
                warn!(path = %partial.display(), error = %cleanup, "could not remove partial audio");
            }
            return Err(e.into());
        }
        sync_dir(&self.root).await?;
        debug!(audio = %audio, bytes = bytes.len(), "audio stored");
        Ok(audio)
    }

    async fn read(&self, audio: &AudioRef) -> Result<Vec<u8>, QueueError> {
        let path = self.path_of(audio)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == IoErrorKind::NotFound => Err(QueueError::InvalidArgument(
                format!("audio file not found: {audio}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, audio: &AudioRef) -> Result<bool, QueueError> {
        let path = self.path_of(audio)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
