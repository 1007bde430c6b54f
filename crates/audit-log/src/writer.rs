use std::path::{Path, PathBuf};

use tokio::io::{AsyncWriteExt, BufWriter};

use crate::entry::AuditEntry;

/// Errors that can occur during audit log I/O.
#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("failed to create audit log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open audit log {path}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize audit entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write to audit log: {0}")]
    Write(std::io::Error),

    #[error("failed to flush audit log: {0}")]
    Flush(std::io::Error),
}

/// Append-only JSON-lines writer.
///
/// Lines are buffered in memory; nothing is guaranteed on disk until
/// [`flush`](Self::flush) returns.
pub struct AuditWriter {
    file: BufWriter<tokio::fs::File>,
}

impl AuditWriter {
    /// Open (or create) the audit log at `path` in append mode, creating
    /// parent directories as needed.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, AuditWriteError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| AuditWriteError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| AuditWriteError::OpenFile {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            file: BufWriter::new(file),
        })
    }

    /// Serialise `entry` as exactly one newline-terminated JSON line.
    pub async fn write(&mut self, entry: &AuditEntry) -> Result<(), AuditWriteError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .await
            .map_err(AuditWriteError::Write)
    }

    pub async fn flush(&mut self) -> Result<(), AuditWriteError> {
        self.file.flush().await.map_err(AuditWriteError::Flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuditEventType, AuditSource};

    #[tokio::test]
    async fn creates_parent_directories_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");

        let mut writer = AuditWriter::new(&path).await.unwrap();
        for _ in 0..2 {
            let entry = AuditEntry::new(
                AuditEventType::ConnectionEvicted,
                AuditSource::new("liveness"),
                serde_json::Value::Null,
            );
            writer.write(&entry).await.unwrap();
        }
        writer.flush().await.unwrap();
        drop(writer);

        // Reopening must append rather than truncate.
        let mut writer = AuditWriter::new(&path).await.unwrap();
        let entry = AuditEntry::new(
            AuditEventType::ProcessStopped,
            AuditSource::new("rendezvous"),
            serde_json::Value::Null,
        );
        writer.write(&entry).await.unwrap();
        writer.flush().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.ends_with('\n'));
    }
}
