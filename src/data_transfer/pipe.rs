use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;

static PIPE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Run-scoped name shared by the FIFO and both external tables.
///
/// Built from the process id, the wall-clock millisecond and a process-wide
/// sequence number, so concurrent runs inside one process never collide and
/// runs in different processes are separated by the pid. Only ASCII digits,
/// letters and underscores appear in the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeIdentity {
    name: String,
}

impl PipeIdentity {
    pub fn allocate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let sequence = PIPE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self::from_parts(std::process::id(), millis, sequence)
    }

    fn from_parts(pid: u32, millis: u128, sequence: u64) -> Self {
        Self {
            name: format!("pipe_{}_{}_{}", pid, millis, sequence),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn writable_table_name(&self) -> String {
        format!("{}_w", self.name)
    }

    pub fn readable_table_name(&self) -> String {
        format!("{}_r", self.name)
    }

    pub fn fifo_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.name)
    }
}

impl std::fmt::Display for PipeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[async_trait::async_trait]
pub trait PipeFilesystem: Send + Sync {
    async fn create_fifo(&self, path: &Path) -> Result<(), String>;

    /// Returns `Ok(false)` when nothing was there to remove.
    async fn remove_if_exists(&self, path: &Path) -> Result<bool, String>;
}

/// Named pipes on the local filesystem, created with `mkfifo`.
#[derive(Debug, Default, Clone)]
pub struct FifoFilesystem;

#[async_trait::async_trait]
impl PipeFilesystem for FifoFilesystem {
    async fn create_fifo(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                format!("Failed to create pipe directory '{}': {}", parent.display(), e)
            })?;
        }

        let output = Command::new("mkfifo")
            .arg(path)
            .output()
            .await
            .map_err(|e| format!("Failed to run mkfifo for '{}': {}", path.display(), e))?;
        if !output.status.success() {
            return Err(format!(
                "mkfifo '{}' exited with {}: {}",
                path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        verify_fifo(path).await
    }

    async fn remove_if_exists(&self, path: &Path) -> Result<bool, String> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(format!("Failed to remove pipe '{}': {}", path.display(), e)),
        }
    }
}

#[cfg(unix)]
async fn verify_fifo(path: &Path) -> Result<(), String> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| format!("Failed to stat pipe '{}': {}", path.display(), e))?;
    if metadata.file_type().is_fifo() {
        Ok(())
    } else {
        Err(format!("'{}' exists but is not a named pipe", path.display()))
    }
}

#[cfg(not(unix))]
async fn verify_fifo(path: &Path) -> Result<(), String> {
    Err(format!(
        "Named pipes are not supported on this platform ('{}')",
        path.display()
    ))
}
