//! Sidecar lock file that serializes snapshot writers across processes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::routing_error::{RoutingEngineResult, ThreadRoutingError};

pub(crate) const SNAPSHOT_LOCK_WAIT: Duration = Duration::from_secs(5);
pub(crate) const SNAPSHOT_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const SNAPSHOT_LOCK_POLL: Duration = Duration::from_millis(10);

pub(crate) struct SnapshotLockGuard {
    path: PathBuf,
}

impl Drop for SnapshotLockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// `<snapshot>.lock` next to the snapshot file.
pub(crate) fn snapshot_lock_path(snapshot_path: &Path) -> PathBuf {
    let mut name = snapshot_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "routing-store".into());
    name.push(".lock");
    snapshot_path.with_file_name(name)
}

pub(crate) async fn acquire_snapshot_lock(
    path: &Path,
    timeout: Duration,
    stale_after: Duration,
) -> RoutingEngineResult<SnapshotLockGuard> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let start = SystemTime::now();
    loop {
        match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                return Ok(SnapshotLockGuard {
                    path: path.to_path_buf(),
                });
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                if reclaim_stale_lock(path, stale_after) {
                    tracing::warn!(lock = %path.display(), "reclaimed stale snapshot lock");
                    continue;
                }
                let elapsed = SystemTime::now().duration_since(start).unwrap_or_default();
                if elapsed >= timeout {
                    return Err(ThreadRoutingError::StoreUnavailable(format!(
                        "timed out acquiring snapshot lock {}",
                        path.display()
                    )));
                }
                tokio::time::sleep(SNAPSHOT_LOCK_POLL).await;
            }
            Err(error) => return Err(error.into()),
        }
    }
}

fn reclaim_stale_lock(path: &Path, stale_after: Duration) -> bool {
    if stale_after.is_zero() {
        return false;
    }
    let Ok(modified) = fs::metadata(path).and_then(|metadata| metadata.modified()) else {
        return false;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    age >= stale_after && fs::remove_file(path).is_ok()
}
