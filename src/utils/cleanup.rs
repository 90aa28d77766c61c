//! Periodic media cleanup
//!
//! Captured media is uploaded right away, so local copies only need to
//! survive until the next sweep.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Delete the regular files directly inside `dir`, skipping `in_use`
///
/// Subdirectories are left alone. Returns the number of files removed.
pub async fn delete_files(dir: &Path, in_use: &HashSet<PathBuf>) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if in_use.contains(&path) {
            debug!("Keeping {} (in use)", path.display());
            continue;
        }
        tokio::fs::remove_file(&path).await?;
        debug!("Deleted {}", path.display());
        deleted += 1;
    }

    Ok(deleted)
}

/// Sweep `dirs` every `interval` until `shutdown` fires
///
/// `in_use` is consulted before each sweep so files still being written are
/// not removed.
pub async fn run_periodic_cleanup<F>(
    dirs: Vec<PathBuf>,
    interval: Duration,
    in_use: F,
    shutdown: CancellationToken,
) where
    F: Fn() -> HashSet<PathBuf> + Send,
{
    info!(
        "Media cleanup every {:?} for {} directories",
        interval,
        dirs.len()
    );
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Media cleanup stopped");
                return;
            }
            _ = ticker.tick() => {
                let keep = in_use();
                for dir in &dirs {
                    match delete_files(dir, &keep).await {
                        Ok(0) => debug!("Nothing to delete in {}", dir.display()),
                        Ok(n) => info!("Deleted {} files from {}", n, dir.display()),
                        Err(e) => warn!("Error deleting files in {}: {}", dir.display(), e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_files_keeps_dirs_and_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let busy = dir.path().join("busy.webm");
        tokio::fs::write(dir.path().join("a.jpeg"), b"a").await.unwrap();
        tokio::fs::write(dir.path().join("b.webm"), b"b").await.unwrap();
        tokio::fs::write(&busy, b"c").await.unwrap();
        tokio::fs::create_dir(dir.path().join("nested")).await.unwrap();

        let in_use = HashSet::from([busy.clone()]);
        let deleted = delete_files(dir.path(), &in_use).await.unwrap();

        assert_eq!(deleted, 2);
        assert!(busy.exists());
        assert!(dir.path().join("nested").is_dir());
        assert!(!dir.path().join("a.jpeg").exists());
    }

    #[tokio::test]
    async fn test_missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(delete_files(&dir.path().join("gone"), &HashSet::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_periodic_sweep_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("old.jpeg");
        tokio::fs::write(&file, b"x").await.unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_periodic_cleanup(
            vec![dir.path().to_path_buf()],
            Duration::from_millis(50),
            HashSet::new,
            shutdown.clone(),
        ));

        assert!(file.exists());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while file.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!file.exists());

        shutdown.cancel();
        task.await.unwrap();
    }
}
