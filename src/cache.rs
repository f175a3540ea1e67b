//! Cache Store (§4.3): persists `Cache` to a path chosen by the operator,
//! atomically with respect to process crashes via write-then-sync-then-rename.

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::core::error::Result;
use crate::core::model::Cache;

/// Loads a cache file. Any read failure (missing, malformed, truncated)
/// downgrades to "no cache" with a logged warning rather than propagating,
/// per §4.3.
pub async fn load(path: &Path) -> Option<Cache> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return None;
        }
        Err(err) => {
            warn!(?path, %err, "cache file unreadable, continuing with no cache");
            return None;
        }
    };
    match serde_json::from_slice::<Cache>(&raw) {
        Ok(cache) => Some(cache),
        Err(err) => {
            warn!(?path, %err, "cache file malformed, continuing with no cache");
            None
        }
    }
}

/// Writes a temp file adjacent to `path`, fsyncs it, then renames it into
/// place. The rename is the only visible mutation to `path`, so a crash
/// mid-write never leaves a torn file behind.
pub async fn save(path: &Path, cache: &Cache) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let raw = serde_json::to_vec(cache)?;
    let tmp_path = tmp_path_for(path);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&raw).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// A loaded cache is usable only while fresh; zero `update_interval` means
/// "never considered stale" (refresh loop is disabled in that case, so
/// staleness is moot).
pub fn is_stale(cache: &Cache, update_interval: Duration) -> bool {
    if update_interval.is_zero() {
        return false;
    }
    let age = chrono::Utc::now().signed_duration_since(cache.last_update);
    match chrono::Duration::from_std(update_interval) {
        Ok(interval) => age >= interval,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cache() -> Cache {
        Cache {
            last_update: chrono::Utc::now(),
            outbounds: vec![],
            metrics: None,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile_dir();
        let path = dir.join("cache.json");
        let cache = sample_cache();
        save(&path, &cache).await.unwrap();
        let loaded = load(&path).await.expect("cache should load");
        assert_eq!(loaded.last_update, cache.last_update);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn load_missing_file_returns_none() {
        let dir = tempfile_dir();
        let path = dir.join("missing.json");
        assert!(load(&path).await.is_none());
    }

    #[tokio::test]
    async fn load_malformed_file_returns_none() {
        let dir = tempfile_dir();
        let path = dir.join("bad.json");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&path, b"not json").await.unwrap();
        assert!(load(&path).await.is_none());
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[test]
    fn stale_cache_detected_past_update_interval() {
        let mut cache = sample_cache();
        cache.last_update = chrono::Utc::now() - chrono::Duration::hours(2);
        assert!(is_stale(&cache, Duration::from_secs(3600)));
        assert!(!is_stale(&cache, Duration::from_secs(0)));
    }

    fn tempfile_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("proxyprovider-cache-test-{:?}", std::thread::current().id()))
    }
}
