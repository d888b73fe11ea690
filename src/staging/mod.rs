//! Staging Store (§4.A): scoped, per-association/per-request temp directories on local storage.

use crate::config::StagingConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StagingError {
	#[error("staging root {0} is not writable: {1}")]
	RootUnwritable(PathBuf, std::io::Error),
	#[error("staging usage exceeds high-water threshold ({used} > {limit} bytes)")]
	HighWater { used: u64, limit: u64 },
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// A writable directory uniquely owned by one scope (one association or one inference request).
#[derive(Debug, Clone)]
pub struct StagingHandle {
	scope_id: String,
	path: PathBuf,
}

impl StagingHandle {
	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn scope_id(&self) -> &str {
		&self.scope_id
	}

	/// Destination path for a received SOP instance, per §4.C step 5.
	pub fn instance_path(&self, sop_instance_uid: &str) -> PathBuf {
		self.path.join(format!("{sop_instance_uid}.dcm"))
	}
}

pub struct StagingStore {
	config: StagingConfig,
}

impl StagingStore {
	pub fn new(config: StagingConfig) -> Self {
		Self { config }
	}

	/// Acquires a fresh, uniquely-named directory for `scope_id`. Directories are never reused
	/// across scopes, even if the same `scope_id` is requested twice (callers must pass unique
	/// scope identifiers, e.g. an association UUID or inference request id).
	pub async fn acquire(&self, scope_id: &str) -> Result<StagingHandle, StagingError> {
		if let Err(err) = fs::create_dir_all(&self.config.root).await {
			return Err(StagingError::RootUnwritable(self.config.root.clone(), err));
		}

		if let Some(used) = Self::directory_size(&self.config.root).await.ok() {
			if used > self.config.high_water_bytes {
				return Err(StagingError::HighWater {
					used,
					limit: self.config.high_water_bytes,
				});
			}
		}

		let path = self.config.root.join(scope_id);
		fs::create_dir_all(&path).await?;
		debug!(scope_id, path = %path.display(), "Acquired staging directory");

		Ok(StagingHandle {
			scope_id: scope_id.to_string(),
			path,
		})
	}

	/// Explicitly releases a scope, deleting its directory and contents immediately.
	pub async fn release(&self, handle: StagingHandle) -> Result<(), StagingError> {
		if handle.path.exists() {
			fs::remove_dir_all(&handle.path).await?;
			info!(scope_id = handle.scope_id, "Released staging directory");
		}
		Ok(())
	}

	/// Deletes scopes whose directory's modification time is older than `retention_hours`.
	/// Intended to run periodically as a background reaper.
	pub async fn reap_expired(&self) -> Result<usize, StagingError> {
		let retention = Duration::from_secs(self.config.retention_hours * 3600);
		let mut reaped = 0usize;
		let mut entries = match fs::read_dir(&self.config.root).await {
			Ok(entries) => entries,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(err) => return Err(err.into()),
		};

		while let Some(entry) = entries.next_entry().await? {
			let metadata = entry.metadata().await?;
			if !metadata.is_dir() {
				continue;
			}
			let age = metadata
				.modified()?
				.elapsed()
				.unwrap_or(Duration::ZERO);
			if age > retention {
				fs::remove_dir_all(entry.path()).await?;
				reaped += 1;
				warn!(path = %entry.path().display(), "Reaped expired staging directory");
			}
		}
		Ok(reaped)
	}

	async fn directory_size(root: &Path) -> Result<u64, std::io::Error> {
		let mut total = 0u64;
		let mut stack = vec![root.to_path_buf()];
		while let Some(dir) = stack.pop() {
			let mut entries = match fs::read_dir(&dir).await {
				Ok(entries) => entries,
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
				Err(err) => return Err(err),
			};
			while let Some(entry) = entries.next_entry().await? {
				let metadata = entry.metadata().await?;
				if metadata.is_dir() {
					stack.push(entry.path());
				} else {
					total += metadata.len();
				}
			}
		}
		Ok(total)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(root: &Path) -> StagingConfig {
		StagingConfig {
			root: root.to_path_buf(),
			retention_hours: 24,
			high_water_bytes: u64::MAX,
		}
	}

	#[tokio::test]
	async fn acquire_creates_writable_directory() {
		let tmp = tempfile::tempdir().unwrap();
		let store = StagingStore::new(config(tmp.path()));
		let handle = store.acquire("assoc-1").await.unwrap();
		assert!(handle.path().is_dir());
		assert_eq!(
			handle.instance_path("1.2.3"),
			handle.path().join("1.2.3.dcm")
		);
	}

	#[tokio::test]
	async fn release_removes_directory() {
		let tmp = tempfile::tempdir().unwrap();
		let store = StagingStore::new(config(tmp.path()));
		let handle = store.acquire("assoc-1").await.unwrap();
		let path = handle.path().to_path_buf();
		store.release(handle).await.unwrap();
		assert!(!path.exists());
	}

	#[tokio::test]
	async fn high_water_threshold_rejects_new_scopes() {
		let tmp = tempfile::tempdir().unwrap();
		let mut cfg = config(tmp.path());
		cfg.high_water_bytes = 0;
		let store = StagingStore::new(cfg);
		let err = store.acquire("assoc-1").await.unwrap_err();
		assert!(matches!(err, StagingError::HighWater { .. }));
	}
}
