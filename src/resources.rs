//! Host resource sampling and admission thresholds.
//!
//! The worker loop samples the host before every receive. An unhealthy
//! snapshot stops intake until a later sample is healthy again; in between,
//! [`ResourceMonitor::mitigate`] is asked to free what it can.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sysinfo::{Disks, System};

use crate::error::Error;

/// Ceiling on the file age used during mitigation, regardless of configuration.
pub const MITIGATION_MAX_FILE_AGE: Duration = Duration::from_secs(60 * 60);

/// Point-in-time view of host resources. Never cached across admission checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub free_disk_bytes: u64,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    /// Verify the snapshot against `thresholds`, naming the first violated limit.
    pub fn check(&self, thresholds: &Thresholds) -> Result<(), Error> {
        if self.memory_percent > thresholds.max_memory_percent {
            return Err(Error::exhausted(format!(
                "memory at {:.1}% exceeds the {:.1}% limit",
                self.memory_percent, thresholds.max_memory_percent
            )));
        }

        if self.free_disk_bytes < thresholds.min_free_disk_bytes {
            return Err(Error::exhausted(format!(
                "{} bytes of free disk is below the {} byte minimum",
                self.free_disk_bytes, thresholds.min_free_disk_bytes
            )));
        }

        if let Some(max_cpu) = thresholds.max_cpu_percent {
            if self.cpu_percent > max_cpu {
                return Err(Error::exhausted(format!(
                    "cpu at {:.1}% exceeds the {max_cpu:.1}% limit",
                    self.cpu_percent
                )));
            }
        }

        Ok(())
    }

    pub fn is_healthy(&self, thresholds: &Thresholds) -> bool {
        self.check(thresholds).is_ok()
    }
}

/// Admission limits.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    max_memory_percent: f64,
    min_free_disk_bytes: u64,
    max_cpu_percent: Option<f64>,
}

#[bon::bon]
impl Thresholds {
    #[builder]
    pub fn new(
        #[builder(default = 90.0)] max_memory_percent: f64,
        #[builder(default = 1024 * 1024 * 1024)] min_free_disk_bytes: u64,
        max_cpu_percent: Option<f64>,
    ) -> Self {
        Self {
            max_memory_percent,
            min_free_disk_bytes,
            max_cpu_percent,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Thresholds {
    /// Thresholds expressed as "keep at least this much memory free".
    pub fn from_free_memory_percent(
        min_free_memory_percent: f64,
        min_free_disk_bytes: u64,
        max_cpu_percent: Option<f64>,
    ) -> Self {
        Self::builder()
            .max_memory_percent(100.0 - min_free_memory_percent)
            .min_free_disk_bytes(min_free_disk_bytes)
            .maybe_max_cpu_percent(max_cpu_percent)
            .build()
    }

    pub fn max_memory_percent(&self) -> f64 {
        self.max_memory_percent
    }

    pub fn min_free_disk_bytes(&self) -> u64 {
        self.min_free_disk_bytes
    }

    pub fn max_cpu_percent(&self) -> Option<f64> {
        self.max_cpu_percent
    }
}

/// What a cleanup pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    pub files_removed: usize,
    pub bytes_freed: u64,
}

/// Source of resource snapshots for admission control.
///
/// Only the worker loop's control task calls into the monitor, so sampling
/// and mitigation are never run concurrently.
pub trait ResourceMonitor: Send + Sync + 'static {
    fn sample(&self) -> ResourceSnapshot;

    fn is_healthy(&self, thresholds: &Thresholds) -> bool {
        self.sample().is_healthy(thresholds)
    }

    /// Free resources after an unhealthy admission check.
    fn mitigate(&self) -> BoxFuture<'_, PurgeStats>;

    /// Periodic cleanup while the queue is idle.
    fn housekeeping(&self) -> BoxFuture<'_, PurgeStats> {
        Box::pin(async { PurgeStats::default() })
    }
}

/// Monitor backed by `sysinfo`, owning the worker's temporary directory.
pub struct SysinfoMonitor {
    system: Mutex<System>,
    temp_dir: PathBuf,
    temp_file_max_age: Duration,
}

#[bon::bon]
impl SysinfoMonitor {
    #[builder]
    pub fn new(
        #[builder(into)] temp_dir: PathBuf,
        #[builder(default = Duration::from_secs(24 * 60 * 60))] temp_file_max_age: Duration,
    ) -> Self {
        let temp_dir = absolute(temp_dir);

        let mut system = System::new();
        system.refresh_memory();
        // CPU usage is a delta between refreshes; prime the first one.
        system.refresh_cpu_usage();

        Self {
            system: Mutex::new(system),
            temp_dir,
            temp_file_max_age,
        }
    }
}

// Disk lookup matches mount points by prefix, which needs an absolute path.
fn absolute(path: PathBuf) -> PathBuf {
    let path = if path.is_relative() {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(e) => {
                tracing::warn!(
                    temp_dir = %path.display(),
                    error = %e,
                    "Cannot resolve relative temp dir; disk checks are disabled"
                );
                path
            }
        }
    } else {
        path
    };

    std::fs::canonicalize(&path).unwrap_or(path)
}

impl SysinfoMonitor {
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Free space on the disk whose mount point is the longest prefix of the temp dir.
    fn free_disk_bytes(&self) -> u64 {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|disk| self.temp_dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len());

        match disk {
            Some(disk) => disk.available_space(),
            None => {
                tracing::warn!(
                    temp_dir = %self.temp_dir.display(),
                    "No disk found for temp dir, skipping the free space check"
                );
                u64::MAX
            }
        }
    }

    async fn purge(&self, max_age: Duration) -> PurgeStats {
        match purge_stale_files(&self.temp_dir, max_age).await {
            Ok(stats) => {
                if stats.files_removed > 0 {
                    tracing::info!(
                        files = stats.files_removed,
                        bytes = stats.bytes_freed,
                        "Purged stale temporary files"
                    );
                }
                stats
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to purge temporary files");
                PurgeStats::default()
            }
        }
    }
}

impl ResourceMonitor for SysinfoMonitor {
    fn sample(&self) -> ResourceSnapshot {
        let (memory_percent, cpu_percent) = {
            let mut system = self.system();
            system.refresh_memory();
            system.refresh_cpu_usage();

            let total = system.total_memory();
            let memory_percent = if total == 0 {
                0.0
            } else {
                let used = total.saturating_sub(system.available_memory());
                used as f64 / total as f64 * 100.0
            };

            (memory_percent, f64::from(system.global_cpu_usage()))
        };

        ResourceSnapshot {
            memory_percent,
            cpu_percent,
            free_disk_bytes: self.free_disk_bytes(),
            taken_at: Utc::now(),
        }
    }

    fn mitigate(&self) -> BoxFuture<'_, PurgeStats> {
        // Memory is released as soon as buffers drop, so there is nothing to
        // collect; temp files are the only thing left to reclaim.
        Box::pin(async move {
            self.purge(self.temp_file_max_age.min(MITIGATION_MAX_FILE_AGE))
                .await
        })
    }

    fn housekeeping(&self) -> BoxFuture<'_, PurgeStats> {
        Box::pin(async move { self.purge(self.temp_file_max_age).await })
    }
}

/// Remove regular files directly under `dir` last modified at least `max_age` ago.
///
/// A missing directory is treated as empty.
pub async fn purge_stale_files(dir: &Path, max_age: Duration) -> Result<PurgeStats, Error> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PurgeStats::default()),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut stats = PurgeStats::default();

    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            // Raced with another cleanup.
            Err(_) => continue,
        };
        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                stats.files_removed += 1;
                stats.bytes_freed += metadata.len();
            }
            Err(e) => {
                tracing::debug!(path = %entry.path().display(), error = %e, "Could not remove temp file");
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(memory_percent: f64, cpu_percent: f64, free_disk_bytes: u64) -> ResourceSnapshot {
        ResourceSnapshot {
            memory_percent,
            cpu_percent,
            free_disk_bytes,
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_over_threshold_is_unhealthy() {
        let thresholds = Thresholds::from_free_memory_percent(10.0, 1024, None);
        assert_eq!(thresholds.max_memory_percent(), 90.0);

        assert!(snapshot(89.0, 0.0, 4096).is_healthy(&thresholds));
        let err = snapshot(95.0, 0.0, 4096).check(&thresholds).unwrap_err();
        assert!(matches!(err, Error::ResourceExhaustion { .. }));
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn test_low_disk_is_unhealthy() {
        let thresholds = Thresholds::builder().min_free_disk_bytes(1024).build();
        assert!(!snapshot(10.0, 0.0, 1023).is_healthy(&thresholds));
        assert!(snapshot(10.0, 0.0, 1024).is_healthy(&thresholds));
    }

    #[test]
    fn test_cpu_is_only_checked_when_configured() {
        let busy = snapshot(10.0, 99.0, u64::MAX);
        assert!(busy.is_healthy(&Thresholds::default()));

        let capped = Thresholds::builder().max_cpu_percent(80.0).build();
        assert!(!busy.is_healthy(&capped));
    }

    #[tokio::test]
    async fn test_purge_removes_only_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("stale.tmp");
        let fresh = dir.path().join("fresh.tmp");
        std::fs::write(&stale, b"0123456789").unwrap();
        std::fs::write(&fresh, b"abc").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(two_hours_ago)
            .unwrap();

        let stats = purge_stale_files(dir.path(), Duration::from_secs(60 * 60))
            .await
            .unwrap();

        assert_eq!(
            stats,
            PurgeStats {
                files_removed: 1,
                bytes_freed: 10
            }
        );
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn test_purge_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let stats = purge_stale_files(&dir.path().join("absent"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stats, PurgeStats::default());
    }

    #[test]
    fn test_sysinfo_sample_is_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = SysinfoMonitor::builder().temp_dir(dir.path()).build();

        let sample = monitor.sample();
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert!(sample.cpu_percent >= 0.0);
    }

    #[test]
    fn test_relative_temp_dir_is_made_absolute() {
        let monitor = SysinfoMonitor::builder()
            .temp_dir("sluice-relative/tmp")
            .build();

        assert!(monitor.temp_dir().is_absolute());
        assert!(monitor.temp_dir().ends_with("sluice-relative/tmp"));
        assert!(monitor
            .temp_dir()
            .starts_with(std::env::current_dir().unwrap()));
    }
}
