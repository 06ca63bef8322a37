//! Host resource sampling for advisory health checks.
//!
//! CPU load, memory and disk pressure are reported next to a verdict but
//! never decide it.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;

use serde::Serialize;
use sysinfo::System;

use reforge_core::config::HealthConfig;
use reforge_core::ProbeFailureKind;

/// Point-in-time host resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// 5-minute load average.
    pub load_avg_5m: f64,
    /// Used memory as a percentage of total.
    pub memory_percent: f64,
    /// Used space on the deployment volume as a percentage.
    pub disk_percent: f64,
}

/// Limits above which an advisory is raised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub cpu_load: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_load: 10.0,
            memory_percent: 90.0,
            disk_percent: 90.0,
        }
    }
}

impl From<&HealthConfig> for ResourceThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            cpu_load: config.cpu_load_threshold,
            memory_percent: config.memory_percent_threshold,
            disk_percent: config.disk_percent_threshold,
        }
    }
}

impl ResourceThresholds {
    /// Advisory failures for every threshold strictly exceeded.
    pub fn breaches(&self, usage: &ResourceUsage) -> BTreeSet<ProbeFailureKind> {
        let mut out = BTreeSet::new();
        if usage.load_avg_5m > self.cpu_load {
            out.insert(ProbeFailureKind::HighCpu);
        }
        if usage.memory_percent > self.memory_percent {
            out.insert(ProbeFailureKind::HighMemory);
        }
        if usage.disk_percent > self.disk_percent {
            out.insert(ProbeFailureKind::HighDisk);
        }
        out
    }
}

/// Source of resource usage samples.
pub trait ResourceSampler: Send + Sync {
    /// Sample host usage; `volume` selects the filesystem for the disk figure.
    fn sample(&self, volume: &Path) -> io::Result<ResourceUsage>;
}

/// Samples the local host via sysinfo and statvfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSampler;

impl ResourceSampler for SystemSampler {
    fn sample(&self, volume: &Path) -> io::Result<ResourceUsage> {
        let load = System::load_average();

        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            sys.used_memory() as f64 / total as f64 * 100.0
        };

        Ok(ResourceUsage {
            load_avg_5m: load.five,
            memory_percent,
            disk_percent: disk_used_percent(volume)?,
        })
    }
}

/// Used space on the filesystem holding `path`, computed the way `df` does.
#[cfg(unix)]
fn disk_used_percent(path: &Path) -> io::Result<f64> {
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: c_path is NUL-terminated and stat points to writable memory.
    let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs returned 0, so the struct is initialized.
    let stat = unsafe { stat.assume_init() };

    let frsize = stat.f_frsize as u64;
    let blocks = stat.f_blocks as u64;
    let free = stat.f_bfree as u64;
    let avail = stat.f_bavail as u64;

    let used = blocks.saturating_sub(free) * frsize;
    let usable = used + avail * frsize;
    if usable == 0 {
        return Ok(0.0);
    }
    Ok(used as f64 / usable as f64 * 100.0)
}

#[cfg(not(unix))]
fn disk_used_percent(_path: &Path) -> io::Result<f64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "disk usage sampling requires statvfs",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(load: f64, mem: f64, disk: f64) -> ResourceUsage {
        ResourceUsage {
            load_avg_5m: load,
            memory_percent: mem,
            disk_percent: disk,
        }
    }

    #[test]
    fn no_breaches_under_thresholds() {
        let t = ResourceThresholds::default();
        assert!(t.breaches(&usage(1.0, 50.0, 40.0)).is_empty());
    }

    #[test]
    fn thresholds_are_exclusive() {
        let t = ResourceThresholds::default();
        assert!(t.breaches(&usage(10.0, 90.0, 90.0)).is_empty());
    }

    #[test]
    fn each_breach_is_reported() {
        let t = ResourceThresholds::default();
        let breaches = t.breaches(&usage(12.5, 95.0, 91.0));
        assert_eq!(
            breaches.into_iter().collect::<Vec<_>>(),
            vec![
                ProbeFailureKind::HighCpu,
                ProbeFailureKind::HighMemory,
                ProbeFailureKind::HighDisk
            ]
        );
    }

    #[test]
    fn thresholds_follow_config() {
        let config = HealthConfig {
            cpu_load_threshold: 2.0,
            ..HealthConfig::default()
        };
        let t = ResourceThresholds::from(&config);
        assert!(t.breaches(&usage(3.0, 10.0, 10.0)).contains(&ProbeFailureKind::HighCpu));
    }

    #[cfg(unix)]
    #[test]
    fn system_sampler_reads_current_host() {
        let dir = tempfile::tempdir().unwrap();
        let sample = SystemSampler.sample(dir.path()).unwrap();
        assert!(sample.load_avg_5m >= 0.0);
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert!((0.0..=100.0).contains(&sample.disk_percent));
    }

    #[cfg(unix)]
    #[test]
    fn disk_sampling_fails_for_missing_path() {
        assert!(disk_used_percent(Path::new("/nonexistent/reforge/volume")).is_err());
    }
}
