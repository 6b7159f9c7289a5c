//! Disk limiters decide whether the disk block cache may admit more bytes.
//!
//! The backpressure limiter tracks used resources `U` against free
//! resources `F` reported by the filesystem and keeps
//!
//!   U <= min(k(U+F), L)
//!
//! for a fraction `0 < k <= 1` and an absolute limit `L`. Admission is
//! delayed proportionally once `U / min(k(U+F), L)` passes a minimum
//! threshold `m`, reaching the maximum delay at `M`.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep};

use crate::error::{BlockError, Result};

/// Outcome of a reservation. Both counts are what would remain after the
/// reservation; a negative count means it was refused and nothing is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub available_bytes: i64,
    pub available_files: i64,
}

impl Admission {
    pub fn admitted(&self) -> bool {
        self.available_bytes >= 0 && self.available_files >= 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub kind: &'static str,
    pub used_bytes: i64,
    pub limit_bytes: f64,
    pub used_files: i64,
    pub limit_files: f64,
    pub delay_scale: f64,
}

#[async_trait]
pub trait DiskLimiter: Send + Sync {
    /// Account for usage that already exists when the cache opens.
    async fn on_enable(&self, bytes: i64, files: i64);

    /// Sleep for the current backpressure delay, which never exceeds the
    /// configured maximum. Returns the delay applied.
    async fn backpressure(&self) -> Result<Duration>;

    async fn reserve(&self, bytes: i64, files: i64) -> Result<Admission>;

    async fn commit_or_rollback(&self, bytes: i64, files: i64, commit: bool);

    async fn release(&self, bytes: i64, files: i64);

    async fn status(&self) -> LimiterStatus;
}

#[derive(Debug, Default)]
struct StaticUsage {
    used_bytes: i64,
    used_files: i64,
    reserved_bytes: i64,
    reserved_files: i64,
}

/// Fixed byte and file ceilings.
pub struct StaticDiskLimiter {
    byte_limit: i64,
    file_limit: i64,
    usage: Mutex<StaticUsage>,
}

impl StaticDiskLimiter {
    pub fn new(byte_limit: i64, file_limit: i64) -> Self {
        Self {
            byte_limit,
            file_limit,
            usage: Mutex::new(StaticUsage::default()),
        }
    }
}

#[async_trait]
impl DiskLimiter for StaticDiskLimiter {
    async fn on_enable(&self, bytes: i64, files: i64) {
        let mut u = self.usage.lock().await;
        u.used_bytes += bytes;
        u.used_files += files;
    }

    async fn backpressure(&self) -> Result<Duration> {
        Ok(Duration::ZERO)
    }

    async fn reserve(&self, bytes: i64, files: i64) -> Result<Admission> {
        let mut u = self.usage.lock().await;
        let admission = Admission {
            available_bytes: self.byte_limit - u.used_bytes - u.reserved_bytes - bytes,
            available_files: self.file_limit - u.used_files - u.reserved_files - files,
        };
        if admission.admitted() {
            u.reserved_bytes += bytes;
            u.reserved_files += files;
        }
        Ok(admission)
    }

    async fn commit_or_rollback(&self, bytes: i64, files: i64, commit: bool) {
        let mut u = self.usage.lock().await;
        u.reserved_bytes -= bytes;
        u.reserved_files -= files;
        if commit {
            u.used_bytes += bytes;
            u.used_files += files;
        }
    }

    async fn release(&self, bytes: i64, files: i64) {
        let mut u = self.usage.lock().await;
        u.used_bytes -= bytes;
        u.used_files -= files;
    }

    async fn status(&self) -> LimiterStatus {
        let u = self.usage.lock().await;
        LimiterStatus {
            kind: "static",
            used_bytes: u.used_bytes,
            limit_bytes: self.byte_limit as f64,
            used_files: u.used_files,
            limit_files: self.file_limit as f64,
            delay_scale: 0.0,
        }
    }
}

/// Tracks one resource (bytes or files) for the backpressure limiter.
#[derive(Debug, Clone)]
pub struct BackpressureTracker {
    min_threshold: f64,
    max_threshold: f64,
    limit_frac: f64,
    limit: i64,
    used: i64,
    reserved: i64,
    free: i64,
}

impl BackpressureTracker {
    pub fn new(min_threshold: f64, max_threshold: f64, limit_frac: f64, limit: i64, free: i64) -> Result<Self> {
        if min_threshold < 0.0 {
            return Err(BlockError::InvalidConfig(format!("min_threshold={min_threshold} < 0.0")));
        }
        if max_threshold < min_threshold {
            return Err(BlockError::InvalidConfig(format!(
                "max_threshold={max_threshold} < min_threshold={min_threshold}"
            )));
        }
        if limit_frac <= 0.0 || limit_frac > 1.0 {
            return Err(BlockError::InvalidConfig(format!(
                "limit_frac={limit_frac} must be in (0, 1]"
            )));
        }
        Ok(Self {
            min_threshold,
            max_threshold,
            limit_frac,
            limit,
            used: 0,
            reserved: 0,
            free,
        })
    }

    /// min(k(U+F), L)
    pub fn curr_limit(&self) -> f64 {
        let dynamic = self.limit_frac * (self.used as f64 + self.free as f64);
        // Keep clear of the i64 edge where f64 rounding overflows.
        dynamic.min(self.limit as f64).min((i64::MAX - 512) as f64)
    }

    pub fn used_frac(&self) -> f64 {
        let limit = self.curr_limit();
        if limit <= 0.0 {
            return if self.used > 0 { f64::INFINITY } else { 0.0 };
        }
        self.used as f64 / limit
    }

    /// In [0, 1]; multiplied by the maximum delay.
    pub fn delay_scale(&self) -> f64 {
        let frac = self.used_frac();
        let (m, big_m) = (self.min_threshold, self.max_threshold);
        if big_m - m <= f64::EPSILON {
            return if frac > m { 1.0 } else { 0.0 };
        }
        ((frac - m) / (big_m - m)).clamp(0.0, 1.0)
    }

    pub fn available(&self) -> i64 {
        self.curr_limit() as i64 - self.used - self.reserved
    }

    pub fn used(&self) -> i64 {
        self.used
    }

    pub fn on_enable(&mut self, used: i64) {
        self.used += used;
    }

    pub fn update_free(&mut self, free: i64) {
        self.free = free;
    }

    /// Reserves `n` if it fits. Returns what would remain; negative means
    /// nothing was reserved.
    pub fn try_reserve(&mut self, n: i64) -> i64 {
        let remaining = self.available() - n;
        if remaining >= 0 {
            self.reserved += n;
        }
        remaining
    }

    pub fn commit(&mut self, n: i64) {
        self.reserved -= n;
        self.used += n;
    }

    pub fn rollback(&mut self, n: i64) {
        self.reserved -= n;
    }

    pub fn release(&mut self, n: i64) {
        self.used -= n;
    }
}

/// Returns (free bytes, free files) of the filesystem holding the cache.
pub type FreeSpaceFn = Arc<dyn Fn() -> Result<(i64, i64)> + Send + Sync>;

pub fn statvfs_free_space(path: PathBuf) -> FreeSpaceFn {
    Arc::new(move || {
        let st = nix::sys::statvfs::statvfs(&path)?;
        let free_bytes = st.blocks_available() as i64 * st.fragment_size() as i64;
        Ok((free_bytes, st.files_available() as i64))
    })
}

#[derive(Debug, Clone)]
pub struct BackpressureParams {
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub byte_frac: f64,
    pub file_frac: f64,
    pub byte_limit: i64,
    pub file_limit: i64,
    pub max_delay: Duration,
}

impl Default for BackpressureParams {
    fn default() -> Self {
        Self {
            // Delay only once usage runs past the dynamic limit, e.g. when
            // other processes eat the free space, and max out at 120%.
            min_threshold: 1.0,
            max_threshold: 1.2,
            byte_frac: 0.10,
            file_frac: 0.10,
            byte_limit: 20 * 1024 * 1024 * 1024,
            file_limit: 600_000,
            max_delay: Duration::from_secs(10),
        }
    }
}

struct Trackers {
    bytes: BackpressureTracker,
    files: BackpressureTracker,
}

impl Trackers {
    fn refresh(&mut self, free_fn: &FreeSpaceFn) -> Result<()> {
        let (free_bytes, free_files) = free_fn()?;
        self.bytes.update_free(free_bytes);
        self.files.update_free(free_files);
        Ok(())
    }
}

/// Limits computed from live free space, with proportional delay.
pub struct BackpressureDiskLimiter {
    trackers: Mutex<Trackers>,
    max_delay: Duration,
    free_fn: FreeSpaceFn,
}

impl BackpressureDiskLimiter {
    pub fn new(params: BackpressureParams, free_fn: FreeSpaceFn) -> Result<Self> {
        let (free_bytes, free_files) = free_fn()?;
        let bytes = BackpressureTracker::new(
            params.min_threshold,
            params.max_threshold,
            params.byte_frac,
            params.byte_limit,
            free_bytes,
        )?;
        let files = BackpressureTracker::new(
            params.min_threshold,
            params.max_threshold,
            params.file_frac,
            params.file_limit,
            free_files,
        )?;
        Ok(Self {
            trackers: Mutex::new(Trackers { bytes, files }),
            max_delay: params.max_delay,
            free_fn,
        })
    }

    pub async fn current_delay(&self) -> Result<Duration> {
        let mut t = self.trackers.lock().await;
        t.refresh(&self.free_fn)?;
        let scale = t.bytes.delay_scale().max(t.files.delay_scale());
        Ok(self.max_delay.mul_f64(scale))
    }
}

#[async_trait]
impl DiskLimiter for BackpressureDiskLimiter {
    async fn on_enable(&self, bytes: i64, files: i64) {
        let mut t = self.trackers.lock().await;
        t.bytes.on_enable(bytes);
        t.files.on_enable(files);
    }

    async fn backpressure(&self) -> Result<Duration> {
        // Computed under the lock, slept outside it.
        let delay = self.current_delay().await?;
        if !delay.is_zero() {
            tracing::debug!("disk cache backpressure: delaying put by {:?}", delay);
            sleep(delay).await;
        }
        Ok(delay)
    }

    async fn reserve(&self, bytes: i64, files: i64) -> Result<Admission> {
        let mut t = self.trackers.lock().await;
        t.refresh(&self.free_fn)?;
        let available_bytes = t.bytes.try_reserve(bytes);
        if available_bytes < 0 {
            return Ok(Admission {
                available_bytes,
                available_files: t.files.available() - files,
            });
        }
        let available_files = t.files.try_reserve(files);
        if available_files < 0 {
            t.bytes.rollback(bytes);
        }
        Ok(Admission {
            available_bytes,
            available_files,
        })
    }

    async fn commit_or_rollback(&self, bytes: i64, files: i64, commit: bool) {
        let mut t = self.trackers.lock().await;
        if commit {
            t.bytes.commit(bytes);
            t.files.commit(files);
        } else {
            t.bytes.rollback(bytes);
            t.files.rollback(files);
        }
    }

    async fn release(&self, bytes: i64, files: i64) {
        let mut t = self.trackers.lock().await;
        t.bytes.release(bytes);
        t.files.release(files);
    }

    async fn status(&self) -> LimiterStatus {
        let t = self.trackers.lock().await;
        LimiterStatus {
            kind: "backpressure",
            used_bytes: t.bytes.used(),
            limit_bytes: t.bytes.curr_limit(),
            used_files: t.files.used(),
            limit_files: t.files.curr_limit(),
            delay_scale: t.bytes.delay_scale().max(t.files.delay_scale()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn test_tracker_limit_and_delay_scale() {
        // k = 0.5, L = 1000, F = 400: limit = min(0.5 * 400, 1000) = 200.
        let mut bt = BackpressureTracker::new(0.5, 0.9, 0.5, 1000, 400).unwrap();
        assert_eq!(bt.curr_limit(), 200.0);
        assert_eq!(bt.delay_scale(), 0.0);

        bt.on_enable(100);
        bt.update_free(300);
        // U = 100, limit = 0.5 * 400 = 200, used frac 0.5: at m.
        assert_eq!(bt.delay_scale(), 0.0);

        bt.on_enable(40);
        bt.update_free(260);
        // U = 140, limit = 200, frac 0.7: halfway between m and M.
        assert!((bt.delay_scale() - 0.5).abs() < 1e-9);

        bt.on_enable(60);
        bt.update_free(200);
        // frac 200 / 200 = 1.0 > M.
        assert_eq!(bt.delay_scale(), 1.0);
    }

    #[test]
    fn test_tracker_reserve_commit_release() {
        let mut bt = BackpressureTracker::new(0.5, 0.9, 1.0, 100, 1_000).unwrap();
        assert_eq!(bt.try_reserve(60), 40);
        assert_eq!(bt.try_reserve(50), -10);
        bt.commit(60);
        assert_eq!(bt.used(), 60);
        assert_eq!(bt.available(), 40);
        bt.release(60);
        assert_eq!(bt.available(), 100);
    }

    #[test]
    fn test_tracker_validation() {
        assert!(BackpressureTracker::new(-0.1, 0.5, 0.5, 10, 10).is_err());
        assert!(BackpressureTracker::new(0.6, 0.5, 0.5, 10, 10).is_err());
        assert!(BackpressureTracker::new(0.1, 0.5, 0.0, 10, 10).is_err());
        assert!(BackpressureTracker::new(0.1, 0.5, 1.5, 10, 10).is_err());
    }

    #[tokio::test]
    async fn test_static_limiter() {
        let limiter = StaticDiskLimiter::new(10, 2);
        let a = limiter.reserve(6, 1).await.unwrap();
        assert!(a.admitted());
        limiter.commit_or_rollback(6, 1, true).await;

        let refused = limiter.reserve(6, 1).await.unwrap();
        assert!(!refused.admitted());
        assert_eq!(refused.available_bytes, -2);

        limiter.release(6, 1).await;
        assert!(limiter.reserve(6, 1).await.unwrap().admitted());
        limiter.commit_or_rollback(6, 1, false).await;
        assert_eq!(limiter.status().await.used_bytes, 0);
    }

    #[tokio::test]
    async fn test_backpressure_limiter_follows_free_space() {
        let free = Arc::new(AtomicI64::new(1_000));
        let f = free.clone();
        let free_fn: FreeSpaceFn = Arc::new(move || Ok((f.load(Ordering::SeqCst), 1_000)));
        let params = BackpressureParams {
            min_threshold: 1.0,
            max_threshold: 1.2,
            byte_frac: 0.1,
            file_frac: 1.0,
            byte_limit: 1_000_000,
            file_limit: 1_000,
            max_delay: Duration::from_millis(100),
        };
        let limiter = BackpressureDiskLimiter::new(params, free_fn).unwrap();

        // Limit is 0.1 * 1000 = 100 bytes.
        assert!(limiter.reserve(80, 1).await.unwrap().admitted());
        limiter.commit_or_rollback(80, 1, true).await;
        assert!(!limiter.reserve(30, 1).await.unwrap().admitted());
        assert_eq!(limiter.current_delay().await.unwrap(), Duration::ZERO);

        // Free space collapses: limit 0.1 * (80 + 520) = 60 < used 80,
        // used frac 1.33 > M so the full delay applies.
        free.store(520, Ordering::SeqCst);
        assert_eq!(limiter.current_delay().await.unwrap(), Duration::from_millis(100));

        // Halfway: limit 0.1 * (80 + 647) = 72.7, frac 1.1.
        free.store(647, Ordering::SeqCst);
        let delay = limiter.current_delay().await.unwrap();
        assert!(delay > Duration::from_millis(40) && delay < Duration::from_millis(60), "{delay:?}");
    }
}
