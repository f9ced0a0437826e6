//! Boot detection
//!
//! The update scheduler delays its first check when the service was started
//! as part of system boot.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// Uptime below which the service counts as started at boot
pub const BOOT_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Reports whether the service was started automatically at boot
pub trait BootDetector: Send + Sync {
    fn started_at_boot(&self) -> bool;
}

/// Compares system uptime from `/proc/uptime` against [`BOOT_WINDOW`].
///
/// The answer is computed on first use and then remembered, so asking later
/// in the process lifetime gives the same result.
#[derive(Debug)]
pub struct UptimeBootDetector {
    uptime_path: PathBuf,
    window: Duration,
    answer: OnceLock<bool>,
}

impl Default for UptimeBootDetector {
    fn default() -> Self {
        Self::with_source("/proc/uptime", BOOT_WINDOW)
    }
}

impl UptimeBootDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read uptime from another file, for tests and other platforms
    pub fn with_source(uptime_path: impl Into<PathBuf>, window: Duration) -> Self {
        Self {
            uptime_path: uptime_path.into(),
            window,
            answer: OnceLock::new(),
        }
    }

    fn read_uptime(&self) -> Option<Duration> {
        let content = std::fs::read_to_string(&self.uptime_path).ok()?;
        let seconds: f64 = content.split_whitespace().next()?.parse().ok()?;
        Duration::try_from_secs_f64(seconds).ok()
    }
}

impl BootDetector for UptimeBootDetector {
    fn started_at_boot(&self) -> bool {
        *self.answer.get_or_init(|| match self.read_uptime() {
            Some(uptime) => {
                debug!("System uptime is {:?}", uptime);
                uptime < self.window
            }
            None => {
                debug!(
                    "Could not read uptime from {}; assuming manual start",
                    self.uptime_path.display()
                );
                false
            }
        })
    }
}
