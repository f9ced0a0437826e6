//! Update Scheduler
//!
//! A background loop that checks for updates on a jittered interval, backs
//! off after failed checks and publishes what it finds. The loop stops for
//! good on unofficial builds, and otherwise runs until its cancellation
//! token fires.

use crate::boot::{BootDetector, UptimeBootDetector};
use crate::registry::Notifier;
use crate::updater::{BuildInfo, CompiledBuildInfo, UpdateChecker};
use async_trait::async_trait;
use manager_ipc::messages::UpdateState;
use rand::Rng;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MINUTE: Duration = Duration::from_secs(60);

/// Delay before the first check after a boot start
pub const BOOT_DELAY: (Duration, Duration) =
    (Duration::from_secs(2 * 60), Duration::from_secs(5 * 60));

/// Wait after the first failed check since the last success
pub const FIRST_ERROR_BACKOFF: (Duration, Duration) =
    (Duration::from_secs(4 * 60), Duration::from_secs(6 * 60));

/// Wait after each further consecutive failure
pub const REPEATED_ERROR_BACKOFF: (Duration, Duration) =
    (Duration::from_secs(25 * 60), Duration::from_secs(30 * 60));

/// Regular interval between checks (one hour, give or take three minutes)
pub const CHECK_INTERVAL: (Duration, Duration) = (
    Duration::from_secs(60 * 60 - 3 * 60),
    Duration::from_secs(60 * 60 + 3 * 60),
);

/// Uniformly random duration in `[min, max]`, millisecond resolution
pub fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand::rng().random_range(0..=span))
}

/// Current update state, written only by the scheduler
#[derive(Debug, Default)]
pub struct UpdateStateCell {
    state: RwLock<UpdateState>,
}

impl UpdateStateCell {
    pub fn get(&self) -> UpdateState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, state: UpdateState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Suspends the scheduler between checks
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Why the scheduler loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// Unofficial build without the override
    UpdatesDisabled,
    /// The cancellation token fired
    Cancelled,
}

impl fmt::Display for SchedulerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerExit::UpdatesDisabled => f.write_str("updates disabled"),
            SchedulerExit::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Background update checker
pub struct UpdateScheduler {
    checker: Arc<dyn UpdateChecker>,
    notifier: Arc<dyn Notifier>,
    state: Arc<UpdateStateCell>,
    build_info: Arc<dyn BuildInfo>,
    boot_detector: Arc<dyn BootDetector>,
    sleeper: Arc<dyn Sleeper>,
    allow_unofficial: bool,
    cancel: CancellationToken,
}

impl UpdateScheduler {
    /// Create a scheduler with the default build info, boot detector and
    /// timer
    pub fn new(
        checker: Arc<dyn UpdateChecker>,
        notifier: Arc<dyn Notifier>,
        state: Arc<UpdateStateCell>,
    ) -> Self {
        Self {
            checker,
            notifier,
            state,
            build_info: Arc::new(CompiledBuildInfo),
            boot_detector: Arc::new(UptimeBootDetector::new()),
            sleeper: Arc::new(TokioSleeper),
            allow_unofficial: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn build_info(mut self, build_info: Arc<dyn BuildInfo>) -> Self {
        self.build_info = build_info;
        self
    }

    pub fn boot_detector(mut self, boot_detector: Arc<dyn BootDetector>) -> Self {
        self.boot_detector = boot_detector;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Keep checking on unofficial builds
    pub fn allow_unofficial(mut self, allow: bool) -> Self {
        self.allow_unofficial = allow;
        self
    }

    /// Stop the loop when `token` is cancelled
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run the loop until updates are disabled or the token fires
    pub async fn run(self) -> SchedulerExit {
        if !self.build_info.is_official_build() {
            if !self.allow_unofficial {
                info!("Build is not official, so updates are disabled");
                self.state.set(UpdateState::UpdatesDisabledUnofficialBuild);
                self.notifier
                    .notify_update_found(UpdateState::UpdatesDisabledUnofficialBuild);
                return SchedulerExit::UpdatesDisabled;
            }
            info!("Development mode enabled, allowing updates on an unofficial build");
        }

        if self.boot_detector.started_at_boot() && !self.pause(BOOT_DELAY).await {
            return SchedulerExit::Cancelled;
        }

        let mut had_error = false;
        let mut notified = false;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SchedulerExit::Cancelled,
                outcome = self.checker.check_for_update() => outcome,
            };

            let wait = match outcome {
                Err(e) if !notified => {
                    error!("Update checker: {}", e);
                    if had_error {
                        REPEATED_ERROR_BACKOFF
                    } else {
                        had_error = true;
                        FIRST_ERROR_BACKOFF
                    }
                }
                Err(e) => {
                    warn!("Update checker: {}", e);
                    CHECK_INTERVAL
                }
                Ok(Some(update)) if !notified => {
                    info!("An update is available: {}", update.version);
                    self.state.set(UpdateState::UpdateAvailable);
                    self.notifier.notify_update_found(UpdateState::UpdateAvailable);
                    notified = true;
                    had_error = false;
                    CHECK_INTERVAL
                }
                Ok(_) => {
                    had_error = false;
                    CHECK_INTERVAL
                }
            };

            if !self.pause(wait).await {
                return SchedulerExit::Cancelled;
            }
        }
    }

    /// Sleep for a jittered duration. Returns false if cancelled first.
    async fn pause(&self, (min, max): (Duration, Duration)) -> bool {
        let duration = jitter(min, max);
        debug!(
            "Next update check in {}m{}s",
            duration.as_secs() / MINUTE.as_secs(),
            duration.as_secs() % MINUTE.as_secs()
        );
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = self.sleeper.sleep(duration) => true,
        }
    }
}
