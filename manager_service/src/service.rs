//! Service runner
//!
//! Binds the manager socket, pairs incoming connections into sessions,
//! starts the update scheduler and serves sessions until a shutdown signal
//! or a successful `Quit`.

use crate::boot::{BootDetector, UptimeBootDetector};
use crate::manager::{ManagerContext, ManagerError};
use crate::registry::SessionRegistry;
use crate::tunnel::{StubTunnel, TunnelLifecycle};
use crate::update_scheduler::{UpdateScheduler, UpdateStateCell};
use crate::updater::{
    BuildInfo, CompiledBuildInfo, ManifestUpdateChecker, UnsupportedInstaller, UpdateChecker,
    UpdateInstaller,
};
use manager_ipc::transport::{ElevationPolicy, ManagerListener, SessionPairer};
use shared_utils::config::ManagerConfig;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why the service stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A session called `Quit`
    Quit,
    /// The shutdown future completed (usually a signal)
    Signal,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Quit => f.write_str("quit requested"),
            ShutdownReason::Signal => f.write_str("signal received"),
        }
    }
}

/// Build the elevation policy described by the configuration
pub fn elevation_policy(config: &ManagerConfig) -> ElevationPolicy {
    let mut policy = ElevationPolicy::new().allow_root(config.allow_root);
    for uid in &config.admin_uids {
        debug!("Elevating UID {} (from configuration)", uid);
        policy = policy.allow_uid(*uid);
    }
    for gid in &config.admin_gids {
        debug!("Elevating GID {} (from configuration)", gid);
        policy = policy.allow_gid(*gid);
    }
    policy
}

/// The privileged manager service
pub struct ManagerService {
    config: ManagerConfig,
    checker: Arc<dyn UpdateChecker>,
    installer: Arc<dyn UpdateInstaller>,
    build_info: Arc<dyn BuildInfo>,
    boot_detector: Arc<dyn BootDetector>,
}

impl ManagerService {
    /// Create a service with the default collaborators
    pub fn new(config: ManagerConfig) -> Self {
        let checker = Arc::new(ManifestUpdateChecker::new(config.update_manifest.clone()));
        Self {
            config,
            checker,
            installer: Arc::new(UnsupportedInstaller),
            build_info: Arc::new(CompiledBuildInfo),
            boot_detector: Arc::new(UptimeBootDetector::new()),
        }
    }

    pub fn with_update_checker(mut self, checker: Arc<dyn UpdateChecker>) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn UpdateInstaller>) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_build_info(mut self, build_info: Arc<dyn BuildInfo>) -> Self {
        self.build_info = build_info;
        self
    }

    pub fn with_boot_detector(mut self, boot_detector: Arc<dyn BootDetector>) -> Self {
        self.boot_detector = boot_detector;
        self
    }

    /// Serve until `shutdown` completes or a session quits the service
    pub async fn run<F>(self, shutdown: F) -> Result<ShutdownReason, ManagerError>
    where
        F: Future<Output = ()>,
    {
        let listener = ManagerListener::bind(&self.config.socket_path).await?;
        info!(
            "Manager service listening on {}",
            listener.socket_path().display()
        );

        let (pairer, mut paired_rx) = SessionPairer::new(
            elevation_policy(&self.config),
            self.config.pairing_timeout(),
        );
        let registry = Arc::new(SessionRegistry::new(self.config.broadcast_timeout()));
        let update_state = Arc::new(UpdateStateCell::default());
        let tunnel: Arc<dyn TunnelLifecycle> = Arc::new(StubTunnel::new(registry.clone()));
        let (context, mut quit_rx) = ManagerContext::new(
            Arc::clone(&registry),
            Arc::clone(&update_state),
            self.installer,
            tunnel,
        );

        let cancel = CancellationToken::new();
        let scheduler = UpdateScheduler::new(self.checker, registry.clone(), update_state)
            .build_info(self.build_info)
            .boot_detector(self.boot_detector)
            .allow_unofficial(self.config.allow_unofficial_updates)
            .cancel_token(cancel.clone());
        let scheduler_handle = tokio::spawn(scheduler.run());

        tokio::pin!(shutdown);
        let reason = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let pairer = Arc::clone(&pairer);
                        tokio::spawn(async move {
                            if let Err(e) = pairer.admit(stream).await {
                                warn!("Rejected connection: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("{}", e),
                },
                Some(streams) = paired_rx.recv() => {
                    info!(
                        "Session {} connected (UID={}, GID={}, elevated: {})",
                        streams.session_id,
                        streams.peer_uid,
                        streams.peer_gid,
                        streams.elevated.is_some()
                    );
                    context.listen(streams);
                }
                Some(()) = quit_rx.recv() => break ShutdownReason::Quit,
                _ = &mut shutdown => break ShutdownReason::Signal,
            }
        };

        info!("Manager service stopping ({})", reason);
        cancel.cancel();
        registry.notify_manager_stopping().await;

        match scheduler_handle.await {
            Ok(exit) => debug!("Update scheduler finished ({})", exit),
            Err(e) => error!("Update scheduler task failed: {}", e),
        }

        drop(listener);
        Ok(reason)
    }
}
