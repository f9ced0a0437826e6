//! Tunnel lifecycle
//!
//! The manager service delegates bringing the tunnel up and down to a
//! [`TunnelLifecycle`]. [`StubTunnel`] walks through the state machine and
//! publishes every transition without touching the network.

use crate::registry::Notifier;
use async_trait::async_trait;
use manager_ipc::messages::{TunnelConfig, TunnelState};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// Smallest and largest MTU accepted for the tunnel interface
const MTU_RANGE: std::ops::RangeInclusive<u32> = 576..=9000;

/// Errors reported by a tunnel lifecycle
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("Tunnel is busy ({0})")]
    Busy(TunnelState),

    #[error("Tunnel error: {0}")]
    Other(String),
}

/// Owner of the authoritative tunnel state
#[async_trait]
pub trait TunnelLifecycle: Send + Sync {
    /// Bring the tunnel up with `config`
    async fn start(&self, config: TunnelConfig) -> Result<(), TunnelError>;

    /// Take the tunnel down. Stopping a stopped tunnel succeeds.
    async fn stop(&self) -> Result<(), TunnelError>;

    /// Ask for the tunnel to be torn down without waiting for it
    fn request_teardown(&self);

    /// Current tunnel state
    fn state(&self) -> TunnelState;
}

/// Check a configuration before any state change
pub fn validate_config(config: &TunnelConfig) -> Result<(), TunnelError> {
    if config.name.trim().is_empty() {
        return Err(TunnelError::InvalidConfig(
            "tunnel name cannot be empty".to_string(),
        ));
    }

    let port = config
        .endpoint
        .rsplit_once(':')
        .filter(|(host, _)| !host.is_empty())
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .filter(|port| *port != 0);
    if port.is_none() {
        return Err(TunnelError::InvalidConfig(format!(
            "endpoint must be host:port, got {:?}",
            config.endpoint
        )));
    }

    for server in &config.dns_servers {
        if server.parse::<IpAddr>().is_err() {
            return Err(TunnelError::InvalidConfig(format!(
                "DNS server {:?} is not an IP address",
                server
            )));
        }
    }

    if let Some(mtu) = config.mtu {
        if !MTU_RANGE.contains(&mtu) {
            return Err(TunnelError::InvalidConfig(format!(
                "MTU {} outside {}..={}",
                mtu,
                MTU_RANGE.start(),
                MTU_RANGE.end()
            )));
        }
    }

    Ok(())
}

/// Tunnel lifecycle that only tracks and publishes state
pub struct StubTunnel {
    state: Mutex<TunnelState>,
    config: Mutex<Option<TunnelConfig>>,
    notifier: Arc<dyn Notifier>,
}

impl StubTunnel {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            state: Mutex::new(TunnelState::Stopped),
            config: Mutex::new(None),
            notifier,
        }
    }

    /// Configuration of the running tunnel, if any
    pub fn active_config(&self) -> Option<TunnelConfig> {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` and publish it. Callers hold the state lock for the
    /// whole operation, so published transitions never interleave.
    fn advance(&self, state: &mut TunnelState, next: TunnelState) {
        debug!("Tunnel state {} -> {}", state, next);
        *state = next;
        self.notifier.notify_tunnel_state_changed(next);
    }
}

#[async_trait]
impl TunnelLifecycle for StubTunnel {
    async fn start(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        let mut state = self.lock_state();
        if !matches!(
            *state,
            TunnelState::Stopped | TunnelState::Invalid | TunnelState::Error
        ) {
            return Err(TunnelError::Busy(*state));
        }

        if let Err(e) = validate_config(&config) {
            self.advance(&mut state, TunnelState::Invalid);
            return Err(e);
        }

        info!("Starting tunnel {} to {}", config.name, config.endpoint);
        self.advance(&mut state, TunnelState::Starting);
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = Some(config);
        self.advance(&mut state, TunnelState::Registering);
        self.advance(&mut state, TunnelState::Registered);
        self.advance(&mut state, TunnelState::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        let mut state = self.lock_state();
        match *state {
            TunnelState::Stopped => return Ok(()),
            TunnelState::Stopping => return Err(TunnelError::Busy(TunnelState::Stopping)),
            _ => {}
        }

        info!("Stopping tunnel");
        self.advance(&mut state, TunnelState::Stopping);
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.advance(&mut state, TunnelState::Stopped);
        Ok(())
    }

    fn request_teardown(&self) {
        info!(
            "Tunnel teardown requested while {}; nothing to tear down",
            self.state()
        );
    }

    fn state(&self) -> TunnelState {
        *self.lock_state()
    }
}
