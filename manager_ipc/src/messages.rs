//! IPC Message Definitions
//!
//! This module defines the method calls sent by the UI, the per-method
//! response shapes returned by the manager service, and the notifications
//! pushed on the events stream.
//!
//! Every type here is encoded positionally by the wire codec: enum variants
//! are identified by their declaration index and fields are written in
//! declaration order. Reordering variants or fields is a protocol change and
//! must bump [`PROTOCOL_VERSION`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Version carried in every connection hello.
pub const PROTOCOL_VERSION: u32 = 1;

/// Method invoked by the UI on the manager service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum MethodCall {
    /// Ask the service to shut down. Response: [`QuitResponse`]
    Quit { stop_tunnels_on_quit: bool },

    /// Read the current update state. Response: [`UpdateState`]
    QueryUpdateState,

    /// Download and run the pending update. Response: `()`
    TriggerUpdate,

    /// Bring the tunnel up. Response: [`OperationResponse`]
    StartTunnel(TunnelConfig),

    /// Take the tunnel down. Response: [`OperationResponse`]
    StopTunnel,

    /// Read the current tunnel state. Response: [`TunnelState`]
    QueryTunnelState,
}

impl MethodCall {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            MethodCall::Quit { .. } => "Quit",
            MethodCall::QueryUpdateState => "QueryUpdateState",
            MethodCall::TriggerUpdate => "TriggerUpdate",
            MethodCall::StartTunnel(_) => "StartTunnel",
            MethodCall::StopTunnel => "StopTunnel",
            MethodCall::QueryTunnelState => "QueryTunnelState",
        }
    }
}

/// Response to [`MethodCall::Quit`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QuitResponse {
    /// True when another session already quit the service
    pub already_quit: bool,

    /// Failure message, if the call was rejected
    pub error: Option<String>,
}

/// Response to methods that only report success or failure
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct OperationResponse {
    /// Failure message, if the operation failed
    pub error: Option<String>,
}

/// Parameters for bringing a tunnel up
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TunnelConfig {
    /// Display name of the tunnel
    pub name: String,

    /// Remote endpoint (host:port)
    pub endpoint: String,

    /// DNS servers to configure while the tunnel is up
    pub dns_servers: Vec<String>,

    /// Optional MTU for the tunnel interface
    pub mtu: Option<u32>,
}

/// Whether an update is known to be available
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
    #[default]
    Unknown,
    UpdateAvailable,
    UpdatesDisabledUnofficialBuild,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UpdateState::Unknown => "unknown",
            UpdateState::UpdateAvailable => "update available",
            UpdateState::UpdatesDisabledUnofficialBuild => "updates disabled (unofficial build)",
        };
        f.write_str(text)
    }
}

/// Lifecycle state of the tunnel, owned by the tunnel lifecycle manager
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    #[default]
    Stopped,
    Starting,
    Registering,
    Registered,
    Running,
    Reconnecting,
    Stopping,
    Invalid,
    Error,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Registering => "registering",
            TunnelState::Registered => "registered",
            TunnelState::Running => "running",
            TunnelState::Reconnecting => "reconnecting",
            TunnelState::Stopping => "stopping",
            TunnelState::Invalid => "invalid",
            TunnelState::Error => "error",
        };
        f.write_str(text)
    }
}

/// One step of an update download/verify/execute operation
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DownloadProgress {
    /// Human readable description of the current step
    pub activity: String,

    /// Bytes downloaded so far
    pub bytes_downloaded: u64,

    /// Total bytes expected, zero when unknown
    pub bytes_total: u64,

    /// Failure message; the operation is over when set
    pub error: Option<String>,

    /// True once the update has been handed off for execution
    pub complete: bool,
}

impl DownloadProgress {
    /// Progress report for an in-flight step
    pub fn activity(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            ..Default::default()
        }
    }

    /// Terminal progress report carrying an error
    pub fn failed(activity: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Whether no further progress will follow this one
    pub fn is_final(&self) -> bool {
        self.complete || self.error.is_some()
    }
}

/// Event pushed by the manager service on the events stream
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    UpdateFound(UpdateState),
    UpdateProgress(DownloadProgress),
    ManagerStopping,
    TunnelStateChanged(TunnelState),
}

impl NotificationEvent {
    /// Tag of this event, used for subscription filtering
    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationEvent::UpdateFound(_) => NotificationKind::UpdateFound,
            NotificationEvent::UpdateProgress(_) => NotificationKind::UpdateProgress,
            NotificationEvent::ManagerStopping => NotificationKind::ManagerStopping,
            NotificationEvent::TunnelStateChanged(_) => NotificationKind::TunnelStateChanged,
        }
    }
}

/// Discriminant of [`NotificationEvent`]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    UpdateFound,
    UpdateProgress,
    ManagerStopping,
    TunnelStateChanged,
}

/// Which half of a session a connection carries
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Request/response stream
    Requests,
    /// One-way notification stream
    Events,
}

/// First frame on every connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub session_id: Uuid,
    pub channel: Channel,
}

impl Hello {
    pub fn new(session_id: Uuid, channel: Channel) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id,
            channel,
        }
    }
}
