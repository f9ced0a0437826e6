//! Tunnel Manager IPC Protocol Library
//!
//! This crate defines the protocol spoken between the unprivileged tunnel UI
//! and the privileged manager service: the message types, the length-prefixed
//! wire codec, the Unix Domain Socket transport with session pairing, and the
//! client stub used by the UI side.

pub mod client;
pub mod codec;
pub mod messages;
pub mod subscriptions;
pub mod transport;

/// Re-export common types for convenience
pub use client::ManagerClient;
pub use messages::{
    DownloadProgress, MethodCall, NotificationEvent, NotificationKind, TunnelConfig, TunnelState,
    UpdateState,
};
pub use subscriptions::Subscription;
pub use transport::{ElevatedToken, ElevationPolicy, IpcError, IpcResult};
