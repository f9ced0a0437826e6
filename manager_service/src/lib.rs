//! Tunnel Manager Service
//!
//! The privileged half of the tunnel client. It serves paired IPC sessions
//! from unprivileged UIs, tracks them in a registry for notification
//! fan-out, and runs the background update scheduler.

pub mod boot;
pub mod manager;
pub mod registry;
pub mod service;
pub mod tunnel;
pub mod update_scheduler;
pub mod updater;

pub use manager::{ManagerContext, ManagerError};
pub use registry::{Notifier, Session, SessionRegistry};
pub use service::{ManagerService, ShutdownReason};
