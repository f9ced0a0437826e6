//! IPC Transport Layer
//!
//! This module defines the error types, the Unix Domain Socket listener used
//! by the manager service, and the hello/pairing step that turns two client
//! connections into one session (a request stream plus an events stream).

use crate::codec::{read_frame, write_frame};
use crate::messages::{Channel, Hello, PROTOCOL_VERSION};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Boxed read half of a stream
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default time allowed for a hello and for the second half of a session
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for IPC operations
#[derive(Error, Debug)]
pub enum IpcError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// The peer closed the stream
    #[error("Connection closed by peer")]
    Closed,

    /// The manager service rejected or failed the call
    #[error("Manager error: {0}")]
    Manager(String),
}

/// Proof that a session's peer may perform privileged operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElevatedToken {
    pub uid: u32,
    pub gid: u32,
}

/// Decides which peers receive an [`ElevatedToken`]
#[derive(Debug, Clone)]
pub struct ElevationPolicy {
    /// UIDs treated as administrators
    admin_uids: HashSet<u32>,
    /// GIDs whose members are treated as administrators
    admin_gids: HashSet<u32>,
    /// Whether root (UID 0) is an administrator
    allow_root: bool,
}

impl Default for ElevationPolicy {
    fn default() -> Self {
        Self {
            admin_uids: HashSet::new(),
            admin_gids: HashSet::new(),
            allow_root: true,
        }
    }
}

impl ElevationPolicy {
    /// Create a policy that only elevates root
    pub fn new() -> Self {
        Self::default()
    }

    /// Elevate a specific UID
    pub fn allow_uid(mut self, uid: u32) -> Self {
        self.admin_uids.insert(uid);
        self
    }

    /// Elevate members of a specific primary GID
    pub fn allow_gid(mut self, gid: u32) -> Self {
        self.admin_gids.insert(gid);
        self
    }

    /// Set whether root is elevated
    pub fn allow_root(mut self, allow: bool) -> Self {
        self.allow_root = allow;
        self
    }

    /// Token for a peer, or `None` when the peer is unprivileged
    pub fn token_for(&self, uid: u32, gid: u32) -> Option<ElevatedToken> {
        let elevated = (self.allow_root && uid == 0)
            || self.admin_uids.contains(&uid)
            || self.admin_gids.contains(&gid);
        elevated.then_some(ElevatedToken { uid, gid })
    }
}

/// Both halves of a paired session, ready to be served
#[derive(Debug)]
pub struct SessionStreams {
    pub session_id: Uuid,
    pub peer_uid: u32,
    pub peer_gid: u32,
    /// Fixed for the lifetime of the session
    pub elevated: Option<ElevatedToken>,
    pub requests: UnixStream,
    pub events: UnixStream,
}

/// Manager service Unix Domain Socket listener
pub struct ManagerListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ManagerListener {
    /// Bind the listener, replacing any stale socket file
    pub async fn bind<P: AsRef<Path>>(path: P) -> IpcResult<Self> {
        let socket_path = path.as_ref().to_path_buf();

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    IpcError::Connection(format!("Failed to create socket directory: {}", e))
                })?;
            }
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                IpcError::Connection(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| IpcError::Connection(format!("Failed to bind to socket: {}", e)))?;

        // Unprivileged UIs must be able to connect; privilege comes from
        // peer credentials, not from socket permissions.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o666);
            std::fs::set_permissions(&socket_path, permissions).map_err(|e| {
                IpcError::Connection(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept the next raw connection
    pub async fn accept(&self) -> IpcResult<UnixStream> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| IpcError::Connection(format!("Failed to accept connection: {}", e)))?;
        Ok(stream)
    }

    /// Path the listener is bound to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ManagerListener {
    fn drop(&mut self) {
        // Clean up the socket file when the listener is dropped
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

struct PendingHalf {
    channel: Channel,
    stream: UnixStream,
    uid: u32,
    gid: u32,
}

/// Matches request and events connections that carry the same session id
pub struct SessionPairer {
    pending: Mutex<HashMap<Uuid, PendingHalf>>,
    policy: ElevationPolicy,
    pairing_timeout: Duration,
    paired_tx: mpsc::Sender<SessionStreams>,
}

impl SessionPairer {
    /// Create a pairer; completed sessions arrive on the returned receiver
    pub fn new(
        policy: ElevationPolicy,
        pairing_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<SessionStreams>) {
        let (paired_tx, paired_rx) = mpsc::channel(16);
        let pairer = Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            policy,
            pairing_timeout,
            paired_tx,
        });
        (pairer, paired_rx)
    }

    /// Number of connections still waiting for their other half
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Read the hello from a fresh connection and pair it.
    ///
    /// Errors mean the connection was rejected and dropped.
    pub async fn admit(self: Arc<Self>, mut stream: UnixStream) -> IpcResult<()> {
        let cred = stream.peer_cred().map_err(|e| {
            IpcError::Authentication(format!("Failed to get peer credentials: {}", e))
        })?;
        let (uid, gid) = (cred.uid(), cred.gid());

        let hello: Hello = match timeout(self.pairing_timeout, read_frame(&mut stream)).await {
            Ok(Ok(Some(hello))) => hello,
            Ok(Ok(None)) => {
                return Err(IpcError::Connection(
                    "Connection closed before hello".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(IpcError::Timeout("No hello received".to_string())),
        };

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(IpcError::Protocol(format!(
                "Unsupported protocol version {} (expected {})",
                hello.protocol_version, PROTOCOL_VERSION
            )));
        }

        debug!(
            "Hello from UID={} for session {} ({:?})",
            uid, hello.session_id, hello.channel
        );

        let other = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| IpcError::Connection("Pairing state poisoned".to_string()))?;
            match pending.remove(&hello.session_id) {
                Some(other) => other,
                None => {
                    pending.insert(
                        hello.session_id,
                        PendingHalf {
                            channel: hello.channel,
                            stream,
                            uid,
                            gid,
                        },
                    );
                    drop(pending);
                    self.expire_later(hello.session_id);
                    return Ok(());
                }
            }
        };

        if other.uid != uid {
            return Err(IpcError::Authentication(format!(
                "Session {} halves come from different users (UID={} and UID={})",
                hello.session_id, other.uid, uid
            )));
        }

        let (requests, events, req_uid, req_gid) = match (other.channel, hello.channel) {
            (Channel::Requests, Channel::Events) => (other.stream, stream, other.uid, other.gid),
            (Channel::Events, Channel::Requests) => (stream, other.stream, uid, gid),
            (channel, _) => {
                return Err(IpcError::Protocol(format!(
                    "Session {} sent two {:?} connections",
                    hello.session_id, channel
                )))
            }
        };

        let streams = SessionStreams {
            session_id: hello.session_id,
            peer_uid: req_uid,
            peer_gid: req_gid,
            elevated: self.policy.token_for(req_uid, req_gid),
            requests,
            events,
        };

        self.paired_tx
            .send(streams)
            .await
            .map_err(|_| IpcError::Connection("Session receiver dropped".to_string()))
    }

    fn expire_later(self: &Arc<Self>, session_id: Uuid) {
        let pairer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(pairer.pairing_timeout).await;
            let expired = pairer
                .pending
                .lock()
                .map(|mut p| p.remove(&session_id).is_some())
                .unwrap_or(false);
            if expired {
                warn!("Session {} was never completed; dropping it", session_id);
            }
        });
    }
}

/// Open both halves of a session to the manager service.
///
/// Returns the session id, the request stream and the events stream.
pub async fn connect_session<P: AsRef<Path>>(
    path: P,
) -> IpcResult<(Uuid, UnixStream, UnixStream)> {
    let session_id = Uuid::new_v4();

    let mut requests = UnixStream::connect(path.as_ref())
        .await
        .map_err(|e| IpcError::Connection(format!("Failed to connect to socket: {}", e)))?;
    write_frame(&mut requests, &Hello::new(session_id, Channel::Requests)).await?;

    let mut events = UnixStream::connect(path.as_ref())
        .await
        .map_err(|e| IpcError::Connection(format!("Failed to connect to socket: {}", e)))?;
    write_frame(&mut events, &Hello::new(session_id, Channel::Events)).await?;

    Ok((session_id, requests, events))
}
