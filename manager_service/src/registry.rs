//! Session Registry
//!
//! Tracks the live sessions of the manager service and fans notifications
//! out to their event streams. Membership is guarded by one reader/writer
//! lock. Each session owns a bounded queue drained by a single writer task,
//! so its events are written in the order they were published and a slow
//! session never holds up the others.

use log::{debug, error, warn};
use manager_ipc::codec::encode_frame;
use manager_ipc::messages::{DownloadProgress, NotificationEvent, TunnelState, UpdateState};
use manager_ipc::transport::{BoxedWriter, ElevatedToken};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Time receivers get to act on `ManagerStopping` before the process exits
pub const STOPPING_GRACE: Duration = Duration::from_millis(200);

/// Default write deadline for one notification delivery
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Notifications queued for one session before further ones are dropped
pub const EVENT_QUEUE_DEPTH: usize = 128;

struct Delivery {
    frame: Arc<Vec<u8>>,
    deadline: Duration,
}

/// Server-side state for one connected client
pub struct Session {
    id: Uuid,
    elevated: Option<ElevatedToken>,
    closed: CancellationToken,
    queue: Mutex<Option<mpsc::Sender<Delivery>>>,
}

impl Session {
    /// Create a session and start the task that writes its events stream.
    /// Must be called from within a Tokio runtime.
    pub fn new(id: Uuid, elevated: Option<ElevatedToken>, events: BoxedWriter) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let closed = CancellationToken::new();
        tokio::spawn(write_events(id, events, rx, closed.clone()));

        Self {
            id,
            elevated,
            closed,
            queue: Mutex::new(Some(tx)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Privilege token captured when the session was paired
    pub fn elevated_token(&self) -> Option<ElevatedToken> {
        self.elevated
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated.is_some()
    }

    /// Whether the event handle has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the event handle. Never waits: the writer task drops the
    /// stream as soon as it observes the close, even mid-write.
    pub fn close_events(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Queue one encoded notification frame, to be written within
    /// `deadline` once it reaches the front. Never waits; returns false
    /// when the session is closed or its queue is full.
    pub fn enqueue(&self, frame: Arc<Vec<u8>>, deadline: Duration) -> bool {
        if self.is_closed() {
            return false;
        }

        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = match queue.as_ref() {
            Some(tx) => tx,
            None => return false,
        };
        match tx.try_send(Delivery { frame, deadline }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Events queue of session {} is full, dropping notification",
                    self.id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Write queued frames in order until the session is closed or a write
/// fails. A failed or timed out write may leave a partial frame behind, so
/// the session is closed and the stream dropped.
async fn write_events(
    id: Uuid,
    mut writer: BoxedWriter,
    mut queue: mpsc::Receiver<Delivery>,
    closed: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            delivery = queue.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let write = timeout(delivery.deadline, async {
            writer.write_all(&delivery.frame).await?;
            writer.flush().await
        });
        let result = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            result = write => result,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Dropping events stream of session {}: {}", id, e);
                closed.cancel();
                break;
            }
            Err(_) => {
                debug!(
                    "Dropping events stream of session {}: write timed out",
                    id
                );
                closed.cancel();
                break;
            }
        }
    }
    debug!("Events writer of session {} finished", id);
}

/// Publishes notifications to connected UIs
pub trait Notifier: Send + Sync {
    /// Fan `event` out to every live session, or only to elevated sessions
    /// when `admin_only` is set
    fn notify(&self, event: NotificationEvent, admin_only: bool);

    fn notify_update_found(&self, state: UpdateState) {
        self.notify(NotificationEvent::UpdateFound(state), false);
    }

    fn notify_update_progress(&self, progress: DownloadProgress) {
        self.notify(NotificationEvent::UpdateProgress(progress), true);
    }

    fn notify_tunnel_state_changed(&self, state: TunnelState) {
        self.notify(NotificationEvent::TunnelStateChanged(state), false);
    }
}

#[derive(Default)]
struct Members {
    sessions: HashMap<Uuid, Arc<Session>>,
    /// Set once the service quits; no session is admitted afterwards
    closed: bool,
}

/// Process-wide set of live sessions
pub struct SessionRegistry {
    members: RwLock<Members>,
    delivery_timeout: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_TIMEOUT)
    }
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            members: RwLock::new(Members::default()),
            delivery_timeout,
        }
    }

    /// Add a session. Returns false once the registry has been drained.
    pub fn insert(&self, session: Arc<Session>) -> bool {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        if members.closed {
            return false;
        }
        members.sessions.insert(session.id(), session);
        true
    }

    /// Remove a session and close its event handle. Returns whether the
    /// session was still registered.
    pub fn remove(&self, id: &Uuid) -> bool {
        let removed = self
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .remove(id);
        match removed {
            Some(session) => {
                session.close_events();
                true
            }
            None => false,
        }
    }

    /// Remove every session and refuse new ones. Returns how many were
    /// removed.
    pub fn drain(&self) -> usize {
        let drained: Vec<Arc<Session>> = {
            let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
            members.closed = true;
            members.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            session.close_events();
        }
        drained.len()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode `event` once and queue it on each target session. Returns the
    /// number of sessions targeted; delivery failures are dropped.
    pub fn broadcast(&self, event: &NotificationEvent, admin_only: bool) -> usize {
        if self.is_empty() {
            return 0;
        }

        let frame = match encode_frame(event) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                error!("Failed to encode {:?} notification: {}", event.kind(), e);
                return 0;
            }
        };

        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        let mut targeted = 0;
        for session in members.sessions.values() {
            if admin_only && !session.is_elevated() {
                continue;
            }
            session.enqueue(Arc::clone(&frame), self.delivery_timeout);
            targeted += 1;
        }

        debug!(
            "Broadcast {:?} to {} session(s) (admin only: {})",
            event.kind(),
            targeted,
            admin_only
        );
        targeted
    }

    /// Tell every session the service is going away, then give receivers a
    /// moment to react.
    pub async fn notify_manager_stopping(&self) {
        let targeted = self.broadcast(&NotificationEvent::ManagerStopping, false);
        if targeted == 0 {
            warn!("No sessions to notify of manager shutdown");
        }
        tokio::time::sleep(STOPPING_GRACE).await;
    }
}

impl Notifier for SessionRegistry {
    fn notify(&self, event: NotificationEvent, admin_only: bool) {
        self.broadcast(&event, admin_only);
    }
}
