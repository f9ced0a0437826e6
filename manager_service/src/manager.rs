//! Manager Service
//!
//! Serves one session's request stream: each decoded [`MethodCall`] is
//! dispatched to an operation and its typed response is written back. The
//! loop ends, and the session is deregistered, on end of stream or on the
//! first decode or encode failure.

use crate::registry::{Notifier, Session, SessionRegistry};
use crate::tunnel::{TunnelError, TunnelLifecycle};
use crate::update_scheduler::UpdateStateCell;
use crate::updater::UpdateInstaller;
use log::{debug, error, info, warn};
use manager_ipc::codec::{read_frame, write_frame};
use manager_ipc::messages::{
    MethodCall, OperationResponse, QuitResponse, TunnelConfig, TunnelState, UpdateState,
};
use manager_ipc::transport::{BoxedReader, BoxedWriter, IpcError, SessionStreams};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Errors from manager operations
#[derive(Error, Debug)]
pub enum ManagerError {
    /// The session is not elevated
    #[error("Access is denied")]
    PermissionDenied,

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}

/// State shared by every session of the manager service
pub struct ManagerContext {
    registry: Arc<SessionRegistry>,
    update_state: Arc<UpdateStateCell>,
    installer: Arc<dyn UpdateInstaller>,
    tunnel: Arc<dyn TunnelLifecycle>,
    have_quit: AtomicBool,
    quit_tx: mpsc::Sender<()>,
}

impl ManagerContext {
    /// Create the context. The receiver yields once, when a session quits
    /// the service.
    pub fn new(
        registry: Arc<SessionRegistry>,
        update_state: Arc<UpdateStateCell>,
        installer: Arc<dyn UpdateInstaller>,
        tunnel: Arc<dyn TunnelLifecycle>,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (quit_tx, quit_rx) = mpsc::channel(1);
        let context = Arc::new(Self {
            registry,
            update_state,
            installer,
            tunnel,
            have_quit: AtomicBool::new(false),
            quit_tx,
        });
        (context, quit_rx)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Whether a session has quit the service
    pub fn has_quit(&self) -> bool {
        self.have_quit.load(Ordering::Acquire)
    }

    /// Quit the service. Returns whether another session already had.
    ///
    /// The first caller empties the registry before signalling shutdown, so
    /// no later broadcast can reach a client that is going away.
    pub fn quit(
        &self,
        session: &Session,
        stop_tunnels_on_quit: bool,
    ) -> Result<bool, ManagerError> {
        if !session.is_elevated() {
            return Err(ManagerError::PermissionDenied);
        }
        if self
            .have_quit
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(true);
        }

        session.close_events();
        let removed = self.registry.drain();
        info!(
            "Session {} quit the manager service ({} session(s) removed)",
            session.id(),
            removed
        );

        if stop_tunnels_on_quit {
            self.tunnel.request_teardown();
        }

        if self.quit_tx.try_send(()).is_err() {
            warn!("Quit signal already pending");
        }
        Ok(false)
    }

    pub fn update_state(&self) -> UpdateState {
        self.update_state.get()
    }

    /// Start the pending update and relay its progress to elevated sessions.
    /// Does nothing for sessions without elevation.
    pub fn trigger_update(&self, session: &Session) {
        let token = match session.elevated_token() {
            Some(token) => token,
            None => {
                debug!(
                    "Ignoring update request from unprivileged session {}",
                    session.id()
                );
                return;
            }
        };

        info!("Session {} requested an update", session.id());
        let mut progress = self.installer.download_verify_and_execute(token);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            while let Some(item) = progress.recv().await {
                let last = item.is_final();
                registry.notify_update_progress(item);
                if last {
                    break;
                }
            }
        });
    }

    pub async fn start_tunnel(
        &self,
        session: &Session,
        config: TunnelConfig,
    ) -> Result<(), ManagerError> {
        if !session.is_elevated() {
            return Err(ManagerError::PermissionDenied);
        }
        self.tunnel.start(config).await?;
        Ok(())
    }

    pub async fn stop_tunnel(&self, session: &Session) -> Result<(), ManagerError> {
        if !session.is_elevated() {
            return Err(ManagerError::PermissionDenied);
        }
        self.tunnel.stop().await?;
        Ok(())
    }

    pub fn tunnel_state(&self) -> TunnelState {
        self.tunnel.state()
    }

    /// Register a paired session and serve it on its own task
    pub fn listen(self: &Arc<Self>, streams: SessionStreams) -> Option<JoinHandle<()>> {
        let (reader, writer) = streams.requests.into_split();
        let session = Arc::new(Session::new(
            streams.session_id,
            streams.elevated,
            Box::new(streams.events),
        ));
        self.serve_session(session, Box::new(reader), Box::new(writer))
    }

    /// Register `session` and serve its request stream on its own task.
    /// Returns `None` when the service has already quit.
    pub fn serve_session(
        self: &Arc<Self>,
        session: Arc<Session>,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Option<JoinHandle<()>> {
        if !self.registry.insert(Arc::clone(&session)) {
            debug!(
                "Refusing session {}: manager service is quitting",
                session.id()
            );
            return None;
        }

        let context = Arc::clone(self);
        Some(tokio::spawn(async move {
            debug!(
                "Serving session {} (elevated: {})",
                session.id(),
                session.is_elevated()
            );
            if let Err(e) = context.serve_conn(&session, reader, writer).await {
                error!("Closing session {}: {}", session.id(), e);
            }
            context.registry.remove(&session.id());
            debug!("Session {} closed", session.id());
        }))
    }

    /// Read, dispatch and respond until the stream ends or fails
    async fn serve_conn(
        &self,
        session: &Session,
        mut reader: BoxedReader,
        mut writer: BoxedWriter,
    ) -> Result<(), ManagerError> {
        loop {
            let method: MethodCall = match read_frame(&mut reader).await? {
                Some(method) => method,
                None => return Ok(()),
            };
            debug!("Session {} called {}", session.id(), method.name());
            self.dispatch(session, method, &mut writer).await?;
        }
    }

    async fn dispatch(
        &self,
        session: &Session,
        method: MethodCall,
        writer: &mut BoxedWriter,
    ) -> Result<(), ManagerError> {
        match method {
            MethodCall::Quit {
                stop_tunnels_on_quit,
            } => {
                let response = match self.quit(session, stop_tunnels_on_quit) {
                    Ok(already_quit) => QuitResponse {
                        already_quit,
                        error: None,
                    },
                    Err(e) => QuitResponse {
                        already_quit: false,
                        error: Some(e.to_string()),
                    },
                };
                write_frame(writer, &response).await?;
            }
            MethodCall::QueryUpdateState => {
                write_frame(writer, &self.update_state()).await?;
            }
            MethodCall::TriggerUpdate => {
                self.trigger_update(session);
                write_frame(writer, &()).await?;
            }
            MethodCall::StartTunnel(config) => {
                let response = operation_response(self.start_tunnel(session, config).await);
                write_frame(writer, &response).await?;
            }
            MethodCall::StopTunnel => {
                let response = operation_response(self.stop_tunnel(session).await);
                write_frame(writer, &response).await?;
            }
            MethodCall::QueryTunnelState => {
                write_frame(writer, &self.tunnel_state()).await?;
            }
        }
        Ok(())
    }
}

fn operation_response(result: Result<(), ManagerError>) -> OperationResponse {
    OperationResponse {
        error: result.err().map(|e| e.to_string()),
    }
}
