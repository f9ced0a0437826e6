//! Client stub for the manager service.
//!
//! Requests on one connection are strictly sequential: the request lock is
//! held from sending a method until its response is decoded. A call that is
//! abandoned in between leaves the request stream unusable, since its
//! response could no longer be told apart from the next one. Notifications
//! arrive on a separate stream and are read by a dedicated task that hands
//! them to the registered observers.

use crate::codec::{encode_frame, read_frame};
use crate::messages::{
    MethodCall, NotificationEvent, NotificationKind, OperationResponse, QuitResponse,
    TunnelConfig, TunnelState, UpdateState,
};
use crate::subscriptions::{Subscribers, Subscription};
use crate::transport::{connect_session, BoxedReader, BoxedWriter, IpcError, IpcResult};
use log::{debug, error, info};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct RequestStream {
    reader: BoxedReader,
    writer: BoxedWriter,
    /// Set while an exchange is in flight; stays set if it never finished
    in_flight: bool,
}

/// Client for communicating with the manager service
pub struct ManagerClient {
    requests: Mutex<RequestStream>,
    subscribers: Arc<Subscribers>,
    notification_reader: JoinHandle<()>,
}

impl ManagerClient {
    /// Connect to the manager service listening on `socket_path`
    pub async fn connect<P: AsRef<Path>>(socket_path: P) -> IpcResult<Self> {
        let (session_id, requests, events) = connect_session(socket_path).await?;
        debug!("Connected to manager service as session {}", session_id);

        let (reader, writer) = requests.into_split();
        Ok(Self::new(Box::new(reader), Box::new(writer), Box::new(events)))
    }

    /// Build a client over already-established streams
    pub fn new(reader: BoxedReader, writer: BoxedWriter, events: BoxedReader) -> Self {
        let subscribers = Arc::new(Subscribers::new());
        let notification_reader =
            tokio::spawn(read_notifications(events, Arc::clone(&subscribers)));

        Self {
            requests: Mutex::new(RequestStream {
                reader,
                writer,
                in_flight: false,
            }),
            subscribers,
            notification_reader,
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: MethodCall) -> IpcResult<T> {
        let frame = encode_frame(&method)?;
        let mut stream = self.requests.lock().await;
        if stream.in_flight {
            error!("Request stream out of step, refusing {}", method.name());
            return Err(IpcError::Closed);
        }
        stream.in_flight = true;

        debug!("Sending {} to manager service", method.name());
        stream.writer.write_all(&frame).await?;
        stream.writer.flush().await?;

        match read_frame(&mut stream.reader).await? {
            Some(response) => {
                stream.in_flight = false;
                Ok(response)
            }
            None => {
                error!("Manager service closed the connection during {}", method.name());
                Err(IpcError::Closed)
            }
        }
    }

    /// Ask the manager service to quit. Returns whether another session had
    /// already done so.
    pub async fn quit(&self, stop_tunnels_on_quit: bool) -> IpcResult<bool> {
        let response: QuitResponse = self
            .call(MethodCall::Quit {
                stop_tunnels_on_quit,
            })
            .await?;

        match response.error {
            Some(msg) => Err(IpcError::Manager(msg)),
            None => {
                info!(
                    "Manager service quit (already quit: {})",
                    response.already_quit
                );
                Ok(response.already_quit)
            }
        }
    }

    /// Current update state of the manager service
    pub async fn update_state(&self) -> IpcResult<UpdateState> {
        self.call(MethodCall::QueryUpdateState).await
    }

    /// Start downloading and running the pending update.
    ///
    /// Progress arrives as [`NotificationEvent::UpdateProgress`]. Sessions
    /// without elevation get an acknowledgement and nothing else.
    pub async fn trigger_update(&self) -> IpcResult<()> {
        self.call(MethodCall::TriggerUpdate).await
    }

    /// Bring the tunnel up
    pub async fn start_tunnel(&self, config: TunnelConfig) -> IpcResult<()> {
        let response: OperationResponse = self.call(MethodCall::StartTunnel(config)).await?;
        operation_result(response)
    }

    /// Take the tunnel down
    pub async fn stop_tunnel(&self) -> IpcResult<()> {
        let response: OperationResponse = self.call(MethodCall::StopTunnel).await?;
        operation_result(response)
    }

    /// Current tunnel state
    pub async fn tunnel_state(&self) -> IpcResult<TunnelState> {
        self.call(MethodCall::QueryTunnelState).await
    }

    /// Register an observer for one kind of notification
    pub fn subscribe<F>(&self, kind: NotificationKind, observer: F) -> Subscription
    where
        F: Fn(NotificationEvent) + Send + 'static,
    {
        self.subscribers.subscribe(kind, observer)
    }

    /// Remove an observer
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.subscribers.unsubscribe(subscription)
    }

    /// Whether the notification stream is still being read
    pub fn is_receiving_notifications(&self) -> bool {
        !self.notification_reader.is_finished()
    }

    /// Close the connection to the manager service
    pub async fn close(&self) -> IpcResult<()> {
        debug!("Closing connection to manager service");
        self.notification_reader.abort();
        let mut stream = self.requests.lock().await;
        stream.writer.shutdown().await?;
        Ok(())
    }
}

impl Drop for ManagerClient {
    fn drop(&mut self) {
        self.notification_reader.abort();
    }
}

fn operation_result(response: OperationResponse) -> IpcResult<()> {
    match response.error {
        Some(msg) => Err(IpcError::Manager(msg)),
        None => Ok(()),
    }
}

async fn read_notifications(mut events: BoxedReader, subscribers: Arc<Subscribers>) {
    loop {
        match read_frame::<_, NotificationEvent>(&mut events).await {
            Ok(Some(event)) => {
                debug!("Received notification {:?}", event.kind());
                subscribers.dispatch(&event);
            }
            Ok(None) => {
                debug!("Notification stream closed");
                break;
            }
            Err(e) => {
                error!("Dropping notification stream: {}", e);
                break;
            }
        }
    }
}
