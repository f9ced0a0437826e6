//! Session behavior through the client stub over in-memory streams

use manager_ipc::codec::{read_frame, write_frame};
use manager_ipc::messages::{
    DownloadProgress, MethodCall, NotificationEvent, NotificationKind, TunnelConfig, TunnelState,
    UpdateState,
};
use manager_ipc::transport::{ElevatedToken, IpcError};
use manager_ipc::ManagerClient;
use manager_service::tunnel::StubTunnel;
use manager_service::update_scheduler::UpdateStateCell;
use manager_service::updater::UpdateInstaller;
use manager_service::{ManagerContext, Session, SessionRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Sends a scripted progress sequence, including one item after the final
/// one that must never be relayed
#[derive(Default)]
struct ScriptedInstaller {
    calls: AtomicUsize,
}

impl UpdateInstaller for ScriptedInstaller {
    fn download_verify_and_execute(
        &self,
        _token: ElevatedToken,
    ) -> mpsc::Receiver<DownloadProgress> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let steps = vec![
                DownloadProgress::activity("Downloading update"),
                DownloadProgress {
                    activity: "Downloading update".to_string(),
                    bytes_downloaded: 512,
                    bytes_total: 1024,
                    ..Default::default()
                },
                DownloadProgress {
                    activity: "Running installer".to_string(),
                    bytes_downloaded: 1024,
                    bytes_total: 1024,
                    complete: true,
                    ..Default::default()
                },
                DownloadProgress::activity("unreachable"),
            ];
            for step in steps {
                if tx.send(step).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}

struct Harness {
    context: Arc<ManagerContext>,
    quit_rx: mpsc::Receiver<()>,
    registry: Arc<SessionRegistry>,
    installer: Arc<ScriptedInstaller>,
}

fn harness() -> Harness {
    let registry = Arc::new(SessionRegistry::new(Duration::from_millis(500)));
    let installer = Arc::new(ScriptedInstaller::default());
    let tunnel = Arc::new(StubTunnel::new(registry.clone()));
    let (context, quit_rx) = ManagerContext::new(
        registry.clone(),
        Arc::new(UpdateStateCell::default()),
        installer.clone(),
        tunnel,
    );
    Harness {
        context,
        quit_rx,
        registry,
        installer,
    }
}

fn token(elevated: bool) -> Option<ElevatedToken> {
    elevated.then_some(ElevatedToken {
        uid: 1000,
        gid: 1000,
    })
}

/// Serve a new session and return the client side of its raw streams
fn raw_session(
    context: &Arc<ManagerContext>,
    elevated: bool,
) -> (Uuid, DuplexStream, DuplexStream, JoinHandle<()>) {
    let (client_requests, server_requests) = duplex(64 * 1024);
    let (client_events, server_events) = duplex(64 * 1024);
    let id = Uuid::new_v4();
    let session = Arc::new(Session::new(id, token(elevated), Box::new(server_events)));
    let (reader, writer) = split(server_requests);
    let handle = context
        .serve_session(session, Box::new(reader), Box::new(writer))
        .unwrap();
    (id, client_requests, client_events, handle)
}

fn connect(context: &Arc<ManagerContext>, elevated: bool) -> (ManagerClient, JoinHandle<()>) {
    let (_, requests, events, handle) = raw_session(context, elevated);
    let (reader, writer) = split(requests);
    let client = ManagerClient::new(Box::new(reader), Box::new(writer), Box::new(events));
    (client, handle)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn concurrent_quit_succeeds_exactly_once() {
    let mut h = harness();
    let clients: Vec<_> = (0..4)
        .map(|_| Arc::new(connect(&h.context, true).0))
        .collect();
    let (_bystander, _) = connect(&h.context, false);
    assert_eq!(h.registry.len(), 5);

    let calls: Vec<_> = clients
        .iter()
        .map(|client| {
            let client = Arc::clone(client);
            tokio::spawn(async move { client.quit(false).await })
        })
        .collect();
    let mut results = Vec::new();
    for call in calls {
        results.push(call.await.unwrap());
    }

    let first_quits = results.iter().filter(|r| matches!(r, Ok(false))).count();
    let already = results.iter().filter(|r| matches!(r, Ok(true))).count();
    assert_eq!(first_quits, 1);
    assert_eq!(already, 3);
    assert!(h.registry.is_empty());
    assert!(h.context.has_quit());
    assert!(h.quit_rx.try_recv().is_ok());
    assert!(h.quit_rx.try_recv().is_err());
}

#[tokio::test]
async fn unprivileged_quit_is_denied() {
    let mut h = harness();
    let (client, _) = connect(&h.context, false);

    match client.quit(true).await {
        Err(IpcError::Manager(message)) => assert_eq!(message, "Access is denied"),
        other => panic!("expected permission error, got {:?}", other),
    }
    assert!(!h.context.has_quit());
    assert_eq!(h.registry.len(), 1);
    assert!(h.quit_rx.try_recv().is_err());

    // The connection stays usable after the failure
    assert_eq!(client.update_state().await.unwrap(), UpdateState::Unknown);
}

#[tokio::test]
async fn unprivileged_tunnel_control_is_denied() {
    let h = harness();
    let (client, _) = connect(&h.context, false);

    let config = TunnelConfig {
        name: "office".to_string(),
        endpoint: "vpn.example.com:51820".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        client.start_tunnel(config).await,
        Err(IpcError::Manager(_))
    ));
    assert!(matches!(client.stop_tunnel().await, Err(IpcError::Manager(_))));
    assert_eq!(client.tunnel_state().await.unwrap(), TunnelState::Stopped);
}

#[tokio::test]
async fn tunnel_transitions_reach_every_session() {
    let h = harness();
    let (admin, _) = connect(&h.context, true);
    let (watcher, _) = connect(&h.context, false);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    watcher.subscribe(NotificationKind::TunnelStateChanged, move |event| {
        if let NotificationEvent::TunnelStateChanged(state) = event {
            sink.lock().unwrap().push(state);
        }
    });

    admin
        .start_tunnel(TunnelConfig {
            name: "office".to_string(),
            endpoint: "vpn.example.com:51820".to_string(),
            dns_servers: vec!["10.0.0.53".to_string()],
            mtu: Some(1420),
        })
        .await
        .unwrap();
    assert_eq!(watcher.tunnel_state().await.unwrap(), TunnelState::Running);

    assert!(eventually(|| seen.lock().unwrap().contains(&TunnelState::Running)).await);

    // Invalid configurations are reported both ways
    admin.stop_tunnel().await.unwrap();
    let result = admin
        .start_tunnel(TunnelConfig {
            name: "broken".to_string(),
            endpoint: "nowhere".to_string(),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(IpcError::Manager(_))));
    assert_eq!(admin.tunnel_state().await.unwrap(), TunnelState::Invalid);
    assert!(eventually(|| seen.lock().unwrap().contains(&TunnelState::Invalid)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tunnel_transitions_arrive_in_order() {
    let h = harness();
    let (admin, _) = connect(&h.context, true);
    let (watcher, _) = connect(&h.context, false);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    watcher.subscribe(NotificationKind::TunnelStateChanged, move |event| {
        if let NotificationEvent::TunnelStateChanged(state) = event {
            sink.lock().unwrap().push(state);
        }
    });

    let config = TunnelConfig {
        name: "office".to_string(),
        endpoint: "vpn.example.com:51820".to_string(),
        ..Default::default()
    };
    for _ in 0..5 {
        admin.start_tunnel(config.clone()).await.unwrap();
        admin.stop_tunnel().await.unwrap();
    }

    assert!(eventually(|| seen.lock().unwrap().len() == 30).await);
    let cycle = [
        TunnelState::Starting,
        TunnelState::Registering,
        TunnelState::Registered,
        TunnelState::Running,
        TunnelState::Stopping,
        TunnelState::Stopped,
    ];
    let expected: Vec<TunnelState> = cycle.iter().copied().cycle().take(30).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test]
async fn update_progress_is_relayed_to_elevated_sessions_until_final() {
    let h = harness();
    let (admin, _) = connect(&h.context, true);
    let (user, _) = connect(&h.context, false);

    let admin_progress = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&admin_progress);
    admin.subscribe(NotificationKind::UpdateProgress, move |event| {
        if let NotificationEvent::UpdateProgress(progress) = event {
            sink.lock().unwrap().push(progress);
        }
    });
    let user_progress = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&user_progress);
    user.subscribe(NotificationKind::UpdateProgress, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // Unprivileged callers are acknowledged and nothing happens
    user.trigger_update().await.unwrap();
    assert_eq!(h.installer.calls.load(Ordering::SeqCst), 0);

    admin.trigger_update().await.unwrap();
    assert_eq!(h.installer.calls.load(Ordering::SeqCst), 1);

    assert!(eventually(|| admin_progress.lock().unwrap().len() == 3).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let progress = admin_progress.lock().unwrap().clone();
    assert_eq!(progress.len(), 3);
    assert!(progress.last().unwrap().complete);
    assert!(progress.iter().all(|p| p.activity != "unreachable"));
    assert_eq!(user_progress.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn corrupt_frame_closes_session_once() {
    let h = harness();
    let (id, mut requests, _events, handle) = raw_session(&h.context, true);
    assert!(h.registry.contains(&id));

    // A well-formed request first
    write_frame(&mut requests, &MethodCall::QueryTunnelState)
        .await
        .unwrap();
    let state: Option<TunnelState> = read_frame(&mut requests).await.unwrap();
    assert_eq!(state, Some(TunnelState::Stopped));

    // Then a frame whose tag names no method
    let mut corrupt = 4u32.to_le_bytes().to_vec();
    corrupt.extend_from_slice(&200u32.to_le_bytes());
    requests.write_all(&corrupt).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(!h.registry.contains(&id));
    assert!(!h.registry.remove(&id));

    // The server side of the request stream is gone
    let next: Result<Option<TunnelState>, _> = read_frame(&mut requests).await;
    assert!(matches!(next, Ok(None)));
}

#[tokio::test]
async fn truncated_frame_closes_session() {
    let h = harness();
    let (id, mut requests, _events, handle) = raw_session(&h.context, false);

    // Length says eight bytes, only two arrive before the stream ends
    requests.write_all(&8u32.to_le_bytes()).await.unwrap();
    requests.write_all(&[1, 0]).await.unwrap();
    requests.shutdown().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(h.registry.is_empty());
    assert!(!h.registry.remove(&id));
}

#[tokio::test]
async fn broadcast_skips_dead_session() {
    let h = harness();
    let mut listeners = Vec::new();
    for _ in 0..3 {
        let (client, _) = connect(&h.context, false);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        client.subscribe(NotificationKind::UpdateFound, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        listeners.push((client, count));
    }

    // A session whose client vanished without closing its request stream
    let (_, _requests, events, _handle) = raw_session(&h.context, false);
    drop(events);
    assert_eq!(h.registry.len(), 4);

    let targeted = h
        .registry
        .broadcast(&NotificationEvent::UpdateFound(UpdateState::UpdateAvailable), false);
    assert_eq!(targeted, 4);

    for (_, count) in &listeners {
        assert!(eventually(|| count.load(Ordering::SeqCst) == 1).await);
    }
}
