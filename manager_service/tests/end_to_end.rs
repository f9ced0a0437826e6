//! The full service over a real Unix Domain Socket

use async_trait::async_trait;
use manager_ipc::messages::{NotificationEvent, NotificationKind, TunnelConfig, TunnelState};
use manager_ipc::{ManagerClient, UpdateState};
use manager_service::boot::BootDetector;
use manager_service::updater::{BuildInfo, UpdateChecker, UpdateError, UpdateInfo};
use manager_service::{ManagerService, ShutdownReason};
use shared_utils::config::ManagerConfig;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::oneshot;

struct Official;

impl BuildInfo for Official {
    fn is_official_build(&self) -> bool {
        true
    }
}

struct NotAtBoot;

impl BootDetector for NotAtBoot {
    fn started_at_boot(&self) -> bool {
        false
    }
}

struct AlwaysNewer;

#[async_trait]
impl UpdateChecker for AlwaysNewer {
    async fn check_for_update(&self) -> Result<Option<UpdateInfo>, UpdateError> {
        Ok(Some(UpdateInfo {
            version: "99.0.0".to_string(),
            url: "https://downloads.example.com/tunnel-99.0.0".to_string(),
        }))
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("service never bound {}", path.display());
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

fn config_for(dir: &Path, admin: bool) -> ManagerConfig {
    let my_uid = std::fs::metadata(dir).unwrap().uid();
    ManagerConfig {
        socket_path: dir.join("manager.sock"),
        admin_uids: if admin { vec![my_uid] } else { Vec::new() },
        allow_root: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn client_controls_service_and_quits_it() {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path(), true);
    let socket_path = config.socket_path.clone();

    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let service = ManagerService::new(config)
        .with_build_info(Arc::new(Official))
        .with_boot_detector(Arc::new(NotAtBoot))
        .with_update_checker(Arc::new(AlwaysNewer));
    let server = tokio::spawn(service.run(async move {
        let _ = shutdown_rx.await;
    }));

    wait_for_socket(&socket_path).await;
    let client = ManagerClient::connect(&socket_path).await.unwrap();

    let stopping = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&stopping);
    client.subscribe(NotificationKind::ManagerStopping, move |_| {
        *counter.lock().unwrap() += 1;
    });
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    client.subscribe(NotificationKind::TunnelStateChanged, move |event| {
        if let NotificationEvent::TunnelStateChanged(state) = event {
            sink.lock().unwrap().push(state);
        }
    });

    // The scheduler checks right away and finds the newer release
    let mut found = false;
    for _ in 0..100 {
        if client.update_state().await.unwrap() == UpdateState::UpdateAvailable {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(found);

    client
        .start_tunnel(TunnelConfig {
            name: "office".to_string(),
            endpoint: "vpn.example.com:51820".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(client.tunnel_state().await.unwrap(), TunnelState::Running);
    assert!(eventually(|| states.lock().unwrap().contains(&TunnelState::Running)).await);

    assert!(!client.quit(true).await.unwrap());

    let reason = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, ShutdownReason::Quit);
    assert!(!socket_path.exists());

    // The quitting session was removed before the stopping broadcast
    assert_eq!(*stopping.lock().unwrap(), 0);
}

#[tokio::test]
async fn shutdown_signal_notifies_sessions() {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path(), false);
    let socket_path = config.socket_path.clone();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let service = ManagerService::new(config)
        .with_build_info(Arc::new(Official))
        .with_boot_detector(Arc::new(NotAtBoot));
    let server = tokio::spawn(service.run(async move {
        let _ = shutdown_rx.await;
    }));

    wait_for_socket(&socket_path).await;
    let client = ManagerClient::connect(&socket_path).await.unwrap();
    let stopping = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&stopping);
    client.subscribe(NotificationKind::ManagerStopping, move |_| {
        *counter.lock().unwrap() += 1;
    });

    // Unprivileged sessions can query but not quit
    assert_eq!(client.tunnel_state().await.unwrap(), TunnelState::Stopped);
    assert!(client.quit(false).await.is_err());

    shutdown_tx.send(()).unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, ShutdownReason::Signal);
    assert!(eventually(|| *stopping.lock().unwrap() == 1).await);
    assert!(!socket_path.exists());
}
