//! Server recovery tests: one restart per failed call, reinstall on a
//! signature mismatch, and no retry loops.

mod common;

use std::sync::atomic::Ordering;

use serde_json::json;

use common::fixture;

use droidrive_core::error::DeviceError;
use droidrive_core::jsonrpc::RpcError;
use droidrive_core::supervisor::ServerError;

const SIGNATURE_MISMATCH: &str = "INSTRUMENTATION_STATUS: Error=Permission Denial: starting instrumentation ComponentInfo{com.github.uiautomator.test/androidx.test.runner.AndroidJUnitRunner} from pid=1 does not have a signature matching the target com.github.uiautomator";

// ---------------------------------------------------------------------------
// One-shot recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dead_server_is_restarted_once() {
    let f = fixture();
    f.transport.script(
        "deviceInfo",
        Err(RpcError::UiAutomationNotConnected("UiAutomation not connected".into())),
    );

    let info = f.device.info().await.unwrap();
    assert_eq!(info["displayWidth"], json!(1080));
    assert_eq!(f.adb.spawn_count(), 1);
    assert_eq!(f.transport.calls_to("deviceInfo").len(), 2);
    assert!(f
        .adb
        .commands()
        .contains(&"am force-stop com.github.uiautomator".to_string()));
    assert_eq!(f.device.supervisor().generation(), 1);
}

#[tokio::test]
async fn test_retry_failure_is_returned() {
    let f = fixture();
    for _ in 0..2 {
        f.transport
            .script("deviceInfo", Err(RpcError::Http("connection reset".into())));
    }

    let err = f.device.info().await.unwrap_err();
    assert!(matches!(err, DeviceError::Rpc(RpcError::Http(_))), "got {err:?}");
    assert!(err.is_connection());
    assert_eq!(f.adb.spawn_count(), 1);
    assert_eq!(f.transport.calls_to("deviceInfo").len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_share_one_restart() {
    let f = fixture();
    f.alive.store(false, Ordering::SeqCst);

    let (a, b, c) = (f.device.clone(), f.device.clone(), f.device.clone());
    let (ra, rb, rc) = tokio::join!(
        tokio::spawn(async move { a.jsonrpc("deviceInfo", json!([])).await }),
        tokio::spawn(async move { b.jsonrpc("deviceInfo", json!([])).await }),
        tokio::spawn(async move { c.jsonrpc("deviceInfo", json!([])).await }),
    );
    for result in [ra, rb, rc] {
        let info = result.unwrap().unwrap();
        assert_eq!(info["displayWidth"], json!(1080));
    }
    assert_eq!(f.adb.spawn_count(), 1);
    assert_eq!(f.device.supervisor().generation(), 1);
}

#[tokio::test]
async fn test_stale_object_retries_without_restart() {
    let f = fixture();
    f.transport
        .script("objInfo", Err(RpcError::StaleObject("StaleObjectException".into())));
    f.transport.set_default(
        "objInfo",
        json!({"bounds": {"left": 0, "top": 0, "right": 10, "bottom": 10}}),
    );

    let sel = droidrive_core::selector::Selector::new().text("n1");
    f.device.select(sel).info().await.unwrap();
    assert_eq!(f.adb.spawn_count(), 0);
    assert_eq!(f.transport.calls_to("objInfo").len(), 2);
}

#[tokio::test]
async fn test_call_timeout_is_not_restarted() {
    let f = fixture();
    f.transport.script(
        "deviceInfo",
        Err(RpcError::Timeout(std::time::Duration::from_secs(1))),
    );
    let err = f.device.info().await.unwrap_err();
    assert!(matches!(err, DeviceError::Rpc(RpcError::Timeout(_))));
    assert_eq!(f.adb.spawn_count(), 0);
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_start_is_noop_when_server_answers() {
    let f = fixture();
    f.device.start_server().await.unwrap();
    assert_eq!(f.adb.spawn_count(), 0);
    assert!(f.device.server_alive().await);
}

#[tokio::test]
async fn test_start_launches_instrumentation() {
    let f = fixture();
    f.alive.store(false, Ordering::SeqCst);

    f.device.start_server().await.unwrap();
    assert_eq!(f.adb.spawn_count(), 1);
    let status = f.device.server_status().await;
    assert!(status.running);
    assert_eq!(status.generation, 1);
    assert!(status.started_at.is_some());
    assert!(f
        .adb
        .commands()
        .iter()
        .any(|c| c.starts_with("am instrument") && c.ends_with("androidx.test.runner.AndroidJUnitRunner")));
}

#[tokio::test]
async fn test_outdated_apks_are_installed_before_launch() {
    let f = fixture();
    f.alive.store(false, Ordering::SeqCst);
    f.installer.outdated.store(true, Ordering::SeqCst);

    f.device.start_server().await.unwrap();
    assert_eq!(f.installer.installs.load(Ordering::SeqCst), 1);
    assert_eq!(f.installer.uninstalls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_signature_mismatch_reinstalls_and_relaunches() {
    let f = fixture();
    f.alive.store(false, Ordering::SeqCst);
    f.adb.script_launch(SIGNATURE_MISMATCH);

    f.device.start_server().await.unwrap();
    assert_eq!(f.installer.uninstalls.load(Ordering::SeqCst), 1);
    assert_eq!(f.installer.installs.load(Ordering::SeqCst), 1);
    assert_eq!(f.adb.spawn_count(), 2);
    assert!(f.device.server_alive().await);
}

#[tokio::test]
async fn test_persistent_signature_mismatch_fails() {
    let f = fixture();
    f.alive.store(false, Ordering::SeqCst);
    f.adb.script_launch(SIGNATURE_MISMATCH);
    f.adb.script_launch(SIGNATURE_MISMATCH);

    let err = f.device.start_server().await.unwrap_err();
    assert!(
        matches!(err, DeviceError::Server(ServerError::ApkSignature { .. })),
        "got {err:?}"
    );
    assert_eq!(f.adb.spawn_count(), 2);
}

#[tokio::test]
async fn test_instrumentation_failure_is_a_launch_error() {
    let f = fixture();
    f.alive.store(false, Ordering::SeqCst);
    f.adb
        .script_launch("INSTRUMENTATION_FAILED: com.github.uiautomator.test/androidx.test.runner.AndroidJUnitRunner");

    let err = f.device.start_server().await.unwrap_err();
    match err {
        DeviceError::Server(ServerError::Launch { reason, output }) => {
            assert!(reason.starts_with("INSTRUMENTATION_FAILED"));
            assert!(output.contains("AndroidJUnitRunner"));
        }
        other => panic!("expected launch error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stop_forces_app_down() {
    let f = fixture();
    f.device.stop_server().await;
    assert!(!f.device.server_alive().await);
    assert!(f
        .adb
        .commands()
        .contains(&"am force-stop com.github.uiautomator".to_string()));
}
