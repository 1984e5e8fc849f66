//! Watcher rule matching, re-entrancy and background loop tests.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{fast_settings, fixture, fixture_with, Fixture, HIERARCHY, HIERARCHY_WITH_DIALOG};

use droidrive_core::config::Settings;
use droidrive_core::error::{DeviceError, Result};
use droidrive_core::watcher::WatcherContext;
use droidrive_core::xpath::PageSource;

fn counting(
    counter: &Arc<AtomicUsize>,
) -> impl Fn(WatcherContext) -> std::future::Ready<Result<()>> + Send + Sync {
    let counter = counter.clone();
    move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_first_registered_rule_wins() {
    let f = fixture();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let w = f.device.watcher();
    w.named("first").when("Allow").call(counting(&first)).unwrap();
    w.named("second").when("Deny").call(counting(&second)).unwrap();

    let fired = w.run(Some(PageSource::new(HIERARCHY_WITH_DIALOG))).await.unwrap();
    assert!(fired);
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);

    let history = w.triggered();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].name, "first");
    assert_eq!(history[0].xpaths, vec!["Allow".to_string()]);
}

#[tokio::test]
async fn test_chain_needs_every_condition() {
    let f = fixture();
    let hits = Arc::new(AtomicUsize::new(0));
    let w = f.device.watcher();
    w.when("Allow").when("n1").call(counting(&hits)).unwrap();

    assert!(!w.run(Some(PageSource::new(HIERARCHY_WITH_DIALOG))).await.unwrap());
    assert!(!w.run(Some(PageSource::new(HIERARCHY))).await.unwrap());
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    w.when("Allow").when("Deny").call(counting(&hits)).unwrap();
    assert!(w.run(Some(PageSource::new(HIERARCHY_WITH_DIALOG))).await.unwrap());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_run_without_source_dumps_hierarchy() {
    let f = fixture();
    let w = f.device.watcher();
    w.when("n2").click().unwrap();
    assert!(w.run(None).await.unwrap());
    assert_eq!(f.transport.calls_to("dumpWindowHierarchy").len(), 1);
    assert_eq!(f.transport.calls_to("click"), vec![json!([540, 150])]);
}

#[tokio::test]
async fn test_press_rule() {
    let f = fixture();
    let w = f.device.watcher();
    w.when("Deny").press("back").unwrap();
    assert!(w.run(Some(PageSource::new(HIERARCHY_WITH_DIALOG))).await.unwrap());
    assert_eq!(f.transport.calls_to("pressKey"), vec![json!(["back"])]);
}

#[tokio::test]
async fn test_callback_cannot_reenter_scan() {
    let f = fixture();
    let w = f.device.watcher();
    let inner_results = Arc::new(Mutex::new(Vec::new()));
    let results = inner_results.clone();
    w.when("Allow")
        .call(move |ctx: WatcherContext| {
            let results = results.clone();
            async move {
                let watcher = ctx.device.watcher();
                assert!(watcher.triggering());
                let nested = watcher.run(Some(ctx.source.clone())).await?;
                results.lock().unwrap().push(nested);
                Ok::<(), DeviceError>(())
            }
        })
        .unwrap();

    assert!(w.run(Some(PageSource::new(HIERARCHY_WITH_DIALOG))).await.unwrap());
    assert_eq!(*inner_results.lock().unwrap(), vec![false]);
    assert!(!w.triggering());
}

#[tokio::test]
async fn test_failing_callback_still_counts_as_fired() {
    let f = fixture();
    let w = f.device.watcher();
    w.when("Allow")
        .call(|ctx: WatcherContext| async move {
            ctx.device.xpath("n3").get(Some(Duration::ZERO)).await?;
            Ok::<(), DeviceError>(())
        })
        .unwrap();
    assert!(w.run(Some(PageSource::new(HIERARCHY_WITH_DIALOG))).await.unwrap());
    assert_eq!(w.triggered().len(), 1);
}

// ---------------------------------------------------------------------------
// Rule management
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_invalid_rules_are_rejected() {
    let f = fixture();
    let w = f.device.watcher();
    assert!(w.named("empty").click().is_err());
    assert!(w.when("//*[@text=").click().is_err());
    assert!(w.names().is_empty());
}

#[tokio::test]
async fn test_remove_and_reset() {
    let f = fixture();
    let w = f.device.watcher();
    w.named("a").when("Allow").click().unwrap();
    w.named("b").when("Deny").click().unwrap();
    w.when("n1").click().unwrap();
    assert_eq!(w.names(), vec!["a", "b", "n1"]);

    w.remove(Some("a"));
    assert_eq!(w.names(), vec!["b", "n1"]);

    assert!(w.run(Some(PageSource::new(HIERARCHY_WITH_DIALOG))).await.unwrap());
    w.reset();
    assert!(w.names().is_empty());
    assert!(w.triggered().is_empty());
    assert!(!w.run(Some(PageSource::new(HIERARCHY_WITH_DIALOG))).await.unwrap());
}

#[tokio::test]
async fn test_rules_are_shared_between_handles() {
    let f = fixture();
    f.device.watcher().named("a").when("Allow").click().unwrap();
    assert_eq!(f.device.clone().watcher().names(), vec!["a"]);
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_loop_start_stop_restart() {
    let f = fixture();
    f.transport.set_hierarchy(HIERARCHY_WITH_DIALOG);
    let hits = Arc::new(AtomicUsize::new(0));
    let w = f.device.watcher();
    w.when("Allow").call(counting(&hits)).unwrap();

    assert!(!w.running());
    w.start(Some(Duration::from_millis(20)));
    assert!(w.running());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(hits.load(Ordering::SeqCst) > 0);

    w.stop().await;
    assert!(!w.running());
    let after_stop = hits.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), after_stop);

    w.start(Some(Duration::from_millis(20)));
    assert!(w.running());
    tokio::time::sleep(Duration::from_millis(200)).await;
    w.stop().await;
    assert!(hits.load(Ordering::SeqCst) > after_stop);
}

#[tokio::test]
async fn test_second_start_is_ignored() {
    let f = fixture();
    let w = f.device.watcher();
    w.start(Some(Duration::from_millis(50)));
    w.start(Some(Duration::from_millis(50)));
    assert!(w.running());
    w.stop().await;
    assert!(!w.running());
    w.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_scans_speed_up_after_a_rule_fires() {
    let f = fixture_with(
        Settings {
            watcher_interval: 10.0,
            watcher_fast_interval: 0.1,
            ..fast_settings()
        },
        None,
    );
    f.transport.set_hierarchy(HIERARCHY_WITH_DIALOG);
    let hits = Arc::new(AtomicUsize::new(0));
    let w = f.device.watcher();
    w.when("Allow").call(counting(&hits)).unwrap();
    w.start(None);

    // fires at 10.0, then every 0.1s while the dialog stays
    tokio::time::sleep(Duration::from_millis(10_550)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 6);

    // one more fast scan finds nothing, then back to the normal interval
    f.transport.set_hierarchy(HIERARCHY);
    tokio::time::sleep(Duration::from_millis(4_450)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 6);
    assert_eq!(f.transport.calls_to("dumpWindowHierarchy").len(), 7);

    w.stop().await;
    assert!(!w.running());
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_ends_with_the_device() {
    let Fixture {
        device, transport, ..
    } = fixture();
    transport.set_hierarchy(HIERARCHY_WITH_DIALOG);
    let hits = Arc::new(AtomicUsize::new(0));
    let w = device.watcher();
    w.when("Allow").call(counting(&hits)).unwrap();
    w.start(Some(Duration::from_millis(10)));

    tokio::time::sleep(Duration::from_millis(55)).await;
    assert!(hits.load(Ordering::SeqCst) > 0);

    drop(w);
    drop(device);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let dumps = transport.calls_to("dumpWindowHierarchy").len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.calls_to("dumpWindowHierarchy").len(), dumps);
}
