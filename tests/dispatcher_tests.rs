//! Integration tests for BuildDispatcher
//!
//! These tests verify:
//! - Bursts for several projects collapse into one build per project
//! - Builds run in the order projects were first queued, with their last request
//! - Only one build runs at a time
//! - Stopping cancels a running build and a later request starts a fresh loop

use async_trait::async_trait;
use parking_lot::Mutex;
use projkeeper::services::{
    BuildDispatcher, BuildError, BuildEvent, BuildOutcome, BuildRequest, BuildRunner,
};
use projkeeper::{KeeperContext, Settings};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Records every request and sleeps for `delay` to simulate a build.
#[derive(Default)]
struct RecordingRunner {
    delay: Duration,
    requests: Mutex<Vec<BuildRequest>>,
    running: AtomicUsize,
    overlapped: AtomicUsize,
}

#[async_trait]
impl BuildRunner for RecordingRunner {
    async fn run_targets(&self, request: &BuildRequest) -> Result<BuildOutcome, BuildError> {
        if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.fetch_add(1, Ordering::SeqCst);
        }
        self.requests.lock().push(request.clone());
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(BuildOutcome {
            success: true,
            exit_code: 0,
            diagnostics: Vec::new(),
            duration: self.delay,
        })
    }
}

fn context(quiet_period_ms: u64) -> Arc<KeeperContext> {
    let mut settings = Settings::default();
    settings.dispatch.quiet_period_ms = quiet_period_ms;
    settings.dispatch.poll_interval_ms = 5;
    KeeperContext::init(settings)
}

async fn next_event(rx: &mut broadcast::Receiver<BuildEvent>) -> BuildEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no build event within 5s")
        .expect("event channel closed")
}

async fn next_done(rx: &mut broadcast::Receiver<BuildEvent>) -> BuildEvent {
    loop {
        let event = next_event(rx).await;
        if !matches!(event, BuildEvent::Started { .. }) {
            return event;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bursts_build_each_project_once() {
    let runner = Arc::new(RecordingRunner {
        delay: Duration::from_millis(5),
        ..Default::default()
    });
    let context = context(30);
    let dispatcher = BuildDispatcher::new(Arc::clone(&context), runner.clone());
    let mut rx = dispatcher.subscribe();

    for config in ["Debug|x64", "Release|x64"] {
        dispatcher.start_build(BuildRequest::new("C:/src/app/app.vcxproj", config));
        dispatcher.start_build(
            BuildRequest::new("C:/src/lib/lib.vcxproj", config).with_target("Build"),
        );
    }
    assert_eq!(dispatcher.pending(), 2);

    next_done(&mut rx).await;
    next_done(&mut rx).await;

    let requests = runner.requests.lock().clone();
    let built: Vec<(&str, &str)> = requests
        .iter()
        .map(|r| (r.project.as_str(), r.config_id.as_str()))
        .collect();
    assert_eq!(
        built,
        vec![
            ("C:/src/app/app.vcxproj", "Release|x64"),
            ("C:/src/lib/lib.vcxproj", "Release|x64"),
        ]
    );
    assert_eq!(runner.overlapped.load(Ordering::SeqCst), 0);
    assert_eq!(context.metrics.queue_collapses.load(Ordering::Relaxed), 2);
    assert_eq!(dispatcher.pending(), 0);

    dispatcher.stop();
    dispatcher.join().await;
}

#[tokio::test]
async fn test_stop_cancels_running_build_and_restarts() {
    let runner = Arc::new(RecordingRunner {
        delay: Duration::from_secs(60),
        ..Default::default()
    });
    let context = context(0);
    let dispatcher = BuildDispatcher::new(Arc::clone(&context), runner.clone());
    let mut rx = dispatcher.subscribe();

    dispatcher.start_build(BuildRequest::new("app.vcxproj", "Debug|x64"));
    let started = next_event(&mut rx).await;
    assert!(matches!(started, BuildEvent::Started { ref config_id, .. } if config_id == "Debug|x64"));
    assert_eq!(dispatcher.in_flight().as_deref(), Some("app.vcxproj"));

    dispatcher.stop();
    let failed = next_done(&mut rx).await;
    assert!(matches!(failed, BuildEvent::Failed { ref error, .. } if error.contains("cancel")));
    dispatcher.join().await;
    assert!(dispatcher.in_flight().is_none());

    // The dispatcher is still usable after a stop
    assert!(dispatcher.start_build(BuildRequest::new("app.vcxproj", "Release|x64")));
    let restarted = next_event(&mut rx).await;
    assert!(matches!(restarted, BuildEvent::Started { ref config_id, .. } if config_id == "Release|x64"));

    context.shutdown();
    dispatcher.join().await;
    assert_eq!(runner.requests.lock().len(), 2);
}

#[tokio::test]
async fn test_request_right_after_stop_is_built() {
    let runner = Arc::new(RecordingRunner {
        delay: Duration::from_millis(5),
        ..Default::default()
    });
    let context = context(0);
    let dispatcher = BuildDispatcher::new(Arc::clone(&context), runner.clone());
    let mut rx = dispatcher.subscribe();

    dispatcher.start_build(BuildRequest::new("a.vcxproj", "Debug|x64"));
    assert!(matches!(next_done(&mut rx).await, BuildEvent::Finished { .. }));

    // No join in between: the old loop has not yet seen its cancellation
    assert_eq!(dispatcher.stop(), 0);
    assert!(dispatcher.start_build(BuildRequest::new("b.vcxproj", "Debug|x64")));

    let done = next_done(&mut rx).await;
    assert!(matches!(done, BuildEvent::Finished { ref key, .. } if key == "b.vcxproj"));
    let built: Vec<_> = runner
        .requests
        .lock()
        .iter()
        .map(|r| r.project.to_string())
        .collect();
    assert_eq!(built, vec!["a.vcxproj", "b.vcxproj"]);

    context.shutdown();
    dispatcher.join().await;
}

#[tokio::test]
async fn test_stop_drains_only_requests_queued_before_it() {
    let runner = Arc::new(RecordingRunner::default());
    let context = context(60_000);
    let dispatcher = BuildDispatcher::new(Arc::clone(&context), runner.clone());

    dispatcher.start_build(BuildRequest::new("a.vcxproj", "Debug|x64"));
    dispatcher.start_build(BuildRequest::new("b.vcxproj", "Debug|x64"));
    assert_eq!(dispatcher.stop(), 2);

    dispatcher.start_build(BuildRequest::new("c.vcxproj", "Debug|x64"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.pending(), 1);
    assert!(runner.requests.lock().is_empty());

    context.shutdown();
    dispatcher.join().await;
    assert_eq!(dispatcher.pending(), 0);
}
