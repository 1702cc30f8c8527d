//! Background build dispatch.
//!
//! Build triggers arrive in bursts (every save of every file in a project). The
//! [`BuildDispatcher`] collapses them per project in a [`DedupQueue`] and only runs a
//! build once no new request arrived for the configured quiet period.

use crate::concurrency::{CriticalSection, DedupQueue, ExclusiveState, ExclusiveValue};
use crate::context::KeeperContext;
use crate::services::build::{BuildError, BuildOutcome, BuildRequest, BuildRunner};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of one dispatched build.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    Started { key: String, config_id: String },
    Finished { key: String, outcome: BuildOutcome },
    Failed { key: String, error: String },
}

pub struct BuildDispatcher {
    context: Arc<KeeperContext>,
    runner: Arc<dyn BuildRunner>,
    queue: DedupQueue<String, BuildRequest>,
    last_request: Mutex<Option<Instant>>,
    in_flight: ExclusiveValue<String>,
    section: CriticalSection,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    events_tx: broadcast::Sender<BuildEvent>,
}

impl BuildDispatcher {
    pub fn new(context: Arc<KeeperContext>, runner: Arc<dyn BuildRunner>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(100);
        let cancel = context.shutdown_token();
        Arc::new(Self {
            context,
            runner,
            queue: DedupQueue::new(),
            last_request: Mutex::new(None),
            in_flight: ExclusiveValue::new(),
            section: CriticalSection::new(),
            worker: Mutex::new(None),
            stopped: Mutex::new(Vec::new()),
            cancel: Mutex::new(cancel),
            events_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events_tx.subscribe()
    }

    /// Queue a build, replacing any pending request for the same project, and
    /// start the dispatch loop if it is not running.
    ///
    /// # Returns
    /// false if the context is shutting down and the request was dropped
    pub fn start_build(self: &Arc<Self>, request: BuildRequest) -> bool {
        if self.context.is_shut_down() {
            tracing::warn!("Shutting down, build of {} dropped", request.project);
            return false;
        }

        // Serialized with stop() so a request is either drained by it or picked up
        // by the loop started here
        self.section.thread_safe(|| {
            let key = request.key();
            if self.queue.enqueue(key.clone(), request) {
                tracing::debug!("Pending build of {} replaced", key);
                self.context.metrics.record_queue_collapse();
            }
            *self.last_request.lock() = Some(Instant::now());
            self.ensure_running();
        });
        true
    }

    fn ensure_running(self: &Arc<Self>) {
        self.section.exclusive_init(
            || {
                self.worker
                    .lock()
                    .as_ref()
                    .filter(|handle| !handle.is_finished())
                    .map(|_| ())
            },
            || {
                let cancel = self.cancel.lock().clone();
                let handle = tokio::spawn(Arc::clone(self).run(cancel));
                *self.worker.lock() = Some(handle);
                tracing::debug!("Build dispatch loop started");
            },
        );
    }

    /// Project whose build is running right now.
    pub fn in_flight(&self) -> Option<String> {
        match self.in_flight.state() {
            ExclusiveState::Held => self.in_flight.get(),
            ExclusiveState::Empty | ExclusiveState::Released => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.count()
    }

    /// Drop every pending request. A running build is not interrupted.
    pub fn reset(&self) -> usize {
        let dropped = self.queue.clear();
        *self.last_request.lock() = None;
        if dropped > 0 {
            tracing::info!("Discarded {} pending build(s)", dropped);
        }
        dropped
    }

    /// Cancel the running build and the loop, and drain the requests pending now.
    ///
    /// The stopped loop is detached from the dispatcher at once, so a
    /// [`start_build`](Self::start_build) right after this call starts a fresh loop
    /// even while the old one is still winding down.
    pub fn stop(&self) -> usize {
        self.section.thread_safe(|| {
            let mut cancel = self.cancel.lock();
            cancel.cancel();
            *cancel = self.context.shutdown_token();
            drop(cancel);

            if let Some(handle) = self.worker.lock().take() {
                self.stopped.lock().push(handle);
            }
            let drained = self.queue.clear();
            *self.last_request.lock() = None;
            if drained > 0 {
                tracing::info!("Stopped build dispatch, {} pending build(s) drained", drained);
            }
            drained
        })
    }

    /// Wait for stopped loops, and the current one, to exit after
    /// [`stop`](Self::stop) or shutdown.
    pub async fn join(&self) {
        let mut handles: Vec<_> = self.stopped.lock().drain(..).collect();
        handles.extend(self.worker.lock().take());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Build dispatch loop panicked: {}", e);
            }
        }
    }

    fn is_ready(&self) -> bool {
        let quiet_period = self.context.settings.dispatch.quiet_period();
        !self.queue.is_empty()
            && self
                .last_request
                .lock()
                .is_none_or(|last| last.elapsed() >= quiet_period)
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let poll_interval = self.context.settings.dispatch.poll_interval();

        while !cancel.is_cancelled() {
            if !self.is_ready() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => continue,
                }
            }
            // Checked under the section so a loop that stop() already cancelled
            // never takes a request queued after it
            let next = self.section.thread_safe(|| {
                if cancel.is_cancelled() {
                    None
                } else {
                    self.queue.try_dequeue()
                }
            });
            let Some((key, request)) = next else {
                continue;
            };

            self.in_flight.acquire(key.clone()).await;
            let _ = self.events_tx.send(BuildEvent::Started {
                key: key.clone(),
                config_id: request.config_id.clone(),
            });

            let start = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(BuildError::Cancelled),
                result = self.runner.run_targets(&request) => result,
            };
            self.in_flight.release();

            let event = match result {
                Ok(outcome) => {
                    self.context.metrics.record_build(outcome.success, start.elapsed());
                    BuildEvent::Finished { key, outcome }
                }
                Err(e) => {
                    tracing::error!("Build of {} failed: {}", request.project, e);
                    self.context.metrics.record_build(false, start.elapsed());
                    BuildEvent::Failed {
                        key,
                        error: e.to_string(),
                    }
                }
            };
            let _ = self.events_tx.send(event);
        }

        // stop() drains its own queue; only a shutdown leaves work behind here
        if self.context.is_shut_down() {
            let drained = self.queue.clear();
            tracing::debug!("Build dispatch loop shut down, {} pending build(s) drained", drained);
        } else {
            tracing::debug!("Build dispatch loop stopped");
        }
    }
}

impl std::fmt::Debug for BuildDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildDispatcher")
            .field("pending", &self.queue.count())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Settings;
    use crate::services::build::MockBuildRunner;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn context(quiet_period_ms: u64) -> Arc<KeeperContext> {
        let mut settings = Settings::default();
        settings.dispatch.quiet_period_ms = quiet_period_ms;
        settings.dispatch.poll_interval_ms = 5;
        KeeperContext::init(settings)
    }

    fn outcome() -> BuildOutcome {
        BuildOutcome {
            success: true,
            exit_code: 0,
            diagnostics: Vec::new(),
            duration: Duration::from_millis(1),
        }
    }

    async fn next_finished(rx: &mut broadcast::Receiver<BuildEvent>) -> BuildEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if !matches!(event, BuildEvent::Started { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_burst_collapses_into_last_request() {
        let mut runner = MockBuildRunner::new();
        runner
            .expect_run_targets()
            .withf(|request| request.config_id == "Release|x64")
            .times(1)
            .returning(|_| Ok(outcome()));

        let context = context(50);
        let dispatcher = BuildDispatcher::new(Arc::clone(&context), Arc::new(runner));
        let mut rx = dispatcher.subscribe();

        for config in ["Debug|x64", "Debug|Win32", "Release|x64"] {
            assert!(dispatcher.start_build(BuildRequest::new("C:/src/app.vcxproj", config)));
        }
        assert_eq!(dispatcher.pending(), 1);

        let event = next_finished(&mut rx).await;
        assert!(matches!(event, BuildEvent::Finished { ref key, .. } if key == "c:/src/app.vcxproj"));
        assert_eq!(context.metrics.queue_collapses.load(Ordering::Relaxed), 2);
        assert_eq!(context.metrics.builds_dispatched.load(Ordering::Relaxed), 1);

        dispatcher.stop();
        dispatcher.join().await;
    }

    #[tokio::test]
    async fn test_failed_build_is_reported() {
        let mut runner = MockBuildRunner::new();
        runner
            .expect_run_targets()
            .returning(|_| Err(BuildError::Timeout(Duration::from_secs(1))));

        let context = context(0);
        let dispatcher = BuildDispatcher::new(Arc::clone(&context), Arc::new(runner));
        let mut rx = dispatcher.subscribe();

        dispatcher.start_build(BuildRequest::new("app.vcxproj", "Debug|x64"));
        let event = next_finished(&mut rx).await;
        assert!(matches!(event, BuildEvent::Failed { .. }));
        assert_eq!(context.metrics.builds_failed.load(Ordering::Relaxed), 1);

        dispatcher.stop();
        dispatcher.join().await;
    }

    #[tokio::test]
    async fn test_reset_discards_pending() {
        let mut runner = MockBuildRunner::new();
        runner.expect_run_targets().never();

        let dispatcher = BuildDispatcher::new(context(60_000), Arc::new(runner));
        dispatcher.start_build(BuildRequest::new("a.vcxproj", "Debug|x64"));
        dispatcher.start_build(BuildRequest::new("b.vcxproj", "Debug|x64"));

        assert_eq!(dispatcher.reset(), 2);
        assert_eq!(dispatcher.pending(), 0);
        assert!(dispatcher.in_flight().is_none());

        dispatcher.stop();
        dispatcher.join().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let mut runner = MockBuildRunner::new();
        runner.expect_run_targets().never();

        let context = context(60_000);
        let dispatcher = BuildDispatcher::new(Arc::clone(&context), Arc::new(runner));
        dispatcher.start_build(BuildRequest::new("a.vcxproj", "Debug|x64"));

        context.shutdown();
        dispatcher.join().await;
        assert_eq!(dispatcher.pending(), 0);
        assert!(!dispatcher.start_build(BuildRequest::new("a.vcxproj", "Debug|x64")));
    }
}
