//! The loop that drives the registration chain.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

use svcreg_client::RegistryContext;
use svcreg_core::{
    EventKind, HeartbeatResult, Microservice, SubscriptionId, TaskCompletion, TaskKind,
    TaskStatus,
};

use crate::backoff::BackoffLadder;
use crate::chain::RegistrationChain;
use crate::monitor::ServiceCenterTaskMonitor;

/// Ticks the [`RegistrationChain`] and picks how long to sleep between
/// ticks: the heartbeat interval while healthy, the backoff ladder after
/// a failed cycle.
pub struct ServiceCenterTask {
    ctx: RegistryContext,
    chain: RegistrationChain,
    monitor: ServiceCenterTaskMonitor,
    ladder: BackoffLadder,
    success: bool,
    /// Raised from the watch I/O task, consumed at the end of a cycle.
    watch_failed: Arc<AtomicBool>,
    wake: Arc<Notify>,
    subscription: SubscriptionId,
}

impl ServiceCenterTask {
    pub fn new(ctx: RegistryContext, microservice: Microservice) -> Self {
        let watch_failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&watch_failed);
        let subscription = ctx.bus.subscribe(EventKind::WatchException, move |_| {
            flag.store(true, Ordering::Release);
        });

        Self {
            chain: RegistrationChain::new(ctx.clone(), microservice),
            ctx,
            monitor: ServiceCenterTaskMonitor::new(),
            ladder: BackoffLadder::new(),
            success: false,
            watch_failed,
            wake: Arc::new(Notify::new()),
            subscription,
        }
    }

    pub fn chain(&self) -> &RegistrationChain {
        &self.chain
    }

    /// Whether the last cycle counted as healthy.
    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn consecutive_failures(&self) -> usize {
        self.ladder.consecutive_failures()
    }

    /// Notifying this handle cuts the current sleep short.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    fn observe(&mut self, completion: &TaskCompletion) {
        match completion.kind {
            TaskKind::RegisterMicroservice if completion.status != TaskStatus::Finished => {
                self.success = false;
            }
            TaskKind::RegisterInstance => {
                self.success = completion.status == TaskStatus::Finished;
            }
            TaskKind::Heartbeat => {
                self.success = completion.heartbeat == Some(HeartbeatResult::Success);
            }
            _ => {}
        }
    }

    /// Run one cycle and return the interval to wait before the next.
    pub async fn run_once(&mut self) -> Duration {
        let completions = self.chain.tick().await;
        for completion in &completions {
            self.observe(completion);
        }
        if self.watch_failed.swap(false, Ordering::AcqRel) {
            self.success = false;
        }

        let interval = self
            .ladder
            .next_interval(self.success, self.ctx.config.heartbeat_interval());
        debug!(
            stage = ?self.chain.stage(),
            success = self.success,
            interval_ms = interval.as_millis() as u64,
            "registry task cycle done"
        );
        interval
    }

    /// One cycle with panics contained. A panicking cycle counts as failed
    /// and the chain starts over from registration, since the transition
    /// for the task that was completing may never have been applied.
    async fn guarded_cycle(&mut self) -> Duration {
        match AssertUnwindSafe(self.run_once()).catch_unwind().await {
            Ok(interval) => interval,
            Err(payload) => {
                error!(
                    panic = panic_message(payload.as_ref()),
                    stage = ?self.chain.stage(),
                    "registry task cycle panicked"
                );
                self.success = false;
                self.chain.reset();
                self.ladder
                    .next_interval(false, self.ctx.config.heartbeat_interval())
            }
        }
    }

    /// Run until `shutdown` changes, then close the watch stream.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            app_id = %self.chain.microservice().app_id,
            service = %self.chain.microservice().service_name,
            "registry task started"
        );

        let mut interval = Duration::ZERO;
        loop {
            self.monitor.begin_cycle(interval);
            interval = self.guarded_cycle().await;
            self.monitor.end_cycle();

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => {
                    debug!("registry task woken early");
                }
                _ = shutdown.changed() => {
                    info!("registry task shutting down");
                    break;
                }
            }
        }

        self.chain.stop().await;
        self.ctx.bus.unsubscribe(self.subscription);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use svcreg_client::InMemoryRegistry;
    use svcreg_core::RegistryConfig;

    fn setup() -> (Arc<InMemoryRegistry>, ServiceCenterTask) {
        let registry = Arc::new(InMemoryRegistry::new());
        let ctx = RegistryContext::new(RegistryConfig::default(), registry.clone());
        let mut ms = Microservice::new("app", "orders", "1.0.0");
        ms.instance.endpoints = vec!["rest://127.0.0.1:8080".to_string()];
        (registry, ServiceCenterTask::new(ctx, ms))
    }

    #[tokio::test]
    async fn offline_registry_backs_off_then_recovers() {
        let (registry, mut task) = setup();
        registry.set_available(false);

        let mut secs = Vec::new();
        for _ in 0..4 {
            secs.push(task.run_once().await.as_secs());
        }
        assert_eq!(secs, vec![1, 2, 3, 10]);
        assert!(!task.is_success());

        registry.set_available(true);
        assert_eq!(task.run_once().await, Duration::from_secs(30));
        assert!(task.is_success());
        assert_eq!(task.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn disconnected_heartbeat_backs_off() {
        let (registry, mut task) = setup();
        assert_eq!(task.run_once().await, Duration::from_secs(30));

        registry.set_available(false);
        assert_eq!(task.run_once().await, Duration::from_secs(1));
        assert_eq!(task.run_once().await, Duration::from_secs(2));

        registry.set_available(true);
        assert_eq!(task.run_once().await, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn watch_exception_fails_the_cycle() {
        let (registry, mut task) = setup();
        task.run_once().await;

        registry.fail_watchers("connection reset");
        assert_eq!(task.run_once().await, Duration::from_secs(1));
        assert!(task.chain().is_watching());
        assert_eq!(task.run_once().await, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ticks_wakes_and_shuts_down() {
        let (registry, task) = setup();
        let wake = task.wake_handle();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(task.run(rx));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(registry.heartbeat_calls(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.heartbeat_calls(), 2);

        wake.notify_one();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(registry.heartbeat_calls(), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(registry.watcher_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_does_not_end_the_loop() {
        let (registry, task) = setup();
        let armed = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&armed);
        task.ctx.bus.subscribe(EventKind::TaskCompleted, move |_| {
            if flag.swap(false, Ordering::AcqRel) {
                panic!("completion handler failed");
            }
        });
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(task.run(rx));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!handle.is_finished());
        assert_eq!(registry.heartbeat_calls(), 0);

        // The failed cycle takes the first backoff rung.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.heartbeat_calls(), 1);
        assert_eq!(registry.microservice_count(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(registry.heartbeat_calls(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(registry.watcher_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_cycles_keep_backoff_cadence() {
        let (registry, task) = setup();
        registry.set_available(false);
        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cycles);
        task.ctx.bus.subscribe(EventKind::TaskCompleted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (tx, rx) = watch::channel(false);
        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(task.run(rx));

        // Cycles at 0s, 1s, 3s, 6s, 16s, then 36s.
        let mut seen = Vec::new();
        for at_ms in [1, 1_001, 3_001, 6_001, 15_900, 16_001] {
            tokio::time::sleep_until(start + Duration::from_millis(at_ms)).await;
            seen.push(cycles.load(Ordering::SeqCst));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 4, 5]);
        assert_eq!(registry.heartbeat_calls(), 0);

        registry.set_available(true);
        tokio::time::sleep_until(start + Duration::from_millis(36_001)).await;
        assert_eq!(registry.heartbeat_calls(), 1);
        tokio::time::sleep_until(start + Duration::from_millis(66_001)).await;
        assert_eq!(registry.heartbeat_calls(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
