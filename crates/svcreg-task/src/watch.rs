//! Watch stream over this microservice's dependencies.
//!
//! The watch task stays READY for as long as the chain is healthy; each
//! run (re)opens the stream if it is not currently open. Stream
//! callbacks arrive on the transport's I/O task and only touch atomics
//! and the event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use svcreg_client::{RegistryContext, RegistryError, WatchListener};
use svcreg_core::{
    EventBus, InstanceChangedEvent, Microservice, RegistryEvent, TaskKind, TaskStatus,
};

use crate::task::Task;

/// Turns watch callbacks into bus events.
pub struct WatchForwarder {
    bus: Arc<EventBus>,
    auto_discovery: bool,
    active: Arc<AtomicBool>,
}

impl WatchForwarder {
    pub fn new(bus: Arc<EventBus>, auto_discovery: bool, active: Arc<AtomicBool>) -> Self {
        Self {
            bus,
            auto_discovery,
            active,
        }
    }

    /// Events about the registry's own service only matter when we
    /// rotate across its instances.
    pub fn should_forward(&self, event: &InstanceChangedEvent) -> bool {
        !event.key.is_registry_service() || self.auto_discovery
    }
}

impl WatchListener for WatchForwarder {
    fn on_event(&self, event: Result<InstanceChangedEvent, RegistryError>) {
        match event {
            Ok(event) => {
                if !self.should_forward(&event) {
                    debug!(service = %event.key.service_name, "ignoring registry service event");
                    return;
                }
                debug!(
                    app_id = %event.key.app_id,
                    service = %event.key.service_name,
                    action = ?event.action,
                    "instance change pushed"
                );
                self.bus.post(&RegistryEvent::InstanceChanged(event));
            }
            Err(e) => {
                self.active.store(false, Ordering::Release);
                warn!(error = %e, "watch stream failed");
                self.bus.post(&RegistryEvent::WatchException {
                    message: e.to_string(),
                });
            }
        }
    }

    fn on_open(&self) {
        self.active.store(true, Ordering::Release);
        info!("watch stream open");
        self.bus.post(&RegistryEvent::WatchRecovery);
    }

    fn on_close(&self) {
        self.active.store(false, Ordering::Release);
        info!("watch stream closed");
    }
}

pub struct MicroserviceWatchTask {
    ctx: RegistryContext,
    status: TaskStatus,
    /// Set while a stream is requested or open.
    active: Arc<AtomicBool>,
    /// Service id the current stream was opened for.
    watched: Option<String>,
}

impl MicroserviceWatchTask {
    pub fn new(ctx: RegistryContext) -> Self {
        Self {
            ctx,
            status: TaskStatus::Init,
            active: Arc::new(AtomicBool::new(false)),
            watched: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Close the stream for `service_id`.
    pub async fn stop(&self, service_id: &str) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!(%service_id, "stopping watch");
        }
        self.ctx.client.stop_watch(service_id).await;
    }

    async fn open(&self, service_id: &str) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }

        let listener = Arc::new(WatchForwarder::new(
            Arc::clone(&self.ctx.bus),
            self.ctx.config.registry_auto_discovery,
            Arc::clone(&self.active),
        ));
        if let Err(e) = self.ctx.client.watch(service_id, listener).await {
            self.active.store(false, Ordering::Release);
            warn!(%service_id, error = %e, "failed to open watch");
            self.ctx.bus.post(&RegistryEvent::WatchException {
                message: e.to_string(),
            });
        }
    }
}

#[async_trait]
impl Task for MicroserviceWatchTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Watch
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    async fn do_run(&mut self, microservice: &mut Microservice) {
        if !self.ctx.config.watch {
            return;
        }
        let Some(service_id) = microservice.service_id.as_deref() else {
            return;
        };

        // Re-registration may have produced a new service id.
        if let Some(previous) = self.watched.take_if(|w| w.as_str() != service_id) {
            self.stop(&previous).await;
        }
        self.open(service_id).await;
        self.watched = Some(service_id.to_string());
    }
}
