use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use svcreg_client::{IpPortManager, RegistryContext};
use svcreg_consumer::AppManager;
use svcreg_core::{
    EventKind, Microservice, RegistryEvent, SubscriptionId, TaskKind, TaskStatus, VersionRule,
    REGISTRY_APP_ID, REGISTRY_SERVICE_NAME,
};
use svcreg_task::ServiceCenterTask;

use crate::error::{ServiceRegistryError, ServiceRegistryResult};

#[derive(Debug, Default)]
struct RegisteredIds {
    service_id: Option<String>,
    instance_id: Option<String>,
}

/// Registers this process's microservice and serves the consumer cache.
///
/// Call [`init`](Self::init) once, then [`run`](Self::run);
/// [`shutdown`](Self::shutdown) stops the background tasks and tears the
/// cache down.
pub struct ServiceRegistry {
    ctx: RegistryContext,
    app_manager: Arc<AppManager>,
    ip_port_manager: Arc<IpPortManager>,
    task: Option<ServiceCenterTask>,
    wake: Arc<Notify>,
    registered: Arc<Mutex<RegisteredIds>>,
    subscriptions: Vec<SubscriptionId>,
    shutdown_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
    /// Pulls triggered by watch pushes. `None` once shutdown has begun.
    pushes: Arc<Mutex<Option<JoinSet<()>>>>,
}

impl ServiceRegistry {
    pub fn new(ctx: RegistryContext, microservice: Microservice) -> Self {
        let task = ServiceCenterTask::new(ctx.clone(), microservice);
        Self {
            app_manager: Arc::new(AppManager::new(ctx.clone())),
            ip_port_manager: Arc::new(IpPortManager::new(&ctx.config)),
            wake: task.wake_handle(),
            task: Some(task),
            ctx,
            registered: Arc::new(Mutex::new(RegisteredIds::default())),
            subscriptions: Vec::new(),
            shutdown_tx: None,
            handles: Vec::new(),
            pushes: Arc::new(Mutex::new(Some(JoinSet::new()))),
        }
    }

    pub fn context(&self) -> &RegistryContext {
        &self.ctx
    }

    pub fn app_manager(&self) -> &Arc<AppManager> {
        &self.app_manager
    }

    pub fn ip_port_manager(&self) -> &Arc<IpPortManager> {
        &self.ip_port_manager
    }

    fn registered(&self) -> MutexGuard<'_, RegisteredIds> {
        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Service id assigned by the registry, once registered.
    pub fn service_id(&self) -> Option<String> {
        self.registered().service_id.clone()
    }

    /// Instance id assigned by the registry, once registered.
    pub fn instance_id(&self) -> Option<String> {
        self.registered().instance_id.clone()
    }

    /// Cut the registration loop's current sleep short.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Wire bus subscriptions and, with auto-discovery on, attach the
    /// registry's own instances as extra addresses. Must be called from
    /// within a tokio runtime. Calling it again is a no-op.
    pub async fn init(&mut self) -> ServiceRegistryResult<()> {
        if !self.subscriptions.is_empty() {
            return Ok(());
        }
        let bus = Arc::clone(&self.ctx.bus);

        // Bus handlers run on the posting thread, which may be the watch
        // I/O task, so the pull triggered by a push is spawned.
        let runtime = Handle::current();
        let app_manager = Arc::clone(&self.app_manager);
        let pushes = Arc::clone(&self.pushes);
        self.subscriptions
            .push(bus.subscribe(EventKind::InstanceChanged, move |event| {
                let RegistryEvent::InstanceChanged(changed) = event else {
                    return;
                };
                let mut pushes = pushes
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let Some(set) = pushes.as_mut() else {
                    debug!("shutting down, dropping pushed change");
                    return;
                };
                while set.try_join_next().is_some() {}
                let app_manager = Arc::clone(&app_manager);
                let changed = changed.clone();
                set.spawn_on(
                    async move { app_manager.on_instance_changed(changed).await },
                    &runtime,
                );
            }));

        let app_manager = Arc::clone(&self.app_manager);
        self.subscriptions
            .push(bus.subscribe(EventKind::SafeModeChanged, move |event| {
                if let RegistryEvent::SafeModeChanged { enabled } = event {
                    app_manager.on_safe_mode_changed(*enabled);
                }
            }));

        let registered = Arc::clone(&self.registered);
        self.subscriptions
            .push(bus.subscribe(EventKind::TaskCompleted, move |event| {
                let RegistryEvent::TaskCompleted(completion) = event else {
                    return;
                };
                if completion.status != TaskStatus::Finished {
                    return;
                }
                let mut ids = registered
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match completion.kind {
                    TaskKind::RegisterMicroservice => {
                        ids.service_id = completion.service_id.clone();
                    }
                    TaskKind::RegisterInstance => {
                        ids.service_id = completion.service_id.clone();
                        ids.instance_id = completion.instance_id.clone();
                    }
                    _ => {}
                }
            }));

        if self.ctx.config.registry_auto_discovery {
            let rule = self
                .app_manager
                .get_or_create_version_rule(
                    REGISTRY_APP_ID,
                    REGISTRY_SERVICE_NAME,
                    VersionRule::LATEST,
                )
                .await?;
            self.ip_port_manager.set_address_source(Box::new(rule));
        }

        info!(
            auto_discovery = self.ctx.config.registry_auto_discovery,
            watch = self.ctx.config.watch,
            "service registry initialized"
        );
        Ok(())
    }

    /// Spawn the registration loop and the periodic instance pull.
    pub fn run(&mut self) -> ServiceRegistryResult<()> {
        let task = self.task.take().ok_or(ServiceRegistryError::AlreadyRunning)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task_shutdown = shutdown_rx.clone();
        self.handles.push(tokio::spawn(async move {
            task.run(task_shutdown).await;
        }));

        let app_manager = Arc::clone(&self.app_manager);
        let period = self.ctx.config.instance_pull_interval();
        self.handles
            .push(tokio::spawn(pull_loop(app_manager, period, shutdown_rx)));

        info!(
            pull_interval_secs = period.as_secs(),
            heartbeat_interval_secs = self.ctx.config.heartbeat_interval_secs,
            "service registry running"
        );
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Stop both loops and wait for them. Then drop the bus subscriptions,
    /// finish any in-flight pushed pulls, and destroy the consumer cache.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "registry background task ended abnormally");
            }
        }
        for id in self.subscriptions.drain(..) {
            self.ctx.bus.unsubscribe(id);
        }
        let pending = self
            .pushes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut set) = pending {
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "pushed pull ended abnormally");
                }
            }
        }
        self.app_manager.destroy().await;
        info!("service registry stopped");
    }
}

async fn pull_loop(
    app_manager: Arc<AppManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);
    loop {
        tokio::select! {
            _ = interval.tick() => app_manager.pull_instances().await,
            _ = shutdown.changed() => break,
        }
    }
}
