//! Top-level supervision: fan-out to per-application supervisors plus the
//! two convergence loops.
//!
//! [`Supervisor::set`] records the desired applications and forwards each one
//! to its [`ApplicationSupervisor`], creating it on first sight. Two
//! background loops then converge independently:
//!
//! - the application GC stops and forgets supervisors whose application is
//!   no longer desired;
//! - the container GC stops and removes agent-labelled containers whose
//!   application has no live supervisor.
//!
//! Both loops start on the first `set` and end on [`Supervisor::shutdown`]
//! (or drop).
//!
//! The application GC stops supervisors outside the registry lock. If an
//! application is desired again while its old supervisor is stopping, the
//! stopped instance is replaced by a fresh one fed the remembered desired
//! state, so the application never stays desired without a supervisor.

pub mod application;
pub mod reporter;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, Once, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

pub use application::{
    ApplicationContext, ApplicationSupervisor, ApplicationSupervisorFactory,
    ContainerApplicationSupervisor, ContainerSupervisorFactory,
};
pub use reporter::{LogReportSink, ReportError, ReportSink, Reporter};

use crate::config::SupervisorConfig;
use crate::engine::{Engine, EngineError, Instance, LabelFilter};
use crate::models::{Bundle, FullBundledApplication, APPLICATION_LABEL};
use crate::validator::Validator;
use crate::variables::Variables;

/// Shared collaborators for the supervisor and every application it creates.
pub struct SupervisorDeps {
    /// Container engine.
    pub engine: Arc<dyn Engine>,
    /// Device policy.
    pub variables: Arc<dyn Variables>,
    /// Where status reports go.
    pub sink: Arc<dyn ReportSink>,
    /// Admission validators, applied in order.
    pub validators: Vec<Arc<dyn Validator>>,
}

#[derive(Default)]
struct Registry {
    /// Desired applications from the latest `set`, by ID.
    desired: HashMap<String, FullBundledApplication>,
    /// Bundle from the latest `set`.
    bundle: Bundle,
    application_supervisors: HashMap<String, Arc<dyn ApplicationSupervisor>>,
}

struct Shared {
    deps: SupervisorDeps,
    config: SupervisorConfig,
    factory: Arc<dyn ApplicationSupervisorFactory>,
    registry: RwLock<Registry>,
    shutdown_tx: watch::Sender<bool>,
}

/// Reconciles desired applications against supervisors and containers.
pub struct Supervisor {
    shared: Arc<Shared>,
    started: Once,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Supervisor creating [`ContainerApplicationSupervisor`]s with default settings.
    pub fn new(deps: SupervisorDeps, config: SupervisorConfig) -> Self {
        Self::with_factory(deps, config, Arc::new(ContainerSupervisorFactory::default()))
    }

    /// Supervisor creating application supervisors through `factory`.
    pub fn with_factory(
        deps: SupervisorDeps,
        config: SupervisorConfig,
        factory: Arc<dyn ApplicationSupervisorFactory>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                deps,
                config,
                factory,
                registry: RwLock::new(Registry::default()),
                shutdown_tx,
            }),
            started: Once::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Make `applications` the desired set and forward each to its supervisor.
    ///
    /// Supervisors are created on first sight of an application ID and reused
    /// afterwards. The first call made inside a Tokio runtime starts the
    /// background loops.
    pub fn set(&self, bundle: &Bundle, applications: &[FullBundledApplication]) {
        let shared = &self.shared;
        {
            let mut registry = shared.write_registry();
            let mut desired = HashMap::with_capacity(applications.len());

            for application in applications {
                let id = &application.application.id;
                let supervisor = registry
                    .application_supervisors
                    .entry(id.clone())
                    .or_insert_with(|| {
                        info!(application_id = %id, "creating application supervisor");
                        shared.factory.create(shared.context_for(id))
                    });
                supervisor.set(bundle, application);
                desired.insert(id.clone(), application.clone());
            }

            registry.desired = desired;
            registry.bundle = bundle.clone();
        }

        self.start_background();
    }

    /// One application-GC cycle: stop and forget every supervisor whose
    /// application is no longer desired. Returns the collected IDs.
    pub async fn collect_dangling_applications(&self) -> Vec<String> {
        self.shared.collect_dangling_applications().await
    }

    /// One container-GC cycle: stop and remove every agent-labelled container
    /// whose application has no supervisor. Returns the removed container IDs.
    ///
    /// # Errors
    ///
    /// Returns the engine error when containers cannot be listed. Failures on
    /// individual containers are logged and skipped.
    pub async fn collect_orphaned_containers(&self) -> Result<Vec<String>, EngineError> {
        self.shared.collect_orphaned_containers().await
    }

    /// IDs with a live application supervisor, sorted.
    pub fn application_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .read_registry()
            .application_supervisors
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// IDs from the most recent `set`, sorted.
    pub fn desired_application_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .read_registry()
            .desired
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Whether the background loops have been started.
    pub fn is_started(&self) -> bool {
        self.started.is_completed()
    }

    /// Background loops spawned and not yet joined.
    pub fn loop_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Signal both loops to stop and abort in-flight container-GC engine calls.
    ///
    /// Application supervisors are left as they are. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.shutdown_tx.send_replace(true) {
            info!("supervisor shutting down");
        }
    }

    /// Wait for the background loops to exit. Call after [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "supervisor loop ended abnormally");
            }
        }
    }

    fn start_background(&self) {
        if *self.shared.shutdown_tx.borrow() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime, supervisor loops not started");
            return;
        };

        self.started.call_once(|| {
            let application_gc = handle.spawn(
                Arc::clone(&self.shared).run_application_gc(self.shared.shutdown_tx.subscribe()),
            );
            let container_gc = handle.spawn(
                Arc::clone(&self.shared).run_container_gc(self.shared.shutdown_tx.subscribe()),
            );
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend([application_gc, container_gc]);
            info!(
                gc_interval_ms = self.shared.config.gc_interval_ms,
                "supervisor loops started"
            );
        });
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn read_registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn context_for(&self, application_id: &str) -> ApplicationContext {
        ApplicationContext {
            application_id: application_id.to_owned(),
            engine: Arc::clone(&self.deps.engine),
            variables: Arc::clone(&self.deps.variables),
            reporter: Reporter::new(
                application_id,
                Arc::clone(&self.deps.sink),
                self.config.report_timeout(),
            ),
            validators: self.deps.validators.clone(),
        }
    }

    async fn run_application_gc(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.gc_interval());
        // Skip the first immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let collected = self.collect_dangling_applications().await;
                    if !collected.is_empty() {
                        info!(count = collected.len(), "collected dangling applications");
                    }
                }
                () = wait_stopped(&mut shutdown_rx) => break,
            }
        }

        info!("application gc stopped");
    }

    async fn run_container_gc(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.gc_interval());
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.collect_orphaned_containers().await {
                        Ok(removed) if !removed.is_empty() => {
                            info!(count = removed.len(), "removed orphaned containers");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "container gc skipped, listing failed"),
                    }
                }
                () = wait_stopped(&mut shutdown_rx) => break,
            }
        }

        info!("container gc stopped");
    }

    async fn collect_dangling_applications(&self) -> Vec<String> {
        let dangling: Vec<(String, Arc<dyn ApplicationSupervisor>)> = {
            let registry = self.read_registry();
            registry
                .application_supervisors
                .iter()
                .filter(|(id, _)| !registry.desired.contains_key(*id))
                .map(|(id, supervisor)| (id.clone(), Arc::clone(supervisor)))
                .collect()
        };

        let mut collected = Vec::with_capacity(dangling.len());
        for (id, supervisor) in dangling {
            info!(application_id = %id, "stopping dangling application");
            supervisor.stop().await;
            if self.forget_stopped(&id, &supervisor) {
                collected.push(id);
            }
        }
        collected
    }

    /// Drop a stopped supervisor from the registry. Returns false when the
    /// entry was kept: either replaced meanwhile, or re-desired, in which case
    /// a fresh supervisor takes the stopped one's place.
    fn forget_stopped(&self, id: &str, stopped: &Arc<dyn ApplicationSupervisor>) -> bool {
        let mut registry = self.write_registry();
        let still_current = registry
            .application_supervisors
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, stopped));
        if !still_current {
            return false;
        }

        let Some(application) = registry.desired.get(id).cloned() else {
            registry.application_supervisors.remove(id);
            return true;
        };

        info!(application_id = %id, "application desired again during stop, recreating supervisor");
        let fresh = self.factory.create(self.context_for(id));
        fresh.set(&registry.bundle, &application);
        registry
            .application_supervisors
            .insert(id.to_owned(), fresh);
        false
    }

    async fn collect_orphaned_containers(&self) -> Result<Vec<String>, EngineError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let filter = LabelFilter::default().with_key(APPLICATION_LABEL);

        let Some(listed) =
            until_shutdown(&mut shutdown_rx, self.deps.engine.list_containers(&filter, true)).await
        else {
            return Ok(Vec::new());
        };
        let instances = listed?;

        let live: HashSet<String> = self
            .read_registry()
            .application_supervisors
            .keys()
            .cloned()
            .collect();

        let orphans: Vec<Instance> = instances
            .into_iter()
            .filter(|instance| {
                instance
                    .label(APPLICATION_LABEL)
                    .is_some_and(|application_id| !live.contains(application_id))
            })
            .collect();
        if orphans.is_empty() {
            return Ok(Vec::new());
        }

        let permits = Arc::new(Semaphore::new(self.config.container_gc_concurrency.max(1)));
        let mut workers = JoinSet::new();
        for instance in orphans {
            let engine = Arc::clone(&self.deps.engine);
            let permits = Arc::clone(&permits);
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            workers.spawn(async move {
                let _permit = until_shutdown(&mut shutdown_rx, permits.acquire_owned())
                    .await?
                    .ok()?;
                let gone = reclaim(engine.as_ref(), &instance, &mut shutdown_rx).await;
                gone.then_some(instance.id)
            });
        }

        let mut removed = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Some(id)) => removed.push(id),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "container gc worker failed"),
            }
        }
        Ok(removed)
    }
}

/// Stop then remove an orphaned container. Returns true once it is gone.
async fn reclaim(
    engine: &dyn Engine,
    instance: &Instance,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let id = instance.id.as_str();
    let application_id = instance.label(APPLICATION_LABEL).unwrap_or_default();
    info!(container_id = id, application_id, "reclaiming orphaned container");

    match until_shutdown(shutdown_rx, engine.stop_container(id)).await {
        None => return false,
        Some(Ok(())) | Some(Err(EngineError::NotFound(_))) => {}
        Some(Err(e)) => warn!(container_id = id, error = %e, "failed to stop orphaned container"),
    }

    match until_shutdown(shutdown_rx, engine.remove_container(id)).await {
        None => false,
        Some(Ok(())) => {
            debug!(container_id = id, "orphaned container removed");
            true
        }
        Some(Err(EngineError::NotFound(_))) => true,
        Some(Err(e)) => {
            warn!(container_id = id, error = %e, "failed to remove orphaned container");
            false
        }
    }
}

/// Resolves once shutdown is signalled or the signal sender is gone.
pub(crate) async fn wait_stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// Drive `work` unless shutdown arrives first, in which case it is dropped.
async fn until_shutdown<F: Future>(rx: &mut watch::Receiver<bool>, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = wait_stopped(rx) => None,
        output = work => Some(output),
    }
}
