//! Per-application supervision.
//!
//! [`ApplicationSupervisor`] is the unit the top-level supervisor keeps one
//! of per application ID. [`ContainerApplicationSupervisor`] is the stock
//! implementation: it converges the application's containers to its latest
//! release in a background loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::reporter::Reporter;
use super::wait_stopped;
use crate::config::ApplicationConfig;
use crate::engine::{ContainerSpec, Engine, Instance, LabelFilter};
use crate::models::{
    Bundle, FullBundledApplication, Release, Service, ServiceState,
    SetDeviceServiceStateRequest, SetDeviceServiceStatusRequest, APPLICATION_LABEL, RELEASE_LABEL,
    SERVICE_LABEL,
};
use crate::validator::{validate_service, Validator};
use crate::variables::Variables;

/// Lifecycle of one application on the device.
#[async_trait]
pub trait ApplicationSupervisor: Send + Sync {
    /// Hand over the latest desired state. Idempotent and non-blocking.
    fn set(&self, bundle: &Bundle, application: &FullBundledApplication);

    /// Tear the application down. Returns once teardown has finished.
    async fn stop(&self);
}

/// Collaborators handed to each new application supervisor.
#[derive(Clone)]
pub struct ApplicationContext {
    /// Application this supervisor owns.
    pub application_id: String,
    /// Container engine.
    pub engine: Arc<dyn Engine>,
    /// Device policy.
    pub variables: Arc<dyn Variables>,
    /// Reporter bound to `application_id`.
    pub reporter: Reporter,
    /// Admission validators, applied in order.
    pub validators: Vec<Arc<dyn Validator>>,
}

/// Builds application supervisors on first sight of an application ID.
pub trait ApplicationSupervisorFactory: Send + Sync {
    /// Create the supervisor for `context.application_id`.
    fn create(&self, context: ApplicationContext) -> Arc<dyn ApplicationSupervisor>;
}

/// Factory for [`ContainerApplicationSupervisor`].
#[derive(Debug, Clone, Default)]
pub struct ContainerSupervisorFactory {
    config: ApplicationConfig,
}

impl ContainerSupervisorFactory {
    /// Factory whose supervisors reconcile every `config.reconcile_interval()`.
    pub fn new(config: ApplicationConfig) -> Self {
        Self { config }
    }
}

impl ApplicationSupervisorFactory for ContainerSupervisorFactory {
    fn create(&self, context: ApplicationContext) -> Arc<dyn ApplicationSupervisor> {
        Arc::new(ContainerApplicationSupervisor::new(
            context,
            self.config.reconcile_interval(),
        ))
    }
}

/// Converges one application's containers to its latest release.
///
/// The reconcile loop starts on the first [`set`](ApplicationSupervisor::set)
/// made inside a Tokio runtime and runs until [`stop`](ApplicationSupervisor::stop)
/// or drop.
pub struct ContainerApplicationSupervisor {
    reconciler: Arc<Reconciler>,
    release_tx: watch::Sender<Option<Release>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerApplicationSupervisor {
    /// Create an idle supervisor. A zero `reconcile_interval` is raised to
    /// one millisecond.
    pub fn new(context: ApplicationContext, reconcile_interval: Duration) -> Self {
        let (release_tx, _) = watch::channel(None);
        let (stop_tx, _) = watch::channel(false);
        Self {
            reconciler: Arc::new(Reconciler {
                context,
                interval: reconcile_interval.max(Duration::from_millis(1)),
            }),
            release_tx,
            stop_tx,
            task: Mutex::new(None),
        }
    }

    fn ensure_running(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || *self.stop_tx.borrow() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let reconciler = Arc::clone(&self.reconciler);
                *task = Some(handle.spawn(
                    reconciler.run(self.release_tx.subscribe(), self.stop_tx.subscribe()),
                ));
            }
            Err(_) => warn!(
                application_id = %self.reconciler.context.application_id,
                "no runtime, reconcile loop not started"
            ),
        }
    }
}

#[async_trait]
impl ApplicationSupervisor for ContainerApplicationSupervisor {
    fn set(&self, _bundle: &Bundle, application: &FullBundledApplication) {
        let next = application.latest_release.clone();
        self.release_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        self.ensure_running();
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(
                    application_id = %self.reconciler.context.application_id,
                    error = %e,
                    "reconcile loop ended abnormally"
                );
            }
        }

        self.reconciler.remove_all().await;
        info!(
            application_id = %self.reconciler.context.application_id,
            "application stopped"
        );
    }
}

/// Last report successfully delivered per service.
#[derive(Debug, Default)]
struct ReportCache {
    states: HashMap<String, SetDeviceServiceStateRequest>,
    statuses: HashMap<String, String>,
    release: Option<String>,
}

impl ReportCache {
    fn retain_services(&mut self, release: &Release) {
        self.states.retain(|name, _| release.config.contains_key(name));
        self.statuses
            .retain(|name, _| release.config.contains_key(name));
    }
}

struct Reconciler {
    context: ApplicationContext,
    interval: Duration,
}

impl Reconciler {
    async fn run(
        self: Arc<Self>,
        mut release_rx: watch::Receiver<Option<Release>>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let application_id = self.context.application_id.clone();
        debug!(application_id = %application_id, "reconcile loop started");

        let mut ticker = tokio::time::interval(self.interval);
        let mut cache = ReportCache::default();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = release_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = wait_stopped(&mut stop_rx) => break,
            }

            let release = release_rx.borrow_and_update().clone();
            tokio::select! {
                () = self.reconcile(release.as_ref(), &mut cache) => {}
                () = wait_stopped(&mut stop_rx) => break,
            }
        }

        debug!(application_id = %application_id, "reconcile loop stopped");
    }

    fn filter(&self) -> LabelFilter {
        LabelFilter::default().with_value(APPLICATION_LABEL, self.context.application_id.as_str())
    }

    async fn reconcile(&self, release: Option<&Release>, cache: &mut ReportCache) {
        let Some(release) = release else {
            self.remove_all().await;
            return;
        };
        cache.retain_services(release);

        let mut admitted: BTreeMap<&str, &Service> = BTreeMap::new();
        for (name, service) in &release.config {
            match validate_service(&self.context.validators, service).await {
                Ok(()) => {
                    admitted.insert(name.as_str(), service);
                }
                Err(rejection) => {
                    info!(
                        application_id = %self.context.application_id,
                        service = %name,
                        validator = %rejection.validator,
                        "service rejected"
                    );
                    self.report_state(cache, name, ServiceState::Rejected, rejection.to_string())
                        .await;
                }
            }
        }

        let instances = match self.context.engine.list_containers(&self.filter(), true).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(
                    application_id = %self.context.application_id,
                    error = %e,
                    "failed to list application containers"
                );
                return;
            }
        };

        let mut current: HashMap<&str, &Instance> = HashMap::new();
        for instance in &instances {
            let service = instance.label(SERVICE_LABEL);
            let keep = service.filter(|name| {
                admitted.contains_key(name)
                    && instance.label(RELEASE_LABEL) == Some(release.id.as_str())
                    && !current.contains_key(name)
            });

            match keep {
                Some(name) => {
                    current.insert(name, instance);
                }
                None => {
                    if let Some(name) = service.filter(|name| release.config.contains_key(*name)) {
                        self.report_state(
                            cache,
                            name,
                            ServiceState::StoppingPreviousContainer,
                            String::new(),
                        )
                        .await;
                    }
                    self.retire(instance).await;
                }
            }
        }

        let mut all_running = true;
        for (name, service) in &admitted {
            let running = match current.get(name) {
                Some(instance) if instance.running => true,
                Some(instance) => self.restart(cache, name, instance).await,
                None => self.deploy(cache, release, name, service).await,
            };
            if running {
                self.report_state(cache, name, ServiceState::Running, String::new())
                    .await;
            }
            all_running &= running;
        }

        if all_running {
            self.report_release(cache, release, admitted.keys().copied())
                .await;
        }
    }

    async fn restart(&self, cache: &mut ReportCache, name: &str, instance: &Instance) -> bool {
        match self.context.engine.start_container(&instance.id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    application_id = %self.context.application_id,
                    service = name,
                    container_id = %instance.id,
                    error = %e,
                    "failed to restart container"
                );
                self.report_state(cache, name, ServiceState::Exited, e.to_string())
                    .await;
                false
            }
        }
    }

    async fn deploy(
        &self,
        cache: &mut ReportCache,
        release: &Release,
        name: &str,
        service: &Service,
    ) -> bool {
        let engine = &self.context.engine;
        let application_id = self.context.application_id.as_str();

        self.report_state(cache, name, ServiceState::PullingImage, String::new())
            .await;
        let registry_auth = self.context.variables.registry_auth().await;
        if let Err(e) = engine.pull_image(&service.image, &registry_auth).await {
            warn!(application_id, service = name, image = %service.image, error = %e, "image pull failed");
            self.report_state(cache, name, ServiceState::PullingImage, e.to_string())
                .await;
            return false;
        }

        self.report_state(cache, name, ServiceState::CreatingContainer, String::new())
            .await;
        let spec = ContainerSpec::from_service(
            service,
            [
                (APPLICATION_LABEL.to_owned(), application_id.to_owned()),
                (SERVICE_LABEL.to_owned(), name.to_owned()),
                (RELEASE_LABEL.to_owned(), release.id.clone()),
            ],
        );
        let container_name = container_name(application_id, name, &release.id);
        let started = match engine.create_container(&container_name, &spec).await {
            Ok(id) => engine.start_container(&id).await,
            Err(e) => Err(e),
        };

        match started {
            Ok(()) => {
                info!(application_id, service = name, release_id = %release.id, "service started");
                true
            }
            Err(e) => {
                warn!(application_id, service = name, error = %e, "failed to start service");
                self.report_state(cache, name, ServiceState::CreatingContainer, e.to_string())
                    .await;
                false
            }
        }
    }

    /// Report service statuses and the application release, once per release.
    async fn report_release<'a>(
        &self,
        cache: &mut ReportCache,
        release: &Release,
        services: impl Iterator<Item = &'a str>,
    ) {
        let reporter = &self.context.reporter;
        let mut delivered = true;

        for name in services {
            if cache.statuses.get(name) == Some(&release.id) {
                continue;
            }
            let request = SetDeviceServiceStatusRequest {
                current_release_id: release.id.clone(),
            };
            match reporter.service_status(name, &request).await {
                Ok(()) => {
                    cache.statuses.insert(name.to_owned(), release.id.clone());
                }
                Err(e) => {
                    warn!(application_id = %reporter.application_id(), service = name, error = %e, "service status report failed");
                    delivered = false;
                }
            }
        }

        if !delivered || cache.release.as_deref() == Some(release.id.as_str()) {
            return;
        }
        match reporter.application_status(&release.id).await {
            Ok(()) => cache.release = Some(release.id.clone()),
            Err(e) => warn!(
                application_id = %reporter.application_id(),
                error = %e,
                "application status report failed"
            ),
        }
    }

    async fn report_state(
        &self,
        cache: &mut ReportCache,
        service: &str,
        state: ServiceState,
        error_message: String,
    ) {
        let request = SetDeviceServiceStateRequest {
            state,
            error_message,
        };
        if cache.states.get(service) == Some(&request) {
            return;
        }
        match self.context.reporter.service_state(service, &request).await {
            Ok(()) => {
                cache.states.insert(service.to_owned(), request);
            }
            Err(e) => warn!(
                application_id = %self.context.application_id,
                service,
                error = %e,
                "service state report failed"
            ),
        }
    }

    /// Stop then remove one container, logging failures.
    async fn retire(&self, instance: &Instance) {
        let engine = &self.context.engine;
        if let Err(e) = engine.stop_container(&instance.id).await {
            warn!(container_id = %instance.id, error = %e, "failed to stop container");
        }
        match engine.remove_container(&instance.id).await {
            Ok(()) => debug!(container_id = %instance.id, "container removed"),
            Err(e) => warn!(container_id = %instance.id, error = %e, "failed to remove container"),
        }
    }

    async fn remove_all(&self) {
        match self.context.engine.list_containers(&self.filter(), true).await {
            Ok(instances) => {
                for instance in &instances {
                    self.retire(instance).await;
                }
            }
            Err(e) => warn!(
                application_id = %self.context.application_id,
                error = %e,
                "failed to list application containers"
            ),
        }
    }
}

/// Docker container name for one service of one release.
fn container_name(application_id: &str, service: &str, release_id: &str) -> String {
    format!("{application_id}_{service}_{release_id}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
