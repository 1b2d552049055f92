use crate::cluster::{self, KubeWorkloadApi, ReflectorCache, WorkloadApi, WorkloadCache};
use crate::config::Config;
use crate::event_router::EventRouter;
use crate::mirror::Mirrorer;
use crate::oci_registry::{self, RegistryClient};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::state::HealthState;
use crate::workqueue::WorkQueue;
use anyhow::Context;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::runtime::reflector;
use std::time::Duration;
use tokio::time::timeout;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Drains the work queue with a single worker.
pub struct Controller<C, A, R> {
    queue: WorkQueue,
    reconciler: Reconciler<C, A, R>,
}

impl<C, A, R> Controller<C, A, R>
where
    C: WorkloadCache,
    A: WorkloadApi,
    R: RegistryClient,
{
    pub fn new(queue: WorkQueue, reconciler: Reconciler<C, A, R>) -> Self {
        Self { queue, reconciler }
    }

    /// Processes keys until the queue is shut down.
    pub async fn run_worker(&self) {
        info!("Starting worker");
        while self.process_next_item().await {}
        info!("Worker stopped");
    }

    /// Runs one reconcile pass. Returns `false` once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.reconciler.reconcile(&key).await {
            Ok(ReconcileOutcome::Skipped(reason)) => {
                info!("Skipping {}: {}", key, reason);
                self.queue.forget(&key);
            }
            Ok(ReconcileOutcome::Updated { container, image }) => {
                info!(
                    "Updated image of container {} in {} to {}",
                    container, key, image
                );
                self.queue.forget(&key);
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Error reconciling {} (attempt {}): {}, adding it again to the work queue",
                    key,
                    self.queue.num_requeues(&key) + 1,
                    e
                );
                self.queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!("Dropping {} from the work queue: {}", key, e);
                self.queue.forget(&key);
            }
        }

        self.queue.done(&key);
        true
    }
}

/// Blocks until both reflector stores hold a complete initial list.
/// Returns `Ok(false)` when shutdown is requested first.
async fn wait_for_cache_sync(
    cache: &ReflectorCache,
    sync_timeout: Duration,
    shutdown: &CancellationToken,
) -> anyhow::Result<bool> {
    info!("Waiting up to {:?} for caches to sync", sync_timeout);
    let sync = async {
        cache
            .deployments
            .wait_until_ready()
            .await
            .map_err(|_| anyhow::anyhow!("Deployment cache writer dropped before sync"))?;
        cache
            .daemon_sets
            .wait_until_ready()
            .await
            .map_err(|_| anyhow::anyhow!("DaemonSet cache writer dropped before sync"))?;
        anyhow::Ok(())
    };

    tokio::select! {
        _ = shutdown.cancelled() => Ok(false),
        result = timeout(sync_timeout, sync) => {
            result.context("Timed out waiting for caches to sync")??;
            Ok(true)
        }
    }
}

async fn create_resync_scheduler(
    schedule: &str,
    router: EventRouter,
    cache: ReflectorCache,
) -> anyhow::Result<JobScheduler> {
    info!("Resyncing cached workloads at cron schedule {}", schedule);
    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async(schedule.to_string(), move |_uuid, _l| {
        let router = router.clone();
        let cache = cache.clone();
        Box::pin(async move {
            router.resync(&cache.deployments);
            router.resync(&cache.daemon_sets);
        })
    })
    .with_context(|| format!("Invalid resync schedule {}", schedule))?;
    scheduler.add(job).await?;
    Ok(scheduler)
}

/// Wires the cluster watches, queue, reconciler and worker together and runs
/// until `shutdown` fires.
pub async fn run(
    config: Config,
    health: HealthState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let client = cluster::create_client().await?;
    let registry = oci_registry::create_client(&config)?;
    let namespaces = config.namespace_filter()?;

    let queue = WorkQueue::new(config.backoff());
    let router = EventRouter::new(queue.clone(), namespaces.clone());

    let (deployments, deployment_writer) = reflector::store::<Deployment>();
    let (daemon_sets, daemon_set_writer) = reflector::store::<DaemonSet>();
    let cache = ReflectorCache {
        deployments,
        daemon_sets,
    };

    let watches = [
        tokio::spawn(cluster::run_watch(
            client.clone(),
            deployment_writer,
            router.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(cluster::run_watch(
            client.clone(),
            daemon_set_writer,
            router.clone(),
            shutdown.clone(),
        )),
    ];

    let synced = wait_for_cache_sync(&cache, config.cache_sync_timeout(), &shutdown).await?;
    if !synced {
        info!("Shutdown requested before caches synced");
        return Ok(());
    }
    info!("Caches synced, {} keys queued", queue.len());
    health.mark_ready();

    let mut scheduler =
        create_resync_scheduler(&config.resync_schedule, router, cache.clone()).await?;
    scheduler.start().await?;

    let mirrorer = Mirrorer::new(registry, &config.destination_repository, &config.registry);
    info!("Mirroring images into {}", mirrorer.destination_prefix());
    let reconciler = Reconciler::new(
        cache,
        KubeWorkloadApi::new(client, UPDATE_TIMEOUT),
        mirrorer,
        namespaces,
    );
    let controller = Controller::new(queue.clone(), reconciler);

    let stop_queue = {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("Shutting down work queue");
            queue.shut_down();
        })
    };

    controller.run_worker().await;

    if let Err(e) = scheduler.shutdown().await {
        warn!("Failed to stop resync scheduler: {}", e);
    }
    for watch in watches {
        if let Err(e) = watch.await {
            warn!("Watch task ended abnormally: {}", e);
        }
    }
    stop_queue.abort();
    Ok(())
}
