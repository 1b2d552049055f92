use crate::event_router::EventRouter;
use crate::workload::{ResourceKind, Workload, WorkloadSnapshot};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::api::PostParams;
use kube::runtime::reflector::{ObjectRef, Store, store::Writer};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static KUBE_IMAGE_MIRROR_FIELD_MANAGER: &str = "kube-image-mirror";

/// Read side of the cluster: an eventually consistent, already synced cache.
pub trait WorkloadCache: Send + Sync {
    fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<WorkloadSnapshot>;
}

#[derive(Debug)]
pub enum UpdateError {
    /// The object changed since it was read.
    Conflict(anyhow::Error),
    Other(anyhow::Error),
}

impl std::error::Error for UpdateError {}
impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::Conflict(e) => write!(f, "conflict: {:#}", e),
            UpdateError::Other(e) => write!(f, "{:#}", e),
        }
    }
}

/// Write side of the cluster.
pub trait WorkloadApi: Send + Sync {
    fn update(
        &self,
        workload: &WorkloadSnapshot,
    ) -> impl Future<Output = Result<(), UpdateError>> + Send;
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Cache backed by the reflector stores of both watched kinds.
#[derive(Clone)]
pub struct ReflectorCache {
    pub deployments: Store<Deployment>,
    pub daemon_sets: Store<DaemonSet>,
}

fn lookup<W: Workload>(store: &Store<W>, namespace: &str, name: &str) -> Option<W> {
    store
        .get(&ObjectRef::new(name).within(namespace))
        .map(|obj| obj.as_ref().clone())
}

impl WorkloadCache for ReflectorCache {
    fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<WorkloadSnapshot> {
        match kind {
            ResourceKind::Deployment => lookup(&self.deployments, namespace, name).map(Into::into),
            ResourceKind::DaemonSet => lookup(&self.daemon_sets, namespace, name).map(Into::into),
        }
    }
}

pub struct KubeWorkloadApi {
    client: Client,
    timeout: Duration,
}

impl KubeWorkloadApi {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn replace<W: Workload>(&self, workload: &W) -> Result<(), UpdateError> {
        let namespace = workload.namespace().unwrap_or_default();
        let name = workload.name_any();
        let api: Api<W> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(KUBE_IMAGE_MIRROR_FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        match tokio::time::timeout(self.timeout, api.replace(&name, &params, workload)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(kube::Error::Api(response))) if response.code == 409 => {
                Err(UpdateError::Conflict(anyhow::anyhow!(
                    "{} {}/{} was modified concurrently: {}",
                    W::KIND,
                    namespace,
                    name,
                    response.message
                )))
            }
            Ok(Err(e)) => Err(UpdateError::Other(anyhow::Error::new(e).context(format!(
                "Failed to update {} {}/{}",
                W::KIND,
                namespace,
                name
            )))),
            Err(_) => Err(UpdateError::Other(anyhow::anyhow!(
                "Timed out after {:?} updating {} {}/{}",
                self.timeout,
                W::KIND,
                namespace,
                name
            ))),
        }
    }
}

impl WorkloadApi for KubeWorkloadApi {
    async fn update(&self, workload: &WorkloadSnapshot) -> Result<(), UpdateError> {
        debug!(
            "Replacing {} {}/{}",
            workload.kind(),
            workload.namespace(),
            workload.name()
        );
        match workload {
            WorkloadSnapshot::Deployment(d) => self.replace(d).await,
            WorkloadSnapshot::DaemonSet(d) => self.replace(d).await,
        }
    }
}

/// Watches every object of one kind cluster-wide, keeps the reflector store
/// current and notifies the router. Runs until `shutdown` fires.
///
/// Objects seen during a (re)list only become visible in the store once the
/// list completes, so their notifications are held back until then.
pub async fn run_watch<W: Workload>(
    client: Client,
    mut writer: Writer<W>,
    router: EventRouter,
    shutdown: CancellationToken,
) {
    let reader = writer.as_reader();
    let api: Api<W> = Api::all(client);
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);
    let mut pending: Vec<(Option<Arc<W>>, W)> = Vec::new();

    info!("Starting watch for {} objects", W::KIND);
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!("Watch error for {} objects: {}", W::KIND, e);
                continue;
            }
            None => break,
        };

        match &event {
            watcher::Event::Apply(obj) => {
                let previous = reader.get(&ObjectRef::from_obj(obj));
                writer.apply_watcher_event(&event);
                notify(&router, previous, obj);
            }
            watcher::Event::InitApply(obj) => {
                let previous = reader.get(&ObjectRef::from_obj(obj));
                pending.push((previous, obj.clone()));
                writer.apply_watcher_event(&event);
            }
            watcher::Event::InitDone => {
                writer.apply_watcher_event(&event);
                info!("Listed {} {} objects", reader.state().len(), W::KIND);
                for (previous, obj) in pending.drain(..) {
                    notify(&router, previous, &obj);
                }
            }
            watcher::Event::Init | watcher::Event::Delete(_) => {
                writer.apply_watcher_event(&event);
            }
        }
    }
    info!("Stopped watch for {} objects", W::KIND);
}

fn notify<W: Workload>(router: &EventRouter, previous: Option<Arc<W>>, obj: &W) {
    match previous {
        Some(old) => router.on_update(old.as_ref(), obj),
        None => router.on_add(obj),
    }
}
