use chrono::Utc;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::PodSpec;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;

pub static MIRRORED_AT_ANNOTATION: &str = "kube-image-mirror/mirroredAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Deployment,
    DaemonSet,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployment",
            ResourceKind::DaemonSet => "daemonset",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue key of a workload, serialized as `<kind>/<namespace>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItemKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, PartialEq, Eq)]
pub struct KeyError(String);

impl std::error::Error for KeyError {}
impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid resource key: '{}'", self.0)
    }
}

impl WorkItemKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl FromStr for WorkItemKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let [kind, namespace, name] = parts.as_slice() else {
            return Err(KeyError(s.to_string()));
        };
        if namespace.is_empty() || name.is_empty() {
            return Err(KeyError(s.to_string()));
        }
        let kind = match *kind {
            "deployment" => ResourceKind::Deployment,
            "daemonset" => ResourceKind::DaemonSet,
            _ => return Err(KeyError(s.to_string())),
        };
        Ok(Self::new(kind, *namespace, *name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub index: usize,
}

/// Cluster resource kinds the controller watches.
pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static,
{
    const KIND: ResourceKind;

    fn pod_spec(&self) -> Option<&PodSpec>;
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;

    /// `(desired, ready)` replica counts, zero when the status is not reported yet.
    fn readiness(&self) -> (i32, i32);

    /// Queue key for this object. Objects without a namespace or name cannot be keyed.
    fn work_item_key(&self) -> Option<WorkItemKey> {
        let namespace = self.namespace()?;
        let name = self.meta().name.clone()?;
        Some(WorkItemKey::new(Self::KIND, namespace, name))
    }
}

impl Workload for Deployment {
    const KIND: ResourceKind = ResourceKind::Deployment;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/deployment-v1/#DeploymentStatus
    fn readiness(&self) -> (i32, i32) {
        self.status
            .as_ref()
            .map(|s| (s.replicas.unwrap_or(0), s.ready_replicas.unwrap_or(0)))
            .unwrap_or((0, 0))
    }
}

impl Workload for DaemonSet {
    const KIND: ResourceKind = ResourceKind::DaemonSet;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/daemon-set-v1/#DaemonSetStatus
    fn readiness(&self) -> (i32, i32) {
        self.status
            .as_ref()
            .map(|s| (s.desired_number_scheduled, s.number_ready))
            .unwrap_or((0, 0))
    }
}

/// A workload as read from the cache at reconcile time, dispatched once by kind.
#[derive(Debug, Clone)]
pub enum WorkloadSnapshot {
    Deployment(Deployment),
    DaemonSet(DaemonSet),
}

impl From<Deployment> for WorkloadSnapshot {
    fn from(deployment: Deployment) -> Self {
        WorkloadSnapshot::Deployment(deployment)
    }
}

impl From<DaemonSet> for WorkloadSnapshot {
    fn from(daemon_set: DaemonSet) -> Self {
        WorkloadSnapshot::DaemonSet(daemon_set)
    }
}

impl WorkloadSnapshot {
    pub fn kind(&self) -> ResourceKind {
        match self {
            WorkloadSnapshot::Deployment(_) => ResourceKind::Deployment,
            WorkloadSnapshot::DaemonSet(_) => ResourceKind::DaemonSet,
        }
    }

    pub fn namespace(&self) -> String {
        match self {
            WorkloadSnapshot::Deployment(d) => d.namespace(),
            WorkloadSnapshot::DaemonSet(d) => d.namespace(),
        }
        .unwrap_or_default()
    }

    pub fn name(&self) -> String {
        match self {
            WorkloadSnapshot::Deployment(d) => d.name_any(),
            WorkloadSnapshot::DaemonSet(d) => d.name_any(),
        }
    }

    pub fn readiness(&self) -> (i32, i32) {
        match self {
            WorkloadSnapshot::Deployment(d) => d.readiness(),
            WorkloadSnapshot::DaemonSet(d) => d.readiness(),
        }
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        match self {
            WorkloadSnapshot::Deployment(d) => d.pod_spec(),
            WorkloadSnapshot::DaemonSet(d) => d.pod_spec(),
        }
    }

    pub fn containers(&self) -> Vec<ContainerSpec> {
        self.pod_spec()
            .map(|spec| {
                spec.containers
                    .iter()
                    .enumerate()
                    .map(|(index, container)| ContainerSpec {
                        name: container.name.clone(),
                        image: container.image.clone().unwrap_or_default(),
                        index,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Builds the update object: the container at `index` gets `image`, siblings
    /// stay untouched, and the object is stamped with the mirror time.
    pub fn with_container_image(&self, index: usize, image: &str) -> Option<WorkloadSnapshot> {
        match self {
            WorkloadSnapshot::Deployment(d) => rewrite_image(d, index, image).map(Into::into),
            WorkloadSnapshot::DaemonSet(d) => rewrite_image(d, index, image).map(Into::into),
        }
    }
}

fn rewrite_image<W: Workload>(workload: &W, index: usize, image: &str) -> Option<W> {
    let mut updated = workload.clone();
    let container = updated.pod_spec_mut()?.containers.get_mut(index)?;
    container.image = Some(image.to_string());
    updated
        .annotations_mut()
        .insert(MIRRORED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339());
    Some(updated)
}
