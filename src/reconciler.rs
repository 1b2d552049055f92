use crate::cluster::{UpdateError, WorkloadApi, WorkloadCache};
use crate::config::NamespaceFilter;
use crate::mirror::{MirrorError, Mirrorer};
use crate::oci_registry::RegistryClient;
use crate::readiness::is_ready;
use crate::workload::{KeyError, WorkItemKey};
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ExcludedNamespace,
    NotFound,
    AlreadyMirrored,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ExcludedNamespace => write!(f, "namespace is excluded"),
            SkipReason::NotFound => write!(f, "object no longer exists"),
            SkipReason::AlreadyMirrored => write!(f, "all images are already mirrored"),
        }
    }
}

/// Terminal result of one reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    Updated { container: String, image: String },
}

#[derive(Debug)]
pub enum ReconcileError {
    InvalidKey(KeyError),
    NotReady {
        key: WorkItemKey,
        desired: i32,
        ready: i32,
    },
    Mirror {
        key: WorkItemKey,
        container: String,
        source: MirrorError,
    },
    InvalidContainer {
        key: WorkItemKey,
        index: usize,
    },
    Conflict {
        key: WorkItemKey,
        source: anyhow::Error,
    },
    Update {
        key: WorkItemKey,
        source: anyhow::Error,
    },
}

impl ReconcileError {
    /// Whether the key should be requeued with backoff. Keys that cannot be
    /// parsed will never succeed and are dropped.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::InvalidKey(_))
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::InvalidKey(e) => Some(e),
            ReconcileError::Mirror { source, .. } => Some(source),
            ReconcileError::Conflict { source, .. } | ReconcileError::Update { source, .. } => {
                Some(&**source)
            }
            ReconcileError::NotReady { .. } | ReconcileError::InvalidContainer { .. } => None,
        }
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::InvalidKey(e) => write!(f, "{}", e),
            ReconcileError::NotReady {
                key,
                desired,
                ready,
            } => write!(
                f,
                "{} is not ready ({} of {} replicas ready)",
                key, ready, desired
            ),
            ReconcileError::Mirror {
                key,
                container,
                source,
            } => write!(
                f,
                "error mirroring image of container '{}' in {}: {}",
                container, key, source
            ),
            ReconcileError::InvalidContainer { key, index } => {
                write!(f, "{} has no container at index {}", key, index)
            }
            ReconcileError::Conflict { key, source } => {
                write!(f, "update of {} conflicted: {:#}", key, source)
            }
            ReconcileError::Update { key, source } => {
                write!(f, "error updating {}: {:#}", key, source)
            }
        }
    }
}

/// Reconciles one workload key per call.
///
/// Each pass mirrors at most one container: the first, in index order, whose
/// image is not in the destination repository yet. The update it issues comes
/// back as a watch notification and triggers the pass for the next container,
/// so a workload with N foreign images converges in N passes.
pub struct Reconciler<C, A, R> {
    cache: C,
    api: A,
    mirrorer: Mirrorer<R>,
    namespaces: NamespaceFilter,
}

impl<C, A, R> Reconciler<C, A, R>
where
    C: WorkloadCache,
    A: WorkloadApi,
    R: RegistryClient,
{
    pub fn new(cache: C, api: A, mirrorer: Mirrorer<R>, namespaces: NamespaceFilter) -> Self {
        Self {
            cache,
            api,
            mirrorer,
            namespaces,
        }
    }

    pub async fn reconcile(&self, raw_key: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let key: WorkItemKey = raw_key.parse().map_err(ReconcileError::InvalidKey)?;

        if self.namespaces.is_excluded(&key.namespace) {
            return Ok(ReconcileOutcome::Skipped(SkipReason::ExcludedNamespace));
        }

        let Some(workload) = self.cache.get(key.kind, &key.namespace, &key.name) else {
            info!("{} in work queue no longer exists", key);
            return Ok(ReconcileOutcome::Skipped(SkipReason::NotFound));
        };

        let (desired, ready) = workload.readiness();
        if !is_ready(desired, ready) {
            return Err(ReconcileError::NotReady {
                key,
                desired,
                ready,
            });
        }

        let Some(container) = workload
            .containers()
            .into_iter()
            .find(|c| !c.image.is_empty() && !self.mirrorer.is_already_mirrored(&c.image))
        else {
            return Ok(ReconcileOutcome::Skipped(SkipReason::AlreadyMirrored));
        };

        info!(
            "Processing image {} of container {} in {}",
            container.image, container.name, key
        );
        let image = self
            .mirrorer
            .ensure_mirrored(&container.image)
            .await
            .map_err(|source| ReconcileError::Mirror {
                key: key.clone(),
                container: container.name.clone(),
                source,
            })?;

        let updated = workload
            .with_container_image(container.index, &image)
            .ok_or_else(|| ReconcileError::InvalidContainer {
                key: key.clone(),
                index: container.index,
            })?;

        info!(
            "Updating image of container {} in {} to {}",
            container.name, key, image
        );
        self.api.update(&updated).await.map_err(|e| match e {
            UpdateError::Conflict(source) => ReconcileError::Conflict {
                key: key.clone(),
                source,
            },
            UpdateError::Other(source) => ReconcileError::Update {
                key: key.clone(),
                source,
            },
        })?;

        Ok(ReconcileOutcome::Updated {
            container: container.name,
            image,
        })
    }
}
