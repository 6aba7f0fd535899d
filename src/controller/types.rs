//! Shared controller types: error taxonomy, context and resource keys.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::reflector::{Lookup, ObjectRef, Store};
use kube::{Client, Resource};
use thiserror::Error;

use crate::config::SweeperConfig;
use crate::controller::queue::WorkQueue;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("caches failed to sync: {0}")]
    CacheSync(String),

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state handed to every sync handler.
///
/// The stores are read-only mirrors of cluster state, written exclusively by
/// the watch pumps. Handlers must clone an object before mutating it for a
/// write call.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<SweeperConfig>,
    pub pods: Store<Pod>,
    pub claims: Store<PersistentVolumeClaim>,
    pub statefulsets: Store<StatefulSet>,
    pub pod_queue: Arc<WorkQueue>,
    pub claim_queue: Arc<WorkQueue>,
    pub set_queue: Arc<WorkQueue>,
}

/// Namespace/name identifier routed through the work queues.
///
/// Each queue is monomorphic to one resource kind, so the key itself does not
/// carry type information.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Extracts the key from object metadata. Returns `None` for objects
    /// without a namespace or name, which are not routable.
    pub fn from_object<K: Resource>(object: &K) -> Option<Self> {
        let meta = object.meta();
        Some(Self {
            namespace: meta.namespace.clone()?,
            name: meta.name.clone()?,
        })
    }

    /// Store lookup reference for this key.
    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Lookup,
        K::DynamicType: Default,
    {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
