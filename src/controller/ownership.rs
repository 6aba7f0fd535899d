//! Ownership resolution: read-only queries over the cache mirrors that walk
//! Pod → PersistentVolumeClaim and Pod → StatefulSet relationships.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::warn;

use crate::controller::MANAGED_BY_LABEL;
use crate::selector::Selector;

/// The managed-by label value recorded on a claim, if any.
pub(crate) fn managed_by(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .metadata
        .labels
        .as_ref()?
        .get(MANAGED_BY_LABEL)
        .map(String::as_str)
}

pub(crate) fn matches_selector(set: &StatefulSet, selector: &Selector) -> bool {
    match set.metadata.labels.as_ref() {
        Some(labels) => selector.matches(labels),
        None => selector.matches(&std::collections::BTreeMap::new()),
    }
}

/// Whether one of the pod's volumes binds the named claim.
pub(crate) fn pod_references_claim(pod: &Pod, claim_name: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| {
            volumes.iter().any(|volume| {
                volume
                    .persistent_volume_claim
                    .as_ref()
                    .is_some_and(|source| source.claim_name == claim_name)
            })
        })
}

/// Finds the pod mounting a claim by scanning cached pods in the claim's
/// namespace. The cluster guarantees at most one such pod in practice.
pub(crate) fn pod_mounting_claim(
    pods: &Store<Pod>,
    claim: &PersistentVolumeClaim,
) -> Option<Arc<Pod>> {
    let namespace = claim.namespace()?;
    let claim_name = claim.name_any();
    pods.state().into_iter().find(|pod| {
        pod.namespace().as_deref() == Some(namespace.as_str())
            && pod_references_claim(pod, &claim_name)
    })
}

/// Claims referenced by the pod's volume bindings. Bindings to claims not yet
/// visible in the cache are skipped.
pub(crate) fn claims_for_pod(
    claims: &Store<PersistentVolumeClaim>,
    pod: &Pod,
) -> Vec<Arc<PersistentVolumeClaim>> {
    let Some(namespace) = pod.namespace() else {
        return Vec::new();
    };
    let Some(volumes) = pod.spec.as_ref().and_then(|spec| spec.volumes.as_ref()) else {
        return Vec::new();
    };

    volumes
        .iter()
        .filter_map(|volume| volume.persistent_volume_claim.as_ref())
        .filter_map(|source| claims.get(&ObjectRef::new(&source.claim_name).within(&namespace)))
        .collect()
}

pub(crate) fn claims_in_namespace(
    claims: &Store<PersistentVolumeClaim>,
    namespace: &str,
) -> Vec<Arc<PersistentVolumeClaim>> {
    claims
        .state()
        .into_iter()
        .filter(|claim| claim.namespace().as_deref() == Some(namespace))
        .collect()
}

/// Claims in the namespace whose managed-by label names the given StatefulSet.
pub(crate) fn claims_managed_by(
    claims: &Store<PersistentVolumeClaim>,
    namespace: &str,
    set_name: &str,
) -> Vec<Arc<PersistentVolumeClaim>> {
    claims_in_namespace(claims, namespace)
        .into_iter()
        .filter(|claim| managed_by(claim) == Some(set_name))
        .collect()
}

/// The pod's controlling owner reference, if any.
pub(crate) fn controller_of(pod: &Pod) -> Option<&OwnerReference> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|reference| reference.controller == Some(true))
}

fn is_statefulset_owner(reference: &OwnerReference) -> bool {
    reference.kind == "StatefulSet" && reference.api_version == "apps/v1"
}

/// Whether the StatefulSet is the pod's controller. Compares UIDs, so a
/// recreated StatefulSet with the same name does not count.
pub(crate) fn is_controlled_by(pod: &Pod, set: &StatefulSet) -> bool {
    controller_of(pod)
        .is_some_and(|owner| set.uid().as_deref() == Some(owner.uid.as_str()))
}

/// Resolves the StatefulSet controlling a pod. A dangling owner reference
/// (the named set is gone, or its UID no longer matches) is a valid terminal
/// state and resolves to `None`.
pub(crate) fn statefulset_for_pod(
    sets: &Store<StatefulSet>,
    pod: &Pod,
) -> Option<Arc<StatefulSet>> {
    let owner = controller_of(pod).filter(|owner| is_statefulset_owner(owner))?;
    let namespace = pod.namespace()?;

    let Some(set) = sets.get(&ObjectRef::new(&owner.name).within(&namespace)) else {
        warn!(
            namespace = %namespace,
            pod = %pod.name_any(),
            statefulset = %owner.name,
            "pod owner reference points to a statefulset that is not in the cache"
        );
        return None;
    };

    is_controlled_by(pod, &set).then_some(set)
}

/// Pods in the StatefulSet's namespace that it controls.
pub(crate) fn pods_for_statefulset(pods: &Store<Pod>, set: &StatefulSet) -> Vec<Arc<Pod>> {
    let Some(namespace) = set.namespace() else {
        return Vec::new();
    };
    pods.state()
        .into_iter()
        .filter(|pod| {
            pod.namespace().as_deref() == Some(namespace.as_str()) && is_controlled_by(pod, set)
        })
        .collect()
}
