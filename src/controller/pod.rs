//! Pod sync handler: fans pod events out to the claims they may affect.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::reflector::Store;
use tracing::debug;

use crate::controller::ownership;
use crate::controller::types::{Context, ObjectKey, Result};

pub(crate) async fn sync_pod(ctx: &Context, key: &ObjectKey) -> Result<()> {
    let keys = match ctx.pods.get(&key.object_ref()) {
        Some(pod) => {
            if pod.metadata.deletion_timestamp.is_some() {
                // A pod can first be observed while already pending deletion,
                // e.g. after a controller restart. Wait for the actual
                // removal instead of acting on the transitional state.
                debug!(pod = %key, "pod is pending deletion, not handling");
                return Ok(());
            }
            claim_keys_for_live_pod(&ctx.claims, &pod)
        }
        None => {
            debug!(pod = %key, "pod deleted, re-checking claims in its namespace");
            claim_keys_for_deleted_pod(&ctx.claims, &key.namespace)
        }
    };

    for claim_key in keys {
        ctx.claim_queue.add(claim_key).await;
    }

    Ok(())
}

/// Keys of the claims referenced by the pod's volume bindings.
fn claim_keys_for_live_pod(claims: &Store<PersistentVolumeClaim>, pod: &Pod) -> Vec<ObjectKey> {
    ownership::claims_for_pod(claims, pod)
        .iter()
        .filter_map(|claim| ObjectKey::from_object(claim.as_ref()))
        .collect()
}

/// A deleted pod may have unmounted any claim in its namespace; re-checking
/// them all is cheaper than tracking the bindings of an object that no longer
/// exists.
fn claim_keys_for_deleted_pod(
    claims: &Store<PersistentVolumeClaim>,
    namespace: &str,
) -> Vec<ObjectKey> {
    ownership::claims_in_namespace(claims, namespace)
        .iter()
        .filter_map(|claim| ObjectKey::from_object(claim.as_ref()))
        .collect()
}
