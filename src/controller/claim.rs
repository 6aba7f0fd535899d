//! PersistentVolumeClaim sync handler.
//!
//! This is the decision core: for one claim key it derives the required
//! corrective action from current cache state and hands it to the executor.
//! Everything here is level-triggered; no event payload is trusted beyond the
//! key it produced.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::debug;

use crate::controller::actions::apply_claim_action;
use crate::controller::ownership;
use crate::controller::types::{Context, ObjectKey, Result};
use crate::selector::Selector;

/// Corrective action for a single claim. `decide_claim` computes it from the
/// caches only; applying it is the executor's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClaimAction {
    /// Claim already satisfies the invariant.
    Keep,
    /// Record the named StatefulSet as the claim's owner.
    SetLabel(String),
    /// Drop the managed-by label; the claim is no longer ours to track.
    RemoveLabel,
    /// The claim is orphaned and safe to delete.
    Delete,
}

pub(crate) async fn sync_claim(ctx: &Context, key: &ObjectKey) -> Result<()> {
    let Some(claim) = ctx.claims.get(&key.object_ref()) else {
        // Deletions are what we are after in the first place, nothing to do.
        debug!(claim = %key, "claim deleted");
        return Ok(());
    };

    if claim.metadata.deletion_timestamp.is_some() {
        debug!(claim = %key, "claim is pending deletion, not handling");
        return Ok(());
    }

    let action = decide_claim(&ctx.pods, &ctx.statefulsets, &ctx.config.selector, &claim);
    apply_claim_action(ctx, &claim, action).await
}

/// Derives the corrective action for a live claim.
///
/// Mounted claims track the StatefulSet controlling the mounting pod.
/// Unmounted claims are kept while their recorded StatefulSet exists in
/// scope, unlabeled ones are never touched, and a recorded StatefulSet that
/// no longer exists makes the claim an orphan.
pub(crate) fn decide_claim(
    pods: &Store<Pod>,
    statefulsets: &Store<StatefulSet>,
    selector: &Selector,
    claim: &PersistentVolumeClaim,
) -> ClaimAction {
    if let Some(pod) = ownership::pod_mounting_claim(pods, claim) {
        return decide_mounted(statefulsets, selector, claim, &pod);
    }

    debug!(
        claim = %claim.name_any(),
        "claim is not mounted to a pod, checking if it should be deleted"
    );

    let Some(set_name) = ownership::managed_by(claim) else {
        // An unmounted claim with no recorded owner is never a deletion
        // candidate.
        debug!(claim = %claim.name_any(), "claim carries no managed-by label, not a candidate");
        return ClaimAction::Keep;
    };

    let namespace = claim.namespace().unwrap_or_default();
    match statefulsets.get(&ObjectRef::new(set_name).within(&namespace)) {
        Some(set) if ownership::matches_selector(&set, selector) => {
            debug!(
                claim = %claim.name_any(),
                statefulset = %set_name,
                "managing statefulset still present, keeping claim"
            );
            ClaimAction::Keep
        }
        Some(_) => {
            debug!(
                claim = %claim.name_any(),
                statefulset = %set_name,
                "managing statefulset does not match the selector"
            );
            ClaimAction::RemoveLabel
        }
        None => ClaimAction::Delete,
    }
}

fn decide_mounted(
    statefulsets: &Store<StatefulSet>,
    selector: &Selector,
    claim: &PersistentVolumeClaim,
    pod: &Pod,
) -> ClaimAction {
    let Some(set) = ownership::statefulset_for_pod(statefulsets, pod) else {
        debug!(
            claim = %claim.name_any(),
            pod = %pod.name_any(),
            "mounting pod does not belong to a statefulset"
        );
        return remove_label_if_present(claim);
    };

    if !ownership::matches_selector(&set, selector) {
        debug!(
            claim = %claim.name_any(),
            statefulset = %set.name_any(),
            "controlling statefulset does not match the selector"
        );
        return remove_label_if_present(claim);
    }

    let set_name = set.name_any();
    if ownership::managed_by(claim) == Some(set_name.as_str()) {
        ClaimAction::Keep
    } else {
        ClaimAction::SetLabel(set_name)
    }
}

fn remove_label_if_present(claim: &PersistentVolumeClaim) -> ClaimAction {
    if ownership::managed_by(claim).is_some() {
        ClaimAction::RemoveLabel
    } else {
        ClaimAction::Keep
    }
}
