//! StatefulSet sync handler.
//!
//! A live StatefulSet re-enqueues the pods it controls so their claims pick
//! up the label, e.g. for a backfill after a controller restart. A deleted
//! one re-enqueues the claims recorded as managed by it, which may now be
//! orphaned.

use k8s_openapi::api::apps::v1::StatefulSet;
use tracing::debug;

use crate::controller::ownership;
use crate::controller::types::{Context, ObjectKey, Result};

pub(crate) async fn sync_statefulset(ctx: &Context, key: &ObjectKey) -> Result<()> {
    match ctx.statefulsets.get(&key.object_ref()) {
        Some(set) => handle_update(ctx, &set).await,
        None => handle_deletion(ctx, key).await,
    }
}

async fn handle_update(ctx: &Context, set: &StatefulSet) -> Result<()> {
    for pod in ownership::pods_for_statefulset(&ctx.pods, set) {
        if let Some(pod_key) = ObjectKey::from_object(pod.as_ref()) {
            ctx.pod_queue.add(pod_key).await;
        }
    }
    Ok(())
}

async fn handle_deletion(ctx: &Context, key: &ObjectKey) -> Result<()> {
    debug!(statefulset = %key, "statefulset deleted, re-checking claims it managed");

    for claim in ownership::claims_managed_by(&ctx.claims, &key.namespace, &key.name) {
        if let Some(claim_key) = ObjectKey::from_object(claim.as_ref()) {
            ctx.claim_queue.add(claim_key).await;
        }
    }

    Ok(())
}
