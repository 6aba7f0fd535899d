//! Action executor: applies a decided claim mutation against the cluster.
//!
//! Mutations operate on a clone of the cached object; the shared cache entry
//! is never touched. Writes are unconditional overwrites of the label this
//! controller owns; a conflicting concurrent write surfaces as a regular
//! error and the claim is reconciled again.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, DeleteParams, PostParams};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::claim::ClaimAction;
use crate::controller::types::{Context, ObjectKey, Result};
use crate::controller::MANAGED_BY_LABEL;

pub(crate) async fn apply_claim_action(
    ctx: &Context,
    claim: &PersistentVolumeClaim,
    action: ClaimAction,
) -> Result<()> {
    match action {
        ClaimAction::Keep => Ok(()),
        ClaimAction::SetLabel(set_name) => set_managed_by_label(ctx, claim, &set_name).await,
        ClaimAction::RemoveLabel => remove_managed_by_label(ctx, claim).await,
        ClaimAction::Delete => delete_claim(ctx, claim).await,
    }
}

async fn set_managed_by_label(
    ctx: &Context,
    claim: &PersistentVolumeClaim,
    set_name: &str,
) -> Result<()> {
    let key = claim_key(claim);
    let mut updated = claim.clone();
    let previous = updated
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(MANAGED_BY_LABEL.to_string(), set_name.to_string());

    match previous.as_deref() {
        Some(old) if old == set_name => return Ok(()),
        Some(old) => info!(
            claim = %key,
            label = MANAGED_BY_LABEL,
            old_value = %old,
            new_value = %set_name,
            "updating managed-by label"
        ),
        None => info!(
            claim = %key,
            label = MANAGED_BY_LABEL,
            value = %set_name,
            "adding managed-by label"
        ),
    }

    replace_claim(ctx, &updated).await
}

async fn remove_managed_by_label(ctx: &Context, claim: &PersistentVolumeClaim) -> Result<()> {
    let mut updated = claim.clone();
    let removed = updated
        .metadata
        .labels
        .as_mut()
        .and_then(|labels| labels.remove(MANAGED_BY_LABEL));
    if removed.is_none() {
        return Ok(());
    }

    info!(
        claim = %claim_key(claim),
        label = MANAGED_BY_LABEL,
        "removing managed-by label"
    );

    replace_claim(ctx, &updated).await
}

async fn replace_claim(ctx: &Context, claim: &PersistentVolumeClaim) -> Result<()> {
    let key = claim_key(claim);
    let api: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &key.namespace);
    api.replace(&key.name, &PostParams::default(), claim).await?;
    Ok(())
}

async fn delete_claim(ctx: &Context, claim: &PersistentVolumeClaim) -> Result<()> {
    let key = claim_key(claim);

    if ctx.config.dry_run {
        info!(claim = %key, "would delete claim, but dry run is enabled");
        return Ok(());
    }

    info!(claim = %key, "deleting orphaned claim");

    let api: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &key.namespace);
    match api.delete(&key.name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        // Someone else got there first.
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!(claim = %key, "claim already deleted");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn claim_key(claim: &PersistentVolumeClaim) -> ObjectKey {
    ObjectKey::new(claim.namespace().unwrap_or_default(), claim.name_any())
}
