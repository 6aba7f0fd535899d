//! The reconciliation engine.
//!
//! Three watch pumps mirror Pods, PersistentVolumeClaims and StatefulSets
//! into reflector stores and route every touched object's key into the
//! matching work queue. Three workers drain the queues through the sync
//! handlers. Workers only start once all caches have seen a full initial
//! list, so no decision is ever made against an empty cache.

mod actions;
mod claim;
mod ownership;
mod pod;
pub mod queue;
mod statefulset;
#[cfg(test)]
mod testutil;
pub mod types;

pub use queue::WorkQueue;
pub use types::{Context, Error, ObjectKey, Result};

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Future, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::SweeperConfig;

/// Label recording the StatefulSet a claim is managed by.
pub const MANAGED_BY_LABEL: &str = "statefulset.volume-sweeper.io/managed-by";

const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Runs the controller until the shutdown future resolves.
///
/// `ready` flips to `true` once all caches are synced and the workers are
/// consuming; it feeds the readiness endpoint. A cache sync timeout, or a
/// pump or worker task ending outside shutdown, is fatal and returned as an
/// error.
pub async fn run(
    client: Client,
    config: Arc<SweeperConfig>,
    ready: watch::Sender<bool>,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<()> {
    info!(
        namespace = config.namespace.as_deref().unwrap_or("(all)"),
        selector = %config.selector,
        dry_run = config.dry_run,
        "starting controller"
    );

    let (pods, pod_writer) = reflector::store();
    let (claims, claim_writer) = reflector::store();
    let (statefulsets, set_writer) = reflector::store();

    let ctx = Arc::new(Context {
        client: client.clone(),
        config: config.clone(),
        pods,
        claims,
        statefulsets,
        pod_queue: Arc::new(WorkQueue::new("pod")),
        claim_queue: Arc::new(WorkQueue::new("claim")),
        set_queue: Arc::new(WorkQueue::new("statefulset")),
    });

    let namespace = config.namespace.as_deref();
    let mut pumps = JoinSet::new();
    pumps.spawn(watch_pump(
        scoped_api::<Pod>(&client, namespace),
        pod_writer,
        ctx.pod_queue.clone(),
    ));
    pumps.spawn(watch_pump(
        scoped_api::<PersistentVolumeClaim>(&client, namespace),
        claim_writer,
        ctx.claim_queue.clone(),
    ));
    pumps.spawn(watch_pump(
        scoped_api::<StatefulSet>(&client, namespace),
        set_writer,
        ctx.set_queue.clone(),
    ));

    // Workers must not make decisions against a half-filled cache.
    let mut shutdown = pin!(shutdown);
    let synced = timeout(config.cache_sync_timeout, wait_for_cache_sync(&ctx));
    tokio::select! {
        () = &mut shutdown => {
            info!("shutdown requested before caches synced, aborting startup");
            shutdown_queues(&ctx).await;
            pumps.shutdown().await;
            return Ok(());
        }
        joined = pumps.join_next() => {
            let err = early_exit("watch pump", joined);
            shutdown_queues(&ctx).await;
            pumps.shutdown().await;
            return Err(err);
        }
        result = synced => match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                shutdown_queues(&ctx).await;
                pumps.shutdown().await;
                return Err(err);
            }
            Err(_) => {
                shutdown_queues(&ctx).await;
                pumps.shutdown().await;
                return Err(Error::CacheSync(format!(
                    "timed out after {:?}",
                    config.cache_sync_timeout
                )));
            }
        }
    }

    let _ = ready.send(true);
    info!("caches synced, starting workers");

    let mut workers = JoinSet::new();
    workers.spawn(run_worker(ctx.clone(), ctx.pod_queue.clone(), |ctx, key| async move {
        pod::sync_pod(&ctx, &key).await
    }));
    workers.spawn(run_worker(ctx.clone(), ctx.claim_queue.clone(), |ctx, key| async move {
        claim::sync_claim(&ctx, &key).await
    }));
    workers.spawn(run_worker(ctx.clone(), ctx.set_queue.clone(), |ctx, key| async move {
        statefulset::sync_statefulset(&ctx, &key).await
    }));

    let failure = tokio::select! {
        () = &mut shutdown => {
            info!("stopping controller");
            None
        }
        err = supervise(&mut pumps, &mut workers) => Some(err),
    };

    shutdown_queues(&ctx).await;
    pumps.shutdown().await;
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "worker task failed to join");
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Resolves when any pump or worker task ends. Outside shutdown that leaves a
/// permanently stale cache mirror or an unconsumed queue, so the controller
/// must stop.
async fn supervise(pumps: &mut JoinSet<()>, workers: &mut JoinSet<()>) -> Error {
    tokio::select! {
        joined = pumps.join_next() => early_exit("watch pump", joined),
        joined = workers.join_next() => early_exit("worker", joined),
    }
}

fn early_exit(role: &str, joined: Option<Result<(), JoinError>>) -> Error {
    let reason = match joined {
        Some(Err(err)) => err.to_string(),
        _ => "task ended without being asked to".to_string(),
    };
    error!(task = role, reason = %reason, "controller task ended unexpectedly, shutting down");
    Error::TaskFailed(format!("{role}: {reason}"))
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Tails the watch stream for one resource kind, keeps its store mirror
/// current and routes every touched object's key into the queue. No
/// filtering happens here; the sync handlers re-read current state
/// themselves.
async fn watch_pump<K>(api: Api<K>, writer: Writer<K>, queue: Arc<WorkQueue>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut objects = pin!(reflector(writer, stream).touched_objects());

    while let Some(object) = objects.next().await {
        match object {
            Ok(object) => enqueue(&queue, &object).await,
            Err(err) => warn!(queue = queue.name(), error = %err, "watch stream error"),
        }
    }

    warn!(queue = queue.name(), "watch stream ended");
}

async fn enqueue<K: Resource>(queue: &WorkQueue, object: &K) {
    let Some(key) = ObjectKey::from_object(object) else {
        warn!(queue = queue.name(), "object without namespace or name, not enqueueing");
        return;
    };
    debug!(queue = queue.name(), key = %key, "enqueued for sync");
    queue.add(key).await;
}

async fn wait_for_cache_sync(ctx: &Context) -> Result<()> {
    ctx.pods
        .wait_until_ready()
        .await
        .map_err(|err| Error::CacheSync(format!("pod cache: {err}")))?;
    ctx.claims
        .wait_until_ready()
        .await
        .map_err(|err| Error::CacheSync(format!("claim cache: {err}")))?;
    ctx.statefulsets
        .wait_until_ready()
        .await
        .map_err(|err| Error::CacheSync(format!("statefulset cache: {err}")))?;
    Ok(())
}

/// Runs the `get → sync → done` loop for one queue. A failed sync is logged,
/// never fatal; with `requeue_on_error` the key is re-added after per-key
/// exponential backoff instead of waiting for the next watch event to touch
/// it.
async fn run_worker<F, Fut>(ctx: Arc<Context>, queue: Arc<WorkQueue>, sync: F)
where
    F: Fn(Arc<Context>, ObjectKey) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    let mut failures: HashMap<ObjectKey, u32> = HashMap::new();

    while let Some(key) = queue.get().await {
        match sync(ctx.clone(), key.clone()).await {
            Ok(()) => {
                failures.remove(&key);
            }
            Err(err) => {
                error!(queue = queue.name(), key = %key, error = %err, "sync failed");
                if ctx.config.requeue_on_error {
                    let attempt = {
                        let entry = failures.entry(key.clone()).or_insert(0);
                        *entry = entry.saturating_add(1);
                        *entry
                    };
                    let delay = retry_delay(attempt);
                    debug!(queue = queue.name(), key = %key, attempt, ?delay, "scheduling retry");

                    let retry_queue = queue.clone();
                    let retry_key = key.clone();
                    tokio::spawn(async move {
                        sleep(delay).await;
                        retry_queue.add(retry_key).await;
                    });
                }
            }
        }
        queue.done(&key).await;
    }

    debug!(queue = queue.name(), "worker stopped");
}

fn retry_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    RETRY_BASE_DELAY
        .saturating_mul(1u32 << exponent)
        .min(RETRY_MAX_DELAY)
}

async fn shutdown_queues(ctx: &Context) {
    ctx.pod_queue.shutdown().await;
    ctx.claim_queue.shutdown().await;
    ctx.set_queue.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testutil::{canned_client, context};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker_context(config: SweeperConfig) -> Arc<Context> {
        Arc::new(context(
            canned_client(200, String::new(), Arc::new(AtomicUsize::new(0))),
            config,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        ))
    }

    #[test]
    fn retry_delay_grows_and_saturates() {
        assert_eq!(retry_delay(1), RETRY_BASE_DELAY);
        assert_eq!(retry_delay(2), RETRY_BASE_DELAY * 2);
        assert_eq!(retry_delay(3), RETRY_BASE_DELAY * 4);
        assert_eq!(retry_delay(20), RETRY_MAX_DELAY);
        assert_eq!(retry_delay(u32::MAX), RETRY_MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sync_is_retried_until_it_succeeds() {
        let ctx = worker_context(SweeperConfig::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        ctx.pod_queue.add(ObjectKey::new("ns", "p1")).await;

        let worker = tokio::spawn(run_worker(ctx.clone(), ctx.pod_queue.clone(), {
            let attempts = attempts.clone();
            move |ctx, _key| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::TaskFailed("induced failure".to_string()))
                    } else {
                        ctx.pod_queue.shutdown().await;
                        Ok(())
                    }
                }
            }
        }));

        worker.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_requeue_leaves_a_failed_key_out_of_the_queue() {
        let config = SweeperConfig {
            requeue_on_error: false,
            ..Default::default()
        };
        let ctx = worker_context(config);
        let attempts = Arc::new(AtomicUsize::new(0));
        ctx.pod_queue.add(ObjectKey::new("ns", "p1")).await;

        let worker = tokio::spawn(run_worker(ctx.clone(), ctx.pod_queue.clone(), {
            let attempts = attempts.clone();
            move |_ctx, _key| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(Error::TaskFailed("induced failure".to_string()))
                }
            }
        }));

        // A scheduled retry would have fired well within this window.
        sleep(RETRY_MAX_DELAY * 2).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.pod_queue.len().await, 0);

        ctx.pod_queue.shutdown().await;
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_starts_over_after_a_successful_sync() {
        let ctx = worker_context(SweeperConfig::default());
        let calls: Arc<std::sync::Mutex<Vec<tokio::time::Instant>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        ctx.pod_queue.add(ObjectKey::new("ns", "p1")).await;

        let worker = tokio::spawn(run_worker(ctx.clone(), ctx.pod_queue.clone(), {
            let calls = calls.clone();
            move |ctx, key| {
                let calls = calls.clone();
                async move {
                    let attempt = {
                        let mut calls = calls.lock().unwrap();
                        calls.push(tokio::time::Instant::now());
                        calls.len()
                    };
                    match attempt {
                        1 | 2 | 4 => Err(Error::TaskFailed("induced failure".to_string())),
                        3 => {
                            // Touch the key again so the next failure starts a
                            // fresh series.
                            ctx.pod_queue.add(key).await;
                            Ok(())
                        }
                        _ => {
                            ctx.pod_queue.shutdown().await;
                            Ok(())
                        }
                    }
                }
            }
        }));

        worker.await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[1] - calls[0], RETRY_BASE_DELAY);
        assert_eq!(calls[2] - calls[1], RETRY_BASE_DELAY * 2);
        // The success on the third attempt cleared the counter.
        assert_eq!(calls[4] - calls[3], RETRY_BASE_DELAY);
    }

    #[tokio::test]
    async fn supervision_flags_a_panicked_worker() {
        let mut pumps = JoinSet::new();
        pumps.spawn(std::future::pending::<()>());
        let mut workers = JoinSet::new();
        workers.spawn(async { panic!("induced panic") });

        let err = supervise(&mut pumps, &mut workers).await;
        assert!(matches!(err, Error::TaskFailed(_)));
        assert!(err.to_string().contains("worker"));
        pumps.shutdown().await;
    }

    #[tokio::test]
    async fn supervision_flags_a_pump_that_ended() {
        let mut pumps = JoinSet::new();
        pumps.spawn(async {});
        let mut workers = JoinSet::new();
        workers.spawn(std::future::pending::<()>());

        let err = supervise(&mut pumps, &mut workers).await;
        assert!(err.to_string().contains("watch pump"));
        workers.shutdown().await;
    }
}
