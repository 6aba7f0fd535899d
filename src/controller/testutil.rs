//! Test fixtures shared by the controller test modules.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::client::Body;
use kube::runtime::reflector::{self, Lookup, Store};
use kube::runtime::watcher;
use kube::Client;

use crate::config::SweeperConfig;
use crate::controller::queue::WorkQueue;
use crate::controller::types::Context;
use crate::controller::MANAGED_BY_LABEL;

pub(crate) fn pod(
    namespace: &str,
    name: &str,
    claim_names: &[&str],
    owner: Option<(&str, &str)>,
) -> Pod {
    let volumes = claim_names
        .iter()
        .map(|claim_name| Volume {
            name: format!("vol-{claim_name}"),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: (*claim_name).to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let owner_references = owner.map(|(set_name, uid)| {
        vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            name: set_name.to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            ..Default::default()
        }]
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references,
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn claim(
    namespace: &str,
    name: &str,
    managed_by: Option<&str>,
) -> PersistentVolumeClaim {
    let labels = managed_by.map(|set_name| {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), set_name.to_string());
        labels
    });

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn statefulset(
    namespace: &str,
    name: &str,
    uid: &str,
    labels: &[(&str, &str)],
) -> StatefulSet {
    let labels = (!labels.is_empty()).then(|| {
        labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>()
    });

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            labels,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Builds a read-only store pre-populated with the given objects.
pub(crate) fn store_of<K>(objects: Vec<K>) -> Store<K>
where
    K: Lookup + Clone + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (store, mut writer) = reflector::store();
    for object in objects {
        writer.apply_watcher_event(&watcher::Event::Apply(object));
    }
    store
}

/// A client whose every request is answered with a canned response. The call
/// counter lets tests assert whether the API was reached at all.
pub(crate) fn canned_client(
    status: u16,
    body: String,
    calls: Arc<AtomicUsize>,
) -> Client {
    let service = tower::service_fn(move |_request: http::Request<Body>| {
        let calls = calls.clone();
        let body = body.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let response = http::Response::builder()
                .status(status)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.into_bytes()))
                .unwrap();
            Ok::<_, Infallible>(response)
        }
    });
    Client::new(service, "default")
}

pub(crate) fn context(
    client: Client,
    config: SweeperConfig,
    pods: Vec<Pod>,
    claims: Vec<PersistentVolumeClaim>,
    statefulsets: Vec<StatefulSet>,
) -> Context {
    Context {
        client,
        config: Arc::new(config),
        pods: store_of(pods),
        claims: store_of(claims),
        statefulsets: store_of(statefulsets),
        pod_queue: Arc::new(WorkQueue::new("pod")),
        claim_queue: Arc::new(WorkQueue::new("claim")),
        set_queue: Arc::new(WorkQueue::new("statefulset")),
    }
}

pub(crate) const STATUS_SUCCESS: &str =
    r#"{"kind":"Status","apiVersion":"v1","metadata":{},"status":"Success"}"#;

pub(crate) const STATUS_NOT_FOUND: &str = r#"{"kind":"Status","apiVersion":"v1","metadata":{},"status":"Failure","message":"not found","reason":"NotFound","code":404}"#;
