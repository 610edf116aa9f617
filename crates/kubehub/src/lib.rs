//! Replicant kubehub: list+watch wiring for pods and replication controllers,
//! and the emitter that turns reconciler actions into API calls.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Debug;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Pod, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, Resource as KubeResource,
};
use replicant_core::{ChangeEvent, EventOp, FeedEvent, LabelSet, ObjectBody, ObjectClass, ObjectKey, Selector, Uid};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod emitter;

pub use emitter::KubeEmitter;

pub const POD_KIND: &str = "Pod";
pub const RC_KIND: &str = "ReplicationController";

pub(crate) fn to_uid(uid_str: &str) -> Result<Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

fn labels_of(map: Option<&BTreeMap<String, String>>) -> LabelSet {
    map.map(|m| LabelSet::from_pairs(m.iter().map(|(k, v)| (k.as_str(), v.as_str())))).unwrap_or_default()
}

/// Creation timestamp in milliseconds; objects without one fall back to arrival order.
fn creation_order(meta: &ObjectMeta) -> Option<u64> {
    meta.creation_timestamp.as_ref().map(|t| {
        let ts: DateTime<Utc> = t.0;
        ts.timestamp_millis().max(0) as u64
    })
}

fn identity(meta: &ObjectMeta, kind: &str) -> Result<(ObjectKey, Uid, String)> {
    let name = meta.name.clone().ok_or_else(|| anyhow!("{} missing metadata.name", kind))?;
    let uid = to_uid(meta.uid.as_deref().ok_or_else(|| anyhow!("{} {} missing metadata.uid", kind, name))?)?;
    let ns = meta.namespace.clone().unwrap_or_else(|| "default".to_string());
    let rv = meta.resource_version.clone().unwrap_or_default();
    Ok((ObjectKey::new(ns, kind, name), uid, rv))
}

/// Map a pod into a resource event. A pod carrying a deletionTimestamp is
/// already on its way out and is reported as deleted.
pub fn pod_event(pod: &Pod, deleted: bool) -> Result<ChangeEvent> {
    let meta = &pod.metadata;
    let (key, uid, resource_version) = identity(meta, POD_KIND)?;
    let op = if deleted || meta.deletion_timestamp.is_some() { EventOp::Delete } else { EventOp::Update };
    Ok(ChangeEvent {
        op,
        key,
        uid,
        resource_version,
        creation_order: creation_order(meta),
        body: ObjectBody::Resource { labels: labels_of(meta.labels.as_ref()) },
    })
}

/// Map a replication controller. A missing selector defaults to the pod
/// template's labels and missing replicas to 1, as the API server does.
pub fn rc_event(rc: &ReplicationController, deleted: bool) -> Result<ChangeEvent> {
    let meta = &rc.metadata;
    let (key, uid, resource_version) = identity(meta, RC_KIND)?;
    let spec = rc.spec.as_ref();
    let selector_map = spec.and_then(|s| s.selector.as_ref()).or_else(|| {
        spec.and_then(|s| s.template.as_ref()).and_then(|t| t.metadata.as_ref()).and_then(|m| m.labels.as_ref())
    });
    let desired = spec.and_then(|s| s.replicas).unwrap_or(1).max(0) as u32;
    Ok(ChangeEvent {
        op: if deleted { EventOp::Delete } else { EventOp::Update },
        key,
        uid,
        resource_version,
        creation_order: creation_order(meta),
        body: ObjectBody::Controller { selector: Selector::new(labels_of(selector_map)), desired_replicas: desired },
    })
}

async fn send(tx: &mpsc::Sender<FeedEvent>, ev: FeedEvent) -> Result<()> {
    tx.send(ev).await.map_err(|_| anyhow!("engine feed closed"))
}

/// List+watch one object type and forward its changes into the engine feed.
/// Returns when the feed closes; watch errors are logged and the stream resumes.
async fn watch_class<K>(
    api: Api<K>,
    class: ObjectClass,
    map: fn(&K, bool) -> Result<ChangeEvent>,
    tx: mpsc::Sender<FeedEvent>,
) -> Result<()>
where
    K: KubeResource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let label = match class {
        ObjectClass::Resource => "resource",
        ObjectClass::Controller => "controller",
    };
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(class = label, "watcher started");
    loop {
        let ev = match stream.try_next().await {
            Ok(Some(ev)) => ev,
            Ok(None) => break,
            Err(e) => {
                warn!(class = label, error = %e, "watch error; retrying");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };
        match ev {
            Event::Applied(o) => forward(&tx, map(&o, false), label).await?,
            Event::Deleted(o) => forward(&tx, map(&o, true), label).await?,
            Event::Restarted(list) => {
                debug!(class = label, count = list.len(), "watch restart");
                let mut live = Vec::with_capacity(list.len());
                for o in list.iter() {
                    let mapped = map(o, false);
                    if let Ok(ev) = &mapped {
                        live.push(ev.uid);
                    }
                    forward(&tx, mapped, label).await?;
                }
                send(&tx, FeedEvent::Relisted { class, live }).await?;
            }
        }
    }
    warn!(class = label, "watcher stream ended");
    Ok(())
}

async fn forward(tx: &mpsc::Sender<FeedEvent>, mapped: Result<ChangeEvent>, class: &'static str) -> Result<()> {
    match mapped {
        Ok(ev) => {
            metrics::counter!("feed_events_total", 1u64, "class" => class);
            send(tx, ev.into()).await
        }
        Err(e) => {
            warn!(class, error = %e, "skipping unmappable object");
            Ok(())
        }
    }
}

/// Start pod and replication-controller watchers for `namespace` (all
/// namespaces when `None`). Both run until the feed closes or one fails.
pub async fn start_watchers(client: Client, namespace: Option<&str>, tx: mpsc::Sender<FeedEvent>) -> Result<()> {
    let (pods, rcs): (Api<Pod>, Api<ReplicationController>) = match namespace {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    };
    info!(ns = ?namespace, "starting watchers");
    tokio::try_join!(
        watch_class(pods, ObjectClass::Resource, pod_event, tx.clone()),
        watch_class(rcs, ObjectClass::Controller, rc_event, tx),
    )?;
    Ok(())
}
