//! Mock population in the shape of the kube client test fixture: pods
//! `mock-0..mock-N` labeled `{tag: silly, type: even|odd, factor3: yes|no}` plus
//! two replication controllers selecting subsets of them.

use replicant_core::{ChangeEvent, EventOp, FeedEvent, LabelSet, ObjectBody, ObjectKey, Selector, Uid};

pub const NAMESPACE: &str = "default";
pub const POD_KIND: &str = "Pod";
pub const CONTROLLER_KIND: &str = "ReplicationController";

pub fn resource_uid(n: u64) -> Uid {
    let mut u = [0u8; 16];
    u[8..].copy_from_slice(&n.to_be_bytes());
    u
}

pub fn controller_uid(n: u64) -> Uid {
    let mut u = resource_uid(n);
    u[0] = 0x11;
    u
}

pub fn mock_labels(n: u64) -> LabelSet {
    LabelSet::from_pairs([
        ("tag", "silly"),
        ("type", if n % 2 == 0 { "even" } else { "odd" }),
        ("factor3", if n % 3 == 0 { "yes" } else { "no" }),
    ])
}

/// `mock-<n>`, created in numeric order.
pub fn pod(n: u64) -> ChangeEvent {
    ChangeEvent {
        op: EventOp::Add,
        key: ObjectKey::new(NAMESPACE, POD_KIND, format!("mock-{}", n)),
        uid: resource_uid(n),
        resource_version: "1".to_string(),
        creation_order: Some(n),
        body: ObjectBody::Resource { labels: mock_labels(n) },
    }
}

pub fn pods(count: u64) -> Vec<FeedEvent> {
    (0..count).map(|n| FeedEvent::Change(pod(n))).collect()
}

/// Controller event; an unparsable selector string becomes the empty selector.
pub fn controller(name: &str, n: u64, selector: &str, desired: u32) -> ChangeEvent {
    ChangeEvent {
        op: EventOp::Add,
        key: ObjectKey::new(NAMESPACE, CONTROLLER_KIND, name),
        uid: controller_uid(n),
        resource_version: "10000".to_string(),
        creation_order: None,
        body: ObjectBody::Controller {
            selector: selector.parse::<Selector>().unwrap_or_default(),
            desired_replicas: desired,
        },
    }
}

pub fn odd_controller() -> ChangeEvent { controller("oddcontroller", 1, "tag=silly,type=odd", 1) }
pub fn three_controller() -> ChangeEvent { controller("3controller", 2, "factor3=yes", 1) }

/// The full fixture: `count` pods followed by both controllers.
pub fn population(count: u64) -> Vec<FeedEvent> {
    let mut out = pods(count);
    out.push(odd_controller().into());
    out.push(three_controller().into());
    out
}

/// Delete event for `mock-<n>`.
pub fn delete_pod(n: u64) -> ChangeEvent {
    let mut ev = pod(n);
    ev.op = EventOp::Delete;
    ev.resource_version = "2".to_string();
    ev
}
