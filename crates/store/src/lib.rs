//! Replicant store: event coalescing and the in-RAM world (objects, per-namespace
//! label indexes, match sets). Owned by exactly one writer; readers borrow it.

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use replicant_core::{ChangeEvent, Controller, EventOp, ObjectBody, ObjectClass, ObjectKey, Resource, Uid};
use replicant_index::{candidate_set, LabelIndex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

pub mod tracker;

pub use tracker::MatchTracker;

/// Coalescing queue keyed by uid with FIFO order. The last event for a uid
/// wins but keeps the queue position of the first one.
///
/// Nothing is ever dropped: `push` reports when the queue reached its
/// capacity so the caller can flush.
pub struct Coalescer {
    map: FxHashMap<Uid, ChangeEvent>,
    order: VecDeque<Uid>,
    cap: usize,
    coalesced: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), coalesced: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    /// Events that were superseded by a later event for the same uid.
    pub fn coalesced(&self) -> u64 { self.coalesced }

    /// Queue an event. Returns true once the queue is full and must be drained.
    pub fn push(&mut self, ev: ChangeEvent) -> bool {
        let uid = ev.uid;
        if self.map.insert(uid, ev).is_some() {
            self.coalesced += 1;
        } else {
            self.order.push_back(uid);
        }
        self.map.len() >= self.cap
    }

    pub fn drain_ready(&mut self) -> Vec<ChangeEvent> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(uid) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&uid) {
                out.push(ev);
            }
        }
        out
    }
}

/// Controllers affected by a batch.
#[derive(Debug, Default)]
pub struct Touched {
    /// Live controllers needing a reconciliation pass: match set, selector,
    /// desired count or a member's resourceVersion changed.
    pub controllers: FxHashSet<Uid>,
    /// Controllers deleted in the batch.
    pub removed: Vec<Uid>,
    /// Events that changed state (duplicates excluded).
    pub applied: usize,
}

impl Touched {
    pub fn is_empty(&self) -> bool { self.controllers.is_empty() && self.removed.is_empty() }
}

#[derive(Debug, Clone, Copy)]
pub enum ObjectRef<'a> {
    Resource(&'a Resource),
    Controller(&'a Controller),
}

/// The engine's derived view of the store's population.
#[derive(Debug, Default)]
pub struct World {
    resources: FxHashMap<Uid, Resource>,
    controllers: FxHashMap<Uid, Controller>,
    keys: FxHashMap<ObjectKey, Uid>,
    indexes: FxHashMap<String, LabelIndex>,
    tracker: MatchTracker,
    next_order: u64,
    epoch: u64,
}

impl World {
    pub fn new() -> Self { Self::default() }

    /// Number of applied batches.
    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn resource(&self, uid: &Uid) -> Option<&Resource> { self.resources.get(uid) }
    pub fn controller(&self, uid: &Uid) -> Option<&Controller> { self.controllers.get(uid) }
    pub fn resources(&self) -> impl Iterator<Item = &Resource> + '_ { self.resources.values() }
    pub fn controllers(&self) -> impl Iterator<Item = &Controller> + '_ { self.controllers.values() }
    pub fn resource_count(&self) -> usize { self.resources.len() }

    /// Find an object by `(namespace, kind, name)`.
    pub fn lookup(&self, key: &ObjectKey) -> Option<ObjectRef<'_>> {
        let uid = self.keys.get(key)?;
        if let Some(c) = self.controllers.get(uid) {
            return Some(ObjectRef::Controller(c));
        }
        self.resources.get(uid).map(ObjectRef::Resource)
    }

    /// Current match set of a controller.
    pub fn tracked(&self, controller: &Uid) -> Option<&FxHashSet<Uid>> { self.tracker.tracked(controller) }

    /// Controllers whose match set holds `resource`.
    pub fn owners_of(&self, resource: &Uid) -> &[Uid] { self.tracker.owners_of(resource) }

    /// Match set recomputed from scratch against the controller's namespace index.
    pub fn candidate_set_for(&self, controller: &Uid) -> FxHashSet<Uid> {
        let Some(c) = self.controllers.get(controller) else { return FxHashSet::default() };
        self.indexes.get(&c.key.namespace).map(|i| candidate_set(&c.selector, i)).unwrap_or_default()
    }

    /// Apply one batch of events in order, then bump the epoch.
    pub fn apply_batch<I: IntoIterator<Item = ChangeEvent>>(&mut self, batch: I) -> Touched {
        let mut touched = Touched::default();
        let mut seen = 0usize;
        for ev in batch {
            seen += 1;
            if self.apply(&ev, &mut touched) {
                touched.applied += 1;
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        self.publish_gauges();
        debug!(epoch = self.epoch, events = seen, applied = touched.applied, touched = touched.controllers.len(), "batch applied");
        touched
    }

    /// A watch relisted every object of `class`: anything not in `live` is gone.
    pub fn relist(&mut self, class: ObjectClass, live: &[Uid]) -> Touched {
        let live: FxHashSet<&Uid> = live.iter().collect();
        let gone: Vec<Uid> = match class {
            ObjectClass::Resource => self.resources.keys().filter(|u| !live.contains(u)).copied().collect(),
            ObjectClass::Controller => self.controllers.keys().filter(|u| !live.contains(u)).copied().collect(),
        };
        let mut touched = Touched::default();
        for uid in gone.iter() {
            let removed = match class {
                ObjectClass::Resource => self.remove_resource(uid, &mut touched),
                ObjectClass::Controller => self.remove_controller(uid, &mut touched),
            };
            if removed { touched.applied += 1; }
        }
        self.epoch = self.epoch.saturating_add(1);
        self.publish_gauges();
        debug!(?class, live = live.len(), removed = gone.len(), "relist reconciled");
        touched
    }

    /// Drop a resource the engine knows is gone (e.g. its delete was confirmed).
    pub fn forget_resource(&mut self, uid: &Uid) -> Touched {
        let mut touched = Touched::default();
        if self.remove_resource(uid, &mut touched) { touched.applied += 1; }
        touched
    }

    fn apply(&mut self, ev: &ChangeEvent, touched: &mut Touched) -> bool {
        match (ev.op, &ev.body) {
            (EventOp::Delete, ObjectBody::Resource { .. }) => self.remove_resource(&ev.uid, touched),
            (EventOp::Delete, ObjectBody::Controller { .. }) => self.remove_controller(&ev.uid, touched),
            (_, ObjectBody::Resource { .. }) => self.upsert_resource(ev, touched),
            (_, ObjectBody::Controller { .. }) => self.upsert_controller(ev, touched),
        }
    }

    fn upsert_resource(&mut self, ev: &ChangeEvent, touched: &mut Touched) -> bool {
        let ObjectBody::Resource { labels } = &ev.body else { return false };
        if let Some(cur) = self.resources.get(&ev.uid) {
            if cur.resource_version == ev.resource_version && cur.labels == *labels && cur.key == ev.key {
                trace!(key = %ev.key, "duplicate resource event");
                return false;
            }
            if cur.key.namespace != ev.key.namespace {
                self.remove_resource(&ev.uid, touched);
            }
        }

        let prev_order = self.resources.get(&ev.uid).map(|r| r.creation_order);
        let creation_order = prev_order.or(ev.creation_order).unwrap_or(self.next_order);
        self.next_order = self.next_order.max(creation_order.saturating_add(1));

        let ns = ev.key.namespace.as_str();
        let old = self.indexes.entry(ns.to_string()).or_default().upsert(ev.uid, labels);
        touched.controllers.extend(self.tracker.resource_changed(ev.uid, ns, old.as_ref(), labels));
        // A version-only change still matters to controllers holding the resource.
        touched.controllers.extend(self.tracker.owners_of(&ev.uid).iter().copied());

        if let Some(prev) = self.resources.get(&ev.uid) {
            if prev.key != ev.key && self.keys.get(&prev.key) == Some(&ev.uid) {
                self.keys.remove(&prev.key);
            }
        }
        self.keys.insert(ev.key.clone(), ev.uid);
        self.resources.insert(ev.uid, Resource {
            key: ev.key.clone(),
            uid: ev.uid,
            resource_version: ev.resource_version.clone(),
            creation_order,
            labels: labels.clone(),
        });
        true
    }

    fn remove_resource(&mut self, uid: &Uid, touched: &mut Touched) -> bool {
        let Some(r) = self.resources.remove(uid) else { return false };
        if let Some(idx) = self.indexes.get_mut(&r.key.namespace) {
            idx.remove(uid);
            if idx.is_empty() { self.indexes.remove(&r.key.namespace); }
        }
        touched.controllers.extend(self.tracker.resource_removed(uid));
        if self.keys.get(&r.key) == Some(uid) {
            self.keys.remove(&r.key);
        }
        true
    }

    fn upsert_controller(&mut self, ev: &ChangeEvent, touched: &mut Touched) -> bool {
        let ObjectBody::Controller { selector, desired_replicas } = &ev.body else { return false };
        if let Some(cur) = self.controllers.get(&ev.uid) {
            if cur.resource_version == ev.resource_version
                && cur.selector == *selector
                && cur.desired_replicas == *desired_replicas
                && cur.key == ev.key
            {
                trace!(key = %ev.key, "duplicate controller event");
                return false;
            }
            if cur.key != ev.key && self.keys.get(&cur.key) == Some(&ev.uid) {
                let stale = cur.key.clone();
                self.keys.remove(&stale);
            }
        }
        let ns = ev.key.namespace.as_str();
        self.tracker.upsert_controller(ev.uid, ns, selector, self.indexes.get(ns));
        self.keys.insert(ev.key.clone(), ev.uid);
        self.controllers.insert(ev.uid, Controller {
            key: ev.key.clone(),
            uid: ev.uid,
            resource_version: ev.resource_version.clone(),
            selector: selector.clone(),
            desired_replicas: *desired_replicas,
        });
        touched.controllers.insert(ev.uid);
        true
    }

    fn remove_controller(&mut self, uid: &Uid, touched: &mut Touched) -> bool {
        let Some(c) = self.controllers.remove(uid) else { return false };
        self.tracker.remove_controller(uid);
        if self.keys.get(&c.key) == Some(uid) {
            self.keys.remove(&c.key);
        }
        touched.controllers.remove(uid);
        touched.removed.push(*uid);
        true
    }

    fn publish_gauges(&self) {
        metrics::gauge!("world_resources", self.resources.len() as f64);
        metrics::gauge!("tracker_controllers", self.tracker.len() as f64);
        metrics::gauge!("index_pairs", self.indexes.values().map(|i| i.pairs()).sum::<usize>() as f64);
    }
}
