//! Per-controller reconciliation state machine.
//!
//! Each controller cycles `Evaluating -> Converged | ActionsPending -> Evaluating`.
//! A pass plans every due controller against a shared `&World` (fanned out over
//! scoped worker threads), then commits the plans sequentially in controller-key
//! order.
//!
//! Victim policy for over-provisioned controllers: matched resources are sorted
//! by `(creation_order, uid)` ascending and the newest excess are deleted, newest
//! first. Long-lived instances are kept. A victim whose delete conflicted is
//! skipped, not replaced, so a spurious 409 delays convergence until that
//! victim's resourceVersion changes or it goes away; resync does not clear it.

use std::cmp::Ordering;
use std::time::Instant;

use replicant_core::{
    Action, ActionError, ActionResult, ChangeEvent, Controller, CreateRequest, DeleteRequest, EventOp, ObjectBody,
    ObjectKey, Outcome, ReconcileError, Resource, Uid,
};
use replicant_store::{Touched, World};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// Below this many due controllers a pass plans inline.
const PARALLEL_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Evaluating,
    Converged,
    ActionsPending,
}

#[derive(Debug, Clone)]
struct ControllerState {
    phase: Phase,
    paused: bool,
    in_flight: usize,
    last_error: Option<ReconcileError>,
}

impl Default for ControllerState {
    fn default() -> Self { Self { phase: Phase::Evaluating, paused: false, in_flight: 0, last_error: None } }
}

/// Result of evaluating one controller against the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub controller: Uid,
    pub actual: usize,
    pub desired: usize,
    pub actions: Vec<Action>,
    pub invalid: bool,
}

/// Read-only inputs shared by every planning worker.
#[derive(Clone, Copy)]
pub struct PlanCtx<'a> {
    pub world: &'a World,
    /// Resources with an in-flight delete; neither counted nor re-targeted.
    pub deleting: &'a FxHashMap<Uid, Uid>,
    /// Resources whose delete conflicted at the recorded resourceVersion.
    pub stale: &'a FxHashMap<Uid, String>,
    pub resource_kind: &'a str,
    pub max_actions: usize,
}

impl PlanCtx<'_> {
    pub fn plan(&self, c: &Controller) -> Plan {
        let desired = c.desired_replicas as usize;
        if c.selector.is_empty() {
            return Plan { controller: c.uid, actual: 0, desired, actions: Vec::new(), invalid: true };
        }
        let mut live: Vec<&Resource> = self
            .world
            .tracked(&c.uid)
            .into_iter()
            .flatten()
            .filter(|u| !self.deleting.contains_key(*u))
            .filter_map(|u| self.world.resource(u))
            .collect();
        let actual = live.len();

        let actions = match actual.cmp(&desired) {
            Ordering::Equal => Vec::new(),
            Ordering::Less => (0..(desired - actual).min(self.max_actions))
                .map(|_| Action::Create(CreateRequest {
                    controller: c.key.clone(),
                    controller_uid: c.uid,
                    kind: self.resource_kind.to_string(),
                    namespace: c.key.namespace.clone(),
                    labels: c.selector.labels().clone(),
                }))
                .collect(),
            Ordering::Greater => {
                live.sort_by(|a, b| (a.creation_order, a.uid).cmp(&(b.creation_order, b.uid)));
                // Newest excess first; a stale victim is skipped, not replaced.
                live.iter()
                    .rev()
                    .take(actual - desired)
                    .filter(|r| self.stale.get(&r.uid) != Some(&r.resource_version))
                    .take(self.max_actions)
                    .map(|r| Action::Delete(DeleteRequest {
                        controller: c.key.clone(),
                        controller_uid: c.uid,
                        target: r.key.clone(),
                        uid: r.uid,
                        expected_resource_version: r.resource_version.clone(),
                    }))
                    .collect()
            }
        };
        Plan { controller: c.uid, actual, desired, actions, invalid: false }
    }
}

/// Status row reported per controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub key: ObjectKey,
    pub selector: String,
    pub matched: usize,
    pub desired: u32,
    pub phase: Phase,
    pub paused: bool,
    pub in_flight: usize,
    pub last_error: Option<String>,
}

pub struct Reconciler {
    states: FxHashMap<Uid, ControllerState>,
    dirty: FxHashSet<Uid>,
    deleting: FxHashMap<Uid, Uid>,
    stale: FxHashMap<Uid, String>,
    resource_kind: String,
    max_actions: usize,
    workers: usize,
}

impl Reconciler {
    pub fn new(resource_kind: impl Into<String>, max_actions: usize, workers: usize) -> Self {
        Self {
            states: FxHashMap::default(),
            dirty: FxHashSet::default(),
            deleting: FxHashMap::default(),
            stale: FxHashMap::default(),
            resource_kind: resource_kind.into(),
            max_actions: max_actions.max(1),
            workers: workers.max(1),
        }
    }

    pub fn phase(&self, controller: &Uid) -> Option<Phase> { self.states.get(controller).map(|s| s.phase) }
    pub fn last_error(&self, controller: &Uid) -> Option<&ReconcileError> {
        self.states.get(controller).and_then(|s| s.last_error.as_ref())
    }
    pub fn in_flight(&self) -> usize { self.states.values().map(|s| s.in_flight).sum() }

    /// Fold a batch's effects in: removed controllers are forgotten, touched
    /// ones become due for evaluation.
    pub fn note(&mut self, touched: &Touched) {
        for uid in touched.removed.iter() {
            self.forget(uid);
        }
        for uid in touched.controllers.iter() {
            self.states.entry(*uid).or_default();
            self.dirty.insert(*uid);
        }
    }

    /// Controller deleted. In-flight delete claims stay until their outcome arrives.
    pub fn forget(&mut self, controller: &Uid) {
        if let Some(st) = self.states.remove(controller) {
            if st.in_flight > 0 {
                debug!(in_flight = st.in_flight, "controller removed with actions in flight; results will be discarded");
            }
        }
        self.dirty.remove(controller);
    }

    /// A new feed batch arrived: controllers paused on store errors may try again.
    pub fn unpause_all(&mut self) {
        for (uid, st) in self.states.iter_mut() {
            if st.paused {
                st.paused = false;
                self.dirty.insert(*uid);
            }
        }
    }

    /// Timer trigger: every controller is re-evaluated.
    pub fn resync(&mut self, world: &World) {
        self.unpause_all();
        for c in world.controllers() {
            self.states.entry(c.uid).or_default();
            self.dirty.insert(c.uid);
        }
    }

    /// Evaluate every due controller and return the actions to emit, in
    /// controller-key order.
    pub fn pass(&mut self, world: &World) -> Vec<Action> {
        let started = Instant::now();
        self.stale.retain(|uid, rv| world.resource(uid).map(|r| r.resource_version == *rv).unwrap_or(false));

        let mut due: Vec<&Controller> = Vec::with_capacity(self.dirty.len());
        let mut vanished = Vec::new();
        for uid in self.dirty.iter() {
            let Some(c) = world.controller(uid) else { vanished.push(*uid); continue };
            let st = self.states.get(uid);
            if st.map(|s| s.paused || s.phase == Phase::ActionsPending).unwrap_or(false) {
                continue;
            }
            due.push(c);
        }
        for uid in vanished { self.forget(&uid); }
        if due.is_empty() {
            return Vec::new();
        }
        due.sort_by(|a, b| a.key.cmp(&b.key));

        let ctx = PlanCtx {
            world,
            deleting: &self.deleting,
            stale: &self.stale,
            resource_kind: &self.resource_kind,
            max_actions: self.max_actions,
        };
        let plans = fan_out(&ctx, &due, self.workers);

        let mut claimed: FxHashSet<Uid> = FxHashSet::default();
        let mut out = Vec::new();
        for plan in plans {
            self.dirty.remove(&plan.controller);
            let st = self.states.entry(plan.controller).or_default();
            if plan.invalid {
                st.phase = Phase::Evaluating;
                st.last_error = Some(ReconcileError::InvalidSelector);
                continue;
            }
            // Overlapping controllers may pick the same victim; first in key order keeps it.
            let actions: Vec<Action> = plan
                .actions
                .into_iter()
                .filter(|a| match a {
                    Action::Delete(d) => claimed.insert(d.uid),
                    Action::Create(_) => true,
                })
                .collect();
            if actions.is_empty() {
                if plan.actual == plan.desired {
                    st.phase = Phase::Converged;
                    st.last_error = None;
                } else {
                    // Nothing actionable now (stale or claimed victims); wait for the next trigger.
                    st.phase = Phase::Evaluating;
                }
                continue;
            }
            for a in actions.iter() {
                if let Action::Delete(d) = a {
                    self.deleting.insert(d.uid, plan.controller);
                }
            }
            st.phase = Phase::ActionsPending;
            st.in_flight = actions.len();
            debug!(actual = plan.actual, desired = plan.desired, actions = actions.len(), "controller out of balance");
            out.extend(actions);
        }

        metrics::counter!("reconcile_passes_total", 1u64);
        metrics::histogram!("reconcile_pass_ms", started.elapsed().as_secs_f64() * 1000.0);
        for a in out.iter() {
            metrics::counter!("reconcile_actions_total", 1u64, "action" => a.verb());
        }
        out
    }

    /// Apply one action outcome. Returns world changes caused by it (a created
    /// resource inserted, a deleted one removed) so the caller can mark owners due.
    pub fn observe(&mut self, world: &mut World, outcome: Outcome) -> Touched {
        let controller = outcome.action.controller_uid();
        if let Action::Delete(d) = &outcome.action {
            self.deleting.remove(&d.uid);
        }
        let label = match &outcome.result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!("reconcile_outcomes_total", 1u64, "result" => label);

        let Some(st) = self.states.get_mut(&controller) else {
            debug!(controller = %outcome.action.controller(), "outcome for deleted controller discarded");
            return Touched::default();
        };
        st.in_flight = st.in_flight.saturating_sub(1);

        let verb = outcome.action.verb();
        let target = outcome.action.target();
        let mut touched = Touched::default();
        match (&outcome.action, outcome.result) {
            (Action::Create(req), Ok(ActionResult::Created(created))) => {
                // The watch may already have delivered the real object.
                if world.resource(&created.uid).is_none() {
                    touched = world.apply_batch([ChangeEvent {
                        op: EventOp::Add,
                        key: ObjectKey::new(req.namespace.clone(), req.kind.clone(), created.name),
                        uid: created.uid,
                        resource_version: created.resource_version,
                        creation_order: None,
                        body: ObjectBody::Resource { labels: req.labels.clone() },
                    }]);
                }
            }
            (Action::Delete(req), Ok(_)) | (Action::Delete(req), Err(ActionError::NotFound(_))) => {
                touched = world.forget_resource(&req.uid);
            }
            (Action::Create(_), Ok(ActionResult::Deleted)) => {
                warn!(object = %target, "emitter answered a create with a delete result");
            }
            (Action::Delete(req), Err(err @ ActionError::Conflict { .. })) => {
                self.stale.insert(req.uid, req.expected_resource_version.clone());
                info!(object = %target, error = %err, "world changed under action; re-evaluating");
                st.last_error = Some(ReconcileError::Action { verb: verb.to_string(), target, source: err });
                self.dirty.insert(controller);
            }
            // A conflicted create waits for the next batch or resync.
            (Action::Create(_), Err(err @ ActionError::Conflict { .. })) => {
                info!(object = %target, error = %err, "create conflicted; controller paused until next batch");
                st.last_error = Some(ReconcileError::Action { verb: verb.to_string(), target, source: err });
                st.paused = true;
            }
            (_, Err(err)) => {
                warn!(object = %target, error = %err, "action failed; controller paused until next batch");
                st.last_error = Some(ReconcileError::Action { verb: verb.to_string(), target, source: err });
                st.paused = true;
            }
        }
        if st.in_flight == 0 {
            st.phase = Phase::Evaluating;
            self.dirty.insert(controller);
        }
        touched
    }

    /// Per-controller `(matched, desired)` report, sorted by key.
    pub fn status(&self, world: &World) -> Vec<ControllerStatus> {
        let mut out: Vec<ControllerStatus> = world
            .controllers()
            .map(|c| {
                let st = self.states.get(&c.uid).cloned().unwrap_or_default();
                ControllerStatus {
                    key: c.key.clone(),
                    selector: c.selector.to_string(),
                    matched: world.tracked(&c.uid).map(|s| s.len()).unwrap_or(0),
                    desired: c.desired_replicas,
                    phase: st.phase,
                    paused: st.paused,
                    in_flight: st.in_flight,
                    last_error: st.last_error.map(|e| e.to_string()),
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

fn fan_out(ctx: &PlanCtx<'_>, due: &[&Controller], workers: usize) -> Vec<Plan> {
    if workers <= 1 || due.len() < PARALLEL_THRESHOLD {
        return due.iter().map(|c| ctx.plan(c)).collect();
    }
    let chunk = due.len().div_ceil(workers);
    std::thread::scope(|s| {
        let handles: Vec<_> = due
            .chunks(chunk)
            .map(|part| s.spawn(move || part.iter().map(|c| ctx.plan(c)).collect::<Vec<_>>()))
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}
