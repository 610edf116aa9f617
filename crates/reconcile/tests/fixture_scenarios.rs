use replicant_core::{Action, ActionResult, Created, FeedEvent, Outcome};
use replicant_reconcile::fixture::{self, controller_uid, resource_uid};
use replicant_reconcile::{Phase, Reconciler};
use replicant_store::World;

fn load(world: &mut World, reconciler: &mut Reconciler, events: Vec<FeedEvent>) {
    let changes = events.into_iter().filter_map(|e| match e {
        FeedEvent::Change(c) => Some(c),
        FeedEvent::Relisted { .. } => None,
    });
    let touched = world.apply_batch(changes);
    reconciler.note(&touched);
}

/// Report success for every action, creating resources with fresh uids.
fn succeed_all(world: &mut World, reconciler: &mut Reconciler, actions: Vec<Action>, next_uid: &mut u64) {
    for action in actions {
        let result = match &action {
            Action::Create(req) => {
                *next_uid += 1;
                Ok(ActionResult::Created(Created {
                    name: format!("{}-{}", req.controller.name, next_uid),
                    uid: resource_uid(*next_uid),
                    resource_version: "1".into(),
                }))
            }
            Action::Delete(_) => Ok(ActionResult::Deleted),
        };
        let touched = reconciler.observe(world, Outcome { action, result });
        reconciler.note(&touched);
    }
}

fn delete_targets(actions: &[Action]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Delete(d) => Some(d.target.name.clone()),
            Action::Create(_) => None,
        })
        .collect()
}

#[test]
fn oddcontroller_alone_deletes_newest_odd_pods() {
    let mut w = World::new();
    let mut r = Reconciler::new("Pod", 1000, 4);
    let mut events = fixture::pods(1000);
    events.push(fixture::odd_controller().into());
    load(&mut w, &mut r, events);

    let actions = r.pass(&w);
    let targets = delete_targets(&actions);
    assert_eq!(actions.len(), 499);
    assert_eq!(targets.first().map(String::as_str), Some("mock-999"));
    assert_eq!(targets.last().map(String::as_str), Some("mock-3"));
    assert!(!targets.iter().any(|t| t == "mock-1"));
    assert_eq!(r.phase(&controller_uid(1)), Some(Phase::ActionsPending));

    let mut next = 10_000;
    succeed_all(&mut w, &mut r, actions, &mut next);
    assert!(r.pass(&w).is_empty());
    assert_eq!(r.phase(&controller_uid(1)), Some(Phase::Converged));
    assert_eq!(w.resource_count(), 501);
    assert!(w.resource(&resource_uid(1)).is_some());
}

#[test]
fn three_controller_alone_keeps_mock_0() {
    let mut w = World::new();
    let mut r = Reconciler::new("Pod", 1000, 1);
    let mut events = fixture::pods(1000);
    events.push(fixture::three_controller().into());
    load(&mut w, &mut r, events);

    let actions = r.pass(&w);
    let targets = delete_targets(&actions);
    assert_eq!(targets.len(), 333);
    assert_eq!(targets[0], "mock-999");
    assert!(!targets.iter().any(|t| t == "mock-0"));
}

#[test]
fn both_controllers_converge_without_double_deletes() {
    let mut w = World::new();
    let mut r = Reconciler::new("Pod", 1000, 4);
    load(&mut w, &mut r, fixture::population(1000));

    let actions = r.pass(&w);
    // 333 from 3controller, then the 499 odd victims minus the 167 odd multiples of 3 already claimed.
    assert_eq!(actions.len(), 333 + 332);
    let mut next = 10_000;
    succeed_all(&mut w, &mut r, actions, &mut next);

    assert!(r.pass(&w).is_empty());
    for c in r.status(&w) {
        assert_eq!(c.matched, 1, "{}", c.key);
        assert_eq!(c.phase, Phase::Converged);
        assert_eq!(c.in_flight, 0);
    }
    assert!(w.resource(&resource_uid(0)).is_some());
    assert!(w.resource(&resource_uid(1)).is_some());
    // evens that are not multiples of 3 were never selected
    assert!(w.resource(&resource_uid(998)).is_some());
    assert!(w.resource(&resource_uid(999)).is_none());
}

#[test]
fn deleting_mock_1_reprovisions_only_oddcontroller() {
    let mut w = World::new();
    let mut r = Reconciler::new("Pod", 1000, 1);
    load(&mut w, &mut r, fixture::population(1000));
    let mut next = 10_000;
    let actions = r.pass(&w);
    succeed_all(&mut w, &mut r, actions, &mut next);
    assert!(r.pass(&w).is_empty());

    load(&mut w, &mut r, vec![fixture::delete_pod(1).into()]);
    let actions = r.pass(&w);
    assert_eq!(actions.len(), 1);
    match &actions[0] {
        Action::Create(req) => {
            assert_eq!(req.controller.name, "oddcontroller");
            assert_eq!(req.labels.to_string(), "tag=silly,type=odd");
            assert_eq!(req.namespace, fixture::NAMESPACE);
        }
        other => panic!("expected create, got {:?}", other),
    }
    succeed_all(&mut w, &mut r, actions, &mut next);
    assert!(r.pass(&w).is_empty());
    assert_eq!(w.tracked(&controller_uid(1)).map(|s| s.len()), Some(1));
    assert_eq!(w.tracked(&controller_uid(2)).map(|s| s.len()), Some(1));
}

#[test]
fn duplicate_delivery_plans_identical_actions() {
    let mut once_w = World::new();
    let mut once_r = Reconciler::new("Pod", 1000, 1);
    load(&mut once_w, &mut once_r, fixture::population(200));

    let mut twice_w = World::new();
    let mut twice_r = Reconciler::new("Pod", 1000, 1);
    load(&mut twice_w, &mut twice_r, fixture::population(200));
    load(&mut twice_w, &mut twice_r, fixture::population(200));

    assert_eq!(once_r.pass(&once_w), twice_r.pass(&twice_w));
}

#[test]
fn parallel_planning_matches_sequential() {
    let mut events = fixture::pods(400);
    for n in 0..100u64 {
        let sel = format!("tag=silly,factor3={}", if n % 2 == 0 { "yes" } else { "no" });
        events.push(fixture::controller(&format!("rc-{:03}", n), 100 + n, &sel, (n % 7) as u32).into());
    }
    let mut seq_w = World::new();
    let mut seq_r = Reconciler::new("Pod", 50, 1);
    load(&mut seq_w, &mut seq_r, events.clone());
    let mut par_w = World::new();
    let mut par_r = Reconciler::new("Pod", 50, 8);
    load(&mut par_w, &mut par_r, events);

    let seq = seq_r.pass(&seq_w);
    assert!(!seq.is_empty());
    assert_eq!(seq, par_r.pass(&par_w));
}
