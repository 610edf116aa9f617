//! Engine ingest loop: feed events -> coalescer -> world -> reconciliation pass
//! -> emitter. One task owns all mutable state; emitted actions run as detached
//! tasks and report back through an outcome channel.

use std::sync::Arc;

use arc_swap::ArcSwap;
use replicant_core::{Action, ActionEmitter, ActionResult, FeedEvent, ObjectClass, Outcome, Uid};
use replicant_store::{Coalescer, World};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::reconciler::{ControllerStatus, Reconciler};

/// Point-in-time engine report, replaced after every flush.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Publication sequence number.
    pub epoch: u64,
    /// Number of batches applied to the world.
    pub world_epoch: u64,
    pub resources: usize,
    pub in_flight: usize,
    pub controllers: Vec<ControllerStatus>,
}

/// Handle for readers to access the latest status and subscribe to changes.
pub struct EngineHandle {
    snap: Arc<ArcSwap<StatusSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn current(&self) -> Arc<StatusSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait for the engine to stop (feed closed and all in-flight actions
    /// reported) and return the final status.
    pub async fn stopped(self) -> Arc<StatusSnapshot> {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "engine task failed");
        }
        self.snap.load_full()
    }
}

struct Engine {
    world: World,
    reconciler: Reconciler,
    coalescer: Coalescer,
    outcomes: Vec<Outcome>,
    in_flight: usize,
    // Set when a relist or resync must run a pass even without new events.
    kick: bool,
    emitter: Arc<dyn ActionEmitter>,
    outcome_tx: mpsc::UnboundedSender<Outcome>,
    snap: Arc<ArcSwap<StatusSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    published: u64,
}

impl Engine {
    fn idle(&self) -> bool { self.in_flight == 0 && self.outcomes.is_empty() && self.coalescer.is_empty() }

    fn flush(&mut self) {
        let batch = self.coalescer.drain_ready();
        let outcomes = std::mem::take(&mut self.outcomes);
        if batch.is_empty() && outcomes.is_empty() && !self.kick {
            return;
        }
        self.kick = false;

        if !batch.is_empty() {
            metrics::histogram!("ingest_batch_events", batch.len() as f64);
            let touched = self.world.apply_batch(batch);
            self.reconciler.unpause_all();
            self.reconciler.note(&touched);
        }
        for o in outcomes {
            self.in_flight = self.in_flight.saturating_sub(1);
            let touched = self.reconciler.observe(&mut self.world, o);
            self.reconciler.note(&touched);
        }
        let actions = self.reconciler.pass(&self.world);
        self.dispatch(actions);
        self.publish();
    }

    fn relist(&mut self, class: ObjectClass, live: &[Uid]) {
        self.flush();
        let touched = self.world.relist(class, live);
        self.reconciler.note(&touched);
        self.kick = true;
        self.flush();
    }

    fn resync(&mut self) {
        debug!("resync: re-evaluating all controllers");
        self.reconciler.resync(&self.world);
        self.kick = true;
        self.flush();
    }

    fn dispatch(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.in_flight += 1;
            let emitter = Arc::clone(&self.emitter);
            let tx = self.outcome_tx.clone();
            tokio::spawn(async move {
                let result = match &action {
                    Action::Create(req) => emitter.create(req).await.map(ActionResult::Created),
                    Action::Delete(req) => emitter.delete(req).await.map(|_| ActionResult::Deleted),
                };
                // Receiver only goes away when the engine stopped; nothing to report then.
                let _ = tx.send(Outcome { action, result });
            });
        }
    }

    fn publish(&mut self) {
        self.published += 1;
        let next = StatusSnapshot {
            epoch: self.published,
            world_epoch: self.world.epoch(),
            resources: self.world.resource_count(),
            in_flight: self.in_flight,
            controllers: self.reconciler.status(&self.world),
        };
        self.snap.store(Arc::new(next));
        let _ = self.epoch_tx.send(self.published);
    }
}

/// Spawn the engine task. Returns the feed sender and a handle for status reads.
/// Dropping every sender stops the engine once in-flight actions have reported.
pub fn spawn_engine(cfg: EngineConfig, emitter: Arc<dyn ActionEmitter>) -> (mpsc::Sender<FeedEvent>, EngineHandle) {
    let (tx, mut rx) = mpsc::channel::<FeedEvent>(cfg.queue_cap.max(1));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<Outcome>();
    let snap = Arc::new(ArcSwap::from_pointee(StatusSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);

    let mut engine = Engine {
        world: World::new(),
        reconciler: Reconciler::new(cfg.resource_kind.clone(), cfg.max_actions_per_pass, cfg.workers),
        coalescer: Coalescer::with_capacity(cfg.queue_cap),
        outcomes: Vec::new(),
        in_flight: 0,
        kick: false,
        emitter,
        outcome_tx,
        snap: Arc::clone(&snap),
        epoch_tx,
        published: 0,
    };

    let task = tokio::spawn(async move {
        let mut ticker = interval(cfg.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let resync_every = cfg.resync_interval;
        let period = resync_every.unwrap_or(cfg.flush_interval);
        let mut resync = interval_at(Instant::now() + period, period);
        let mut feed_open = true;
        info!(workers = cfg.workers, max_actions = cfg.max_actions_per_pass, "engine started");

        loop {
            tokio::select! {
                maybe = rx.recv(), if feed_open => {
                    match maybe {
                        Some(FeedEvent::Change(ev)) => {
                            if engine.coalescer.push(ev) { engine.flush(); }
                        }
                        Some(FeedEvent::Relisted { class, live }) => engine.relist(class, &live),
                        None => {
                            debug!("feed closed; draining in-flight actions");
                            feed_open = false;
                            engine.flush();
                        }
                    }
                }
                Some(outcome) = outcome_rx.recv() => engine.outcomes.push(outcome),
                _ = ticker.tick() => engine.flush(),
                _ = resync.tick(), if resync_every.is_some() => engine.resync(),
            }
            if !feed_open && engine.idle() {
                break;
            }
        }
        info!(published = engine.published, "engine stopped");
    });

    (tx, EngineHandle { snap, epoch_rx, task })
}
