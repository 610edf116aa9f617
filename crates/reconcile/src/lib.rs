//! Replicant reconciler: per-controller replica-count state machine plus the
//! engine task that feeds it from the store's change stream.

#![forbid(unsafe_code)]

pub mod config;
pub mod emit;
pub mod engine;
pub mod fixture;
pub mod reconciler;

pub use config::EngineConfig;
pub use emit::DryRunEmitter;
pub use engine::{spawn_engine, EngineHandle, StatusSnapshot};
pub use reconciler::{ControllerStatus, Phase, Plan, PlanCtx, Reconciler};
