use std::sync::Mutex;

use replicant_core::{Action, ActionEmitter, ActionError, CreateRequest, Created, DeleteRequest};
use tracing::info;
use uuid::Uuid;

/// Emitter that performs nothing and reports success, recording what it was asked to do.
#[derive(Debug, Default)]
pub struct DryRunEmitter {
    log: Mutex<Vec<Action>>,
}

impl DryRunEmitter {
    pub fn new() -> Self { Self::default() }

    /// Actions received so far, in arrival order.
    pub fn take(&self) -> Vec<Action> {
        std::mem::take(&mut *self.log.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn record(&self, a: Action) { self.log.lock().unwrap_or_else(|e| e.into_inner()).push(a); }
}

#[async_trait::async_trait]
impl ActionEmitter for DryRunEmitter {
    async fn create(&self, req: &CreateRequest) -> Result<Created, ActionError> {
        let id = Uuid::new_v4();
        let name = format!("{}-{}", req.controller.name, &id.simple().to_string()[..5]);
        info!(kind = %req.kind, ns = %req.namespace, name = %name, labels = %req.labels, "dry-run: create");
        self.record(Action::Create(req.clone()));
        Ok(Created { name, uid: id.into_bytes(), resource_version: "1".to_string() })
    }

    async fn delete(&self, req: &DeleteRequest) -> Result<(), ActionError> {
        info!(target_obj = %req.target, rv = %req.expected_resource_version, "dry-run: delete");
        self.record(Action::Delete(req.clone()));
        Ok(())
    }
}
